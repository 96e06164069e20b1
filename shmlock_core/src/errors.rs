//! Error handling and C-ABI error codes for shmlock

use shared_memory::ShmemError;
use std::cell::RefCell;
use std::os::raw::c_char;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by the segment allocator and every lock manager backend.
#[derive(Error, Debug)]
pub enum Error {
    #[error("number of locks must be greater than 0")]
    ZeroCapacity,

    /// Deliberately not phrased like ENOSPC: operators read "no space left on
    /// device" and go check their disks.
    #[error("allocation failed; exceeded num_locks ({num_locks}), no free lock slots remain")]
    CapacityExhausted { num_locks: u32 },

    #[error("lock {0} is already allocated")]
    AlreadyAllocated(u32),

    #[error("lock {0} is not allocated")]
    NotAllocated(u32),

    #[error("lock {id} is out of range (maximum locks count {num_locks})")]
    OutOfRange { id: u32, num_locks: u32 },

    #[error("lock segment holds {actual} locks but {expected} were configured; renumber locks after changing the lock count")]
    SegmentShapeMismatch { expected: u32, actual: u32 },

    #[error("shared memory segment {0} is not a lock segment or is corrupt")]
    ForeignSegment(String),

    #[error("shared memory segment {0} already exists")]
    SegmentExists(String),

    #[error("shared memory segment {0} does not exist")]
    SegmentNotFound(String),

    #[error("invalid shared memory name {0:?}")]
    InvalidPath(String),

    #[error("invalid lock configuration: {0}")]
    InvalidConfig(String),

    #[error("lock directory {0} already exists")]
    LockDirExists(PathBuf),

    #[error("lock directory {0} does not exist")]
    LockDirNotFound(PathBuf),

    #[error("lock {0} was not locked by this thread")]
    NotLocked(u32),

    #[error("{0} is not implemented by this lock backend")]
    NotImplemented(&'static str),

    #[error("unrecoverable lock state: {0}")]
    Unrecoverable(String),

    #[error("shared memory: {0:?}")]
    Shmem(ShmemError),

    #[error("{op} failed: {errno}")]
    Os { op: &'static str, errno: errno::Errno },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ShmemError> for Error {
    fn from(e: ShmemError) -> Self {
        Error::Shmem(e)
    }
}

impl Error {
    /// Build an `Os` error from a positive errno value returned by a pthread call.
    pub fn os(op: &'static str, code: i32) -> Self {
        Error::Os { op, errno: errno::Errno(code) }
    }

    /// Build an `Os` error from the calling thread's current `errno`.
    pub fn last_os(op: &'static str) -> Self {
        Error::Os { op, errno: errno::errno() }
    }

    /// True for the sentinel used by backends that cannot answer a query, so
    /// callers can skip diagnostics instead of failing.
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Error::NotImplemented(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    ZeroCapacity = 1,
    CapacityExhausted = 2,
    AlreadyAllocated = 3,
    NotAllocated = 4,
    OutOfRange = 5,
    ShapeMismatch = 6,
    ForeignSegment = 7,
    SegmentExists = 8,
    SegmentNotFound = 9,
    InvalidPath = 10,
    InvalidHandle = 11,
    Utf8Error = 12,
    NotLocked = 13,
    NotImplemented = 14,
    Unrecoverable = 15,
    OsError = 16,
    InvalidConfig = 17,
    Unknown = 255,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        self.as_cstr().to_str().unwrap_or("Unknown error")
    }

    fn as_cstr(self) -> &'static std::ffi::CStr {
        match self {
            ErrorCode::Success => c"Success",
            ErrorCode::ZeroCapacity => c"Zero capacity",
            ErrorCode::CapacityExhausted => c"No free lock slots remain",
            ErrorCode::AlreadyAllocated => c"Lock already allocated",
            ErrorCode::NotAllocated => c"Lock not allocated",
            ErrorCode::OutOfRange => c"Lock ID out of range",
            ErrorCode::ShapeMismatch => c"Lock segment size mismatch",
            ErrorCode::ForeignSegment => c"Not a lock segment",
            ErrorCode::SegmentExists => c"Lock segment already exists",
            ErrorCode::SegmentNotFound => c"Lock segment not found",
            ErrorCode::InvalidPath => c"Invalid segment name",
            ErrorCode::InvalidHandle => c"Invalid handle",
            ErrorCode::Utf8Error => c"UTF-8 conversion error",
            ErrorCode::NotLocked => c"Lock was not locked",
            ErrorCode::NotImplemented => c"Not implemented",
            ErrorCode::Unrecoverable => c"Unrecoverable lock state",
            ErrorCode::OsError => c"Operating system error",
            ErrorCode::InvalidConfig => c"Invalid configuration",
            ErrorCode::Unknown => c"Unknown error",
        }
    }
}

// Thread-local last error for C-ABI
thread_local! {
    static LAST_ERROR: RefCell<ErrorCode> = const { RefCell::new(ErrorCode::Success) };
}

pub fn set_last_error(code: ErrorCode) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = code);
}

pub fn get_last_error() -> ErrorCode {
    LAST_ERROR.with(|cell| *cell.borrow())
}

#[no_mangle]
pub extern "C" fn shmlock_last_error() -> ErrorCode {
    get_last_error()
}

#[no_mangle]
pub extern "C" fn shmlock_strerror(code: ErrorCode) -> *const c_char {
    code.as_cstr().as_ptr()
}

// Map internal Error to ErrorCode
pub fn map_error(e: &Error) -> ErrorCode {
    use Error::*;
    match e {
        ZeroCapacity => ErrorCode::ZeroCapacity,
        CapacityExhausted { .. } => ErrorCode::CapacityExhausted,
        AlreadyAllocated(_) => ErrorCode::AlreadyAllocated,
        NotAllocated(_) => ErrorCode::NotAllocated,
        OutOfRange { .. } => ErrorCode::OutOfRange,
        SegmentShapeMismatch { .. } => ErrorCode::ShapeMismatch,
        ForeignSegment(_) => ErrorCode::ForeignSegment,
        SegmentExists(_) => ErrorCode::SegmentExists,
        SegmentNotFound(_) | LockDirNotFound(_) => ErrorCode::SegmentNotFound,
        InvalidPath(_) => ErrorCode::InvalidPath,
        NotLocked(_) => ErrorCode::NotLocked,
        NotImplemented(_) => ErrorCode::NotImplemented,
        Unrecoverable(_) => ErrorCode::Unrecoverable,
        Os { .. } | Io(_) | Shmem(_) => ErrorCode::OsError,
        LockDirExists(_) => ErrorCode::SegmentExists,
        InvalidConfig(_) => ErrorCode::InvalidConfig,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_message_is_not_a_disk_error() {
        let msg = Error::CapacityExhausted { num_locks: 32 }.to_string();
        assert!(msg.contains("num_locks (32)"));
        assert!(!msg.to_lowercase().contains("space left on device"));
    }

    #[test]
    fn shape_mismatch_names_both_counts() {
        let msg = Error::SegmentShapeMismatch { expected: 64, actual: 2048 }.to_string();
        assert!(msg.contains("64"));
        assert!(msg.contains("2048"));
    }

    #[test]
    fn not_implemented_is_distinguishable() {
        assert!(Error::NotImplemented("locks_held").is_not_implemented());
        assert!(!Error::NotLocked(3).is_not_implemented());
    }

    #[test]
    fn codes_round_trip_through_last_error() {
        set_last_error(map_error(&Error::AlreadyAllocated(7)));
        assert_eq!(get_last_error(), ErrorCode::AlreadyAllocated);
        assert_eq!(ErrorCode::AlreadyAllocated.as_str(), "Lock already allocated");
        set_last_error(ErrorCode::Success);
    }
}
