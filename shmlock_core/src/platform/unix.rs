//! Unix-specific platform code for shmlock

use crate::errors::{Error, Result};
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

#[cfg(target_os = "linux")]
pub use self::robust::{LockState, MutexAttr, RobustMutex, TryLockState};

/// Remove a POSIX shared memory name. Mappings that are still open stay valid
/// until they are unmapped.
pub fn platform_drop(os_id: &str) -> Result<()> {
    use std::ffi::CString;
    let c_name = CString::new(os_id).map_err(|_| Error::InvalidPath(os_id.to_string()))?;
    // SAFETY: `c_name` is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::shm_unlink(c_name.as_ptr()) };
    if rc != 0 {
        let err = errno::errno();
        if err.0 == libc::ENOENT {
            return Err(Error::SegmentNotFound(os_id.to_string()));
        }
        return Err(Error::Os { op: "shm_unlink", errno: err });
    }
    Ok(())
}

/// Acquire an exclusive `flock` on the given file, blocking until it is available.
pub fn flock_exclusive(file: &File) -> io::Result<()> {
    loop {
        // SAFETY: the descriptor belongs to `file`, which outlives the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Release a `flock` held on the given file.
pub fn flock_release(file: &File) -> io::Result<()> {
    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(target_os = "linux")]
mod robust {
    use crate::errors::{Error, Result};
    use core::cell::UnsafeCell;
    use libc::{
        pthread_mutex_consistent, pthread_mutex_init, pthread_mutex_lock, pthread_mutex_t,
        pthread_mutex_trylock, pthread_mutex_unlock, pthread_mutexattr_destroy,
        pthread_mutexattr_init, pthread_mutexattr_setpshared, pthread_mutexattr_setrobust,
        pthread_mutexattr_settype, pthread_mutexattr_t, EAGAIN, EBUSY, EOWNERDEAD,
        PTHREAD_MUTEX_NORMAL, PTHREAD_MUTEX_ROBUST, PTHREAD_PROCESS_SHARED,
    };
    use std::mem::MaybeUninit;

    /// Outcome of a successful acquire.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum LockState {
        Acquired,
        /// The previous owner died holding the mutex; it was marked consistent
        /// and now belongs to the caller.
        Recovered,
    }

    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum TryLockState {
        Acquired(LockState),
        Busy,
    }

    /// Attributes shared by every mutex in a segment: process-shared, robust
    /// to owner death, and non-recursive.
    pub struct MutexAttr {
        attr: MaybeUninit<pthread_mutexattr_t>,
    }

    impl MutexAttr {
        pub fn new() -> Result<Self> {
            let mut attr = MaybeUninit::<pthread_mutexattr_t>::uninit();
            // SAFETY: `attr` is initialised by pthread_mutexattr_init before any other use.
            unsafe {
                let rc = pthread_mutexattr_init(attr.as_mut_ptr());
                if rc != 0 {
                    return Err(Error::os("pthread_mutexattr_init", rc));
                }
                let mut this = MutexAttr { attr };
                // Recursive locking by the same thread must block, not nest.
                let rc = pthread_mutexattr_settype(this.attr.as_mut_ptr(), PTHREAD_MUTEX_NORMAL);
                if rc != 0 {
                    return Err(Error::os("pthread_mutexattr_settype", rc));
                }
                let rc =
                    pthread_mutexattr_setpshared(this.attr.as_mut_ptr(), PTHREAD_PROCESS_SHARED);
                if rc != 0 {
                    return Err(Error::os("pthread_mutexattr_setpshared", rc));
                }
                let rc = pthread_mutexattr_setrobust(this.attr.as_mut_ptr(), PTHREAD_MUTEX_ROBUST);
                if rc != 0 {
                    return Err(Error::os("pthread_mutexattr_setrobust", rc));
                }
                Ok(this)
            }
        }

        fn as_ptr(&self) -> *const pthread_mutexattr_t {
            self.attr.as_ptr()
        }
    }

    impl Drop for MutexAttr {
        fn drop(&mut self) {
            // SAFETY: only constructed after a successful pthread_mutexattr_init.
            unsafe {
                pthread_mutexattr_destroy(self.attr.as_mut_ptr());
            }
        }
    }

    /// A `pthread_mutex_t` living in shared memory.
    #[repr(transparent)]
    pub struct RobustMutex {
        inner: UnsafeCell<pthread_mutex_t>,
    }

    // SAFETY: the mutex is process-shared; all access goes through pthread calls.
    unsafe impl Send for RobustMutex {}
    unsafe impl Sync for RobustMutex {}

    impl RobustMutex {
        /// Initialise a mutex in place.
        ///
        /// # Safety
        /// `this` must be valid for writes and suitably aligned, and no other
        /// thread or process may be using the mutex.
        pub unsafe fn init_in_place(this: *mut RobustMutex, attr: &MutexAttr) -> Result<()> {
            // `RobustMutex` is repr(transparent) over the pthread mutex.
            let rc = pthread_mutex_init(this as *mut pthread_mutex_t, attr.as_ptr());
            if rc != 0 {
                return Err(Error::os("pthread_mutex_init", rc));
            }
            Ok(())
        }

        #[inline]
        fn raw(&self) -> *mut pthread_mutex_t {
            self.inner.get()
        }

        /// Block until the mutex is held by the calling thread.
        pub fn lock(&self) -> Result<LockState> {
            let rc = loop {
                // SAFETY: the mutex was initialised by `init_in_place` in a mapped segment.
                let rc = unsafe { pthread_mutex_lock(self.raw()) };
                if rc != EAGAIN {
                    break rc;
                }
            };
            self.settle(rc, "pthread_mutex_lock")
        }

        /// Take the mutex if nobody holds it, without blocking.
        pub fn try_lock(&self) -> Result<TryLockState> {
            let rc = loop {
                // SAFETY: as in `lock`.
                let rc = unsafe { pthread_mutex_trylock(self.raw()) };
                if rc != EAGAIN {
                    break rc;
                }
            };
            if rc == EBUSY {
                return Ok(TryLockState::Busy);
            }
            self.settle(rc, "pthread_mutex_trylock").map(TryLockState::Acquired)
        }

        fn settle(&self, rc: i32, op: &'static str) -> Result<LockState> {
            match rc {
                0 => Ok(LockState::Acquired),
                EOWNERDEAD => {
                    // SAFETY: we own the mutex after EOWNERDEAD.
                    let rc = unsafe { pthread_mutex_consistent(self.raw()) };
                    if rc != 0 {
                        return Err(Error::Unrecoverable(format!(
                            "pthread_mutex_consistent failed: {}",
                            errno::Errno(rc)
                        )));
                    }
                    Ok(LockState::Recovered)
                }
                libc::ENOTRECOVERABLE => Err(Error::Unrecoverable(format!(
                    "{op}: {}",
                    errno::Errno(rc)
                ))),
                rc => Err(Error::os(op, rc)),
            }
        }

        /// Release the mutex. Robust mutexes report `EPERM` when the caller
        /// does not hold them, which includes "already unlocked".
        pub fn unlock(&self) -> std::result::Result<(), errno::Errno> {
            let rc = loop {
                // SAFETY: as in `lock`.
                let rc = unsafe { pthread_mutex_unlock(self.raw()) };
                if rc != EAGAIN {
                    break rc;
                }
            };
            if rc == 0 {
                Ok(())
            } else {
                Err(errno::Errno(rc))
            }
        }
    }

}
