//! C ABI over the lock managers.
//!
//! Managers are addressed by registry handles, locks by their `u32` ID.
//! Every function returns an `ErrorCode` and records it as the thread's last
//! error. `shmlock_lock` and `shmlock_unlock` keep the Rust contract: a lock
//! failure that cannot be recovered aborts the process.

use crate::{
    config::{open_manager, LockConfig},
    errors::{map_error, set_last_error, Error, ErrorCode},
    handle_registry::{register_handle, unregister_handle, with_handle, HandleId},
    manager::LockManager,
};
use std::{ffi::CStr, os::raw::c_char, sync::Arc};

#[cfg(target_os = "linux")]
use crate::shm_manager::ShmLockManager;

// ─────────────────────────── helpers ─────────────────────────────────── //

#[inline]
fn cstr<'a>(p: *const c_char) -> Result<&'a str, ErrorCode> {
    if p.is_null() {
        return Err(ErrorCode::Utf8Error);
    }
    unsafe { CStr::from_ptr(p) }
        .to_str()
        .map_err(|_| ErrorCode::Utf8Error)
}

#[inline]
fn status(res: Result<(), ErrorCode>) -> ErrorCode {
    let code = res.err().unwrap_or(ErrorCode::Success);
    set_last_error(code);
    code
}

#[inline]
fn lift<T>(res: crate::errors::Result<T>) -> Result<T, ErrorCode> {
    res.map_err(|e: Error| map_error(&e))
}

fn manager_call<T>(
    h: HandleId,
    f: impl FnOnce(&dyn LockManager) -> crate::errors::Result<T>,
) -> Result<T, ErrorCode> {
    with_handle(h, f).and_then(lift)
}

// ─── small helper to turn Result<T,ErrorCode> into early-return ──────────
macro_rules! try_c { ($expr:expr) => { match $expr {
    Ok(v)  => v,
    Err(e) => { set_last_error(e); return e }
}}}

fn store<T>(out: *mut T, value: T) {
    // SAFETY: callers check `out` for NULL first; validity is the C caller's contract.
    unsafe { *out = value };
}

// ───────────────────────── lifetime ──────────────────────────────────── //

/// Create a new shared-memory lock segment and store its handle in `*out`.
#[cfg(target_os = "linux")]
#[no_mangle]
pub extern "C" fn shmlock_create(
    path_utf8: *const c_char,
    num_locks: u32,
    out: *mut HandleId,
) -> ErrorCode {
    if out.is_null() {
        return status(Err(ErrorCode::InvalidHandle));
    }
    let path = try_c!(cstr(path_utf8));
    let manager = try_c!(lift(ShmLockManager::create(path, num_locks)));
    store(out, register_handle(Arc::new(manager)));
    status(Ok(()))
}

/// Open an existing shared-memory lock segment created for `num_locks` locks.
#[cfg(target_os = "linux")]
#[no_mangle]
pub extern "C" fn shmlock_open(
    path_utf8: *const c_char,
    num_locks: u32,
    out: *mut HandleId,
) -> ErrorCode {
    if out.is_null() {
        return status(Err(ErrorCode::InvalidHandle));
    }
    let path = try_c!(cstr(path_utf8));
    let manager = try_c!(lift(ShmLockManager::open(path, num_locks)));
    store(out, register_handle(Arc::new(manager)));
    status(Ok(()))
}

/// Open the backend selected by the `SHMLOCK_*` environment, creating its
/// backing store if needed.
#[no_mangle]
pub extern "C" fn shmlock_open_from_env(out: *mut HandleId) -> ErrorCode {
    if out.is_null() {
        return status(Err(ErrorCode::InvalidHandle));
    }
    let cfg = try_c!(lift(LockConfig::from_env()));
    let manager = try_c!(lift(open_manager(&cfg)));
    store(out, register_handle(Arc::from(manager)));
    status(Ok(()))
}

#[no_mangle]
pub extern "C" fn shmlock_close(h: HandleId) -> ErrorCode {
    status(unregister_handle(h))
}

/// Remove a named segment. Processes that still map it keep working.
#[cfg(target_os = "linux")]
#[no_mangle]
pub extern "C" fn shmlock_unlink(path_utf8: *const c_char) -> ErrorCode {
    let path = try_c!(cstr(path_utf8));
    status(lift(ShmLockManager::unlink(path)))
}

// ───────────────────────── allocation ────────────────────────────────── //

#[no_mangle]
pub extern "C" fn shmlock_allocate(h: HandleId, out_id: *mut u32) -> ErrorCode {
    if out_id.is_null() {
        return status(Err(ErrorCode::InvalidHandle));
    }
    let id = try_c!(manager_call(h, |m| m.allocate_lock().map(|l| l.id())));
    store(out_id, id);
    status(Ok(()))
}

#[no_mangle]
pub extern "C" fn shmlock_allocate_given(h: HandleId, id: u32) -> ErrorCode {
    status(manager_call(h, |m| m.allocate_and_retrieve_lock(id).map(drop)))
}

#[no_mangle]
pub extern "C" fn shmlock_free(h: HandleId, id: u32) -> ErrorCode {
    status(manager_call(h, |m| m.retrieve_lock(id)?.free()))
}

/// DANGEROUS: frees every lock of every process sharing the backend.
#[no_mangle]
pub extern "C" fn shmlock_free_all(h: HandleId) -> ErrorCode {
    status(manager_call(h, |m| m.free_all_locks()))
}

/// Number of locks still available. `NotImplemented` for backends without a
/// fixed capacity.
#[no_mangle]
pub extern "C" fn shmlock_available(h: HandleId, out: *mut u32) -> ErrorCode {
    if out.is_null() {
        return status(Err(ErrorCode::InvalidHandle));
    }
    match try_c!(manager_call(h, |m| m.available_locks())) {
        Some(n) => {
            store(out, n);
            status(Ok(()))
        }
        None => status(Err(ErrorCode::NotImplemented)),
    }
}

// ───────────────────────── locking ───────────────────────────────────── //

/// Block until lock `id` is held. Unlock it from the same thread.
#[no_mangle]
pub extern "C" fn shmlock_lock(h: HandleId, id: u32) -> ErrorCode {
    status(manager_call(h, |m| m.retrieve_lock(id).map(|l| l.lock())))
}

#[no_mangle]
pub extern "C" fn shmlock_unlock(h: HandleId, id: u32) -> ErrorCode {
    status(manager_call(h, |m| m.retrieve_lock(id).map(|l| l.unlock())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::get_last_error;
    use crate::memory_manager::InMemoryManager;

    #[test]
    fn calls_through_a_registered_handle() {
        let h = register_handle(Arc::new(InMemoryManager::new(2).unwrap()));
        let mut id = u32::MAX;
        assert_eq!(shmlock_allocate(h, &mut id), ErrorCode::Success);
        assert_eq!(id, 0);
        assert_eq!(shmlock_allocate_given(h, 0), ErrorCode::AlreadyAllocated);
        assert_eq!(get_last_error(), ErrorCode::AlreadyAllocated);

        let mut avail = 0;
        assert_eq!(shmlock_available(h, &mut avail), ErrorCode::Success);
        assert_eq!(avail, 1);

        assert_eq!(shmlock_lock(h, id), ErrorCode::Success);
        assert_eq!(shmlock_unlock(h, id), ErrorCode::Success);
        assert_eq!(shmlock_free(h, id), ErrorCode::Success);
        assert_eq!(shmlock_free(h, id), ErrorCode::NotAllocated);
        assert_eq!(shmlock_lock(h, 9), ErrorCode::OutOfRange);

        assert_eq!(shmlock_close(h), ErrorCode::Success);
        assert_eq!(shmlock_allocate(h, &mut id), ErrorCode::InvalidHandle);
    }

    #[test]
    fn null_pointers_are_rejected() {
        assert_eq!(shmlock_allocate(1, std::ptr::null_mut()), ErrorCode::InvalidHandle);
        assert_eq!(shmlock_open_from_env(std::ptr::null_mut()), ErrorCode::InvalidHandle);
        #[cfg(target_os = "linux")]
        {
            let mut h = 0;
            assert_eq!(shmlock_open(std::ptr::null(), 32, &mut h), ErrorCode::Utf8Error);
            assert_eq!(shmlock_unlink(std::ptr::null()), ErrorCode::Utf8Error);
        }
    }
}
