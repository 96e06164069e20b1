//! Backend-agnostic lock manager interface.
//!
//! A `LockManager` hands out `Locker`s addressed by `u32` IDs. Allocation
//! state and lock state are separate: `retrieve_lock` never checks whether
//! an ID is allocated, and locking a freed ID always works, so a caller can
//! lock a resource's ID to find out safely that the resource is gone.

use crate::errors::{Error, Result};
use log::{error, warn};

/// Allocates, retrieves and frees locks.
///
/// Implementations are shared between threads; every method takes `&self`.
pub trait LockManager: Send + Sync {
    /// Allocate a free lock and return it.
    fn allocate_lock(&self) -> Result<Box<dyn Locker>>;

    /// Return the lock with the given ID without checking that it is allocated.
    fn retrieve_lock(&self, id: u32) -> Result<Box<dyn Locker>>;

    /// Mark the given ID allocated and return it. Used to re-reserve IDs that
    /// a durable store already records as in use, e.g. after a restart.
    fn allocate_and_retrieve_lock(&self, id: u32) -> Result<Box<dyn Locker>>;

    /// Mark every lock free.
    ///
    /// DANGEROUS: invalidates the allocation of every lock held by every
    /// process. Only for renumbering all locks or for tests.
    fn free_all_locks(&self) -> Result<()>;

    /// Number of locks that can still be allocated, or `None` when the backend
    /// has no fixed capacity.
    fn available_locks(&self) -> Result<Option<u32>>;

    /// IDs of locks that appear to be held right now. A diagnostic for
    /// finding deadlocks, not a statement about allocation. Backends that
    /// cannot inspect lock state return `Error::NotImplemented`.
    fn locks_held(&self) -> Result<Vec<u32>>;
}

/// A single lock. Cheap to create; dropping it does not free the ID.
pub trait Locker: Send + Sync {
    fn id(&self) -> u32;

    /// Block until the lock is held. Never fails: recoverable conditions are
    /// handled inside, anything else aborts via panic.
    fn lock(&self);

    /// Release the lock. Must be called on the thread that locked it.
    fn unlock(&self);

    /// Return the ID to the pool.
    fn free(&self) -> Result<()>;
}

impl dyn Locker + '_ {
    /// Lock and return a guard that unlocks when dropped.
    pub fn guard(&self) -> LockGuard<'_> {
        self.lock();
        LockGuard { locker: self }
    }
}

impl std::fmt::Debug for dyn Locker + '_ {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locker").field("id", &self.id()).finish()
    }
}

/// Represents an acquired lock.
/// The lock is released when this guard is dropped.
#[must_use = "if unused the lock will immediately unlock"]
pub struct LockGuard<'a> {
    locker: &'a dyn Locker,
}

impl LockGuard<'_> {
    pub fn id(&self) -> u32 {
        self.locker.id()
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.locker.unlock();
    }
}

/// Turn the result of a backend lock call into the `Locker::lock` contract.
pub(crate) fn lock_or_abort(id: u32, res: Result<()>) {
    if let Err(e) = res {
        error!("Failed to lock {id}: {e}");
        panic!("lock {id}: {e}");
    }
}

/// Turn the result of a backend unlock call into the `Locker::unlock`
/// contract: "was not locked" is logged and ignored, anything else aborts.
pub(crate) fn unlock_or_abort(id: u32, res: Result<()>) {
    match res {
        Ok(()) => {}
        Err(Error::NotLocked(_)) => warn!("Unlocked lock {id} which was not held by this thread"),
        Err(e) => {
            error!("Failed to unlock {id}: {e}");
            panic!("unlock {id}: {e}");
        }
    }
}
