//! In-process lock manager.
//!
//! Same contract as the shared-memory backend, but the locks only exclude
//! threads of the current process. Useful for tests and single-process tools.

use crate::errors::{Error, Result};
use crate::manager::{lock_or_abort, unlock_or_abort, LockManager, Locker};
use lock_api::RawMutex as _;
use log::{debug, warn};
use parking_lot::{Mutex, RawMutex};
use std::sync::Arc;

struct Inner {
    locks: Box<[RawMutex]>,
    allocated: Mutex<Box<[bool]>>,
}

impl Inner {
    fn check_range(&self, id: u32) -> Result<usize> {
        if id as usize >= self.locks.len() {
            return Err(Error::OutOfRange { id, num_locks: self.locks.len() as u32 });
        }
        Ok(id as usize)
    }
}

/// Fixed pool of in-process mutexes.
#[derive(Clone)]
pub struct InMemoryManager {
    inner: Arc<Inner>,
}

impl InMemoryManager {
    pub fn new(num_locks: u32) -> Result<Self> {
        if num_locks == 0 {
            return Err(Error::ZeroCapacity);
        }
        let locks = (0..num_locks).map(|_| RawMutex::INIT).collect();
        let allocated = vec![false; num_locks as usize].into_boxed_slice();
        crate::ensure_logging();
        debug!("Initialized in-memory lock manager with {num_locks} locks");
        Ok(Self {
            inner: Arc::new(Inner { locks, allocated: Mutex::new(allocated) }),
        })
    }

    pub fn num_locks(&self) -> u32 {
        self.inner.locks.len() as u32
    }

    fn locker(&self, id: u32) -> Box<dyn Locker> {
        Box::new(MemoryLocker { id, inner: Arc::clone(&self.inner) })
    }
}

impl LockManager for InMemoryManager {
    fn allocate_lock(&self) -> Result<Box<dyn Locker>> {
        let id = {
            let mut allocated = self.inner.allocated.lock();
            let idx = allocated
                .iter()
                .position(|taken| !taken)
                .ok_or(Error::CapacityExhausted { num_locks: self.num_locks() })?;
            allocated[idx] = true;
            idx as u32
        };
        Ok(self.locker(id))
    }

    fn retrieve_lock(&self, id: u32) -> Result<Box<dyn Locker>> {
        self.inner.check_range(id)?;
        Ok(self.locker(id))
    }

    fn allocate_and_retrieve_lock(&self, id: u32) -> Result<Box<dyn Locker>> {
        let idx = self.inner.check_range(id)?;
        {
            let mut allocated = self.inner.allocated.lock();
            if allocated[idx] {
                return Err(Error::AlreadyAllocated(id));
            }
            allocated[idx] = true;
        }
        Ok(self.locker(id))
    }

    fn free_all_locks(&self) -> Result<()> {
        self.inner.allocated.lock().iter_mut().for_each(|taken| *taken = false);
        warn!("Deallocated all {} in-memory locks", self.num_locks());
        Ok(())
    }

    fn available_locks(&self) -> Result<Option<u32>> {
        let free = self.inner.allocated.lock().iter().filter(|taken| !**taken).count();
        Ok(Some(free as u32))
    }

    fn locks_held(&self) -> Result<Vec<u32>> {
        let mut held = Vec::new();
        for (id, lock) in self.inner.locks.iter().enumerate() {
            if lock.try_lock() {
                // SAFETY: acquired by the try_lock above.
                unsafe { lock.unlock() };
            } else {
                held.push(id as u32);
            }
        }
        Ok(held)
    }
}

struct MemoryLocker {
    id: u32,
    inner: Arc<Inner>,
}

impl Locker for MemoryLocker {
    fn id(&self) -> u32 {
        self.id
    }

    fn lock(&self) {
        let res = self.inner.check_range(self.id).map(|idx| self.inner.locks[idx].lock());
        lock_or_abort(self.id, res);
    }

    fn unlock(&self) {
        let res = self.inner.check_range(self.id).and_then(|idx| {
            let lock = &self.inner.locks[idx];
            if !lock.is_locked() {
                return Err(Error::NotLocked(self.id));
            }
            // SAFETY: the lock is held; callers pair unlock with their own lock.
            unsafe { lock.unlock() };
            Ok(())
        });
        unlock_or_abort(self.id, res);
    }

    fn free(&self) -> Result<()> {
        let idx = self.inner.check_range(self.id)?;
        let mut allocated = self.inner.allocated.lock();
        if !allocated[idx] {
            return Err(Error::NotAllocated(self.id));
        }
        allocated[idx] = false;
        Ok(())
    }
}
