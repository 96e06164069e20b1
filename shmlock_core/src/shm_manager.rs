//! Lock manager backed by a shared-memory segment of robust mutexes.

use crate::errors::{Error, Result};
use crate::manager::{lock_or_abort, unlock_or_abort, LockManager, Locker};
use crate::segment::SegmentAllocator;
use log::debug;
use std::sync::Arc;

/// Shared-memory lock manager. Clones share the same mapping.
#[derive(Clone, Debug)]
pub struct ShmLockManager {
    segment: Arc<SegmentAllocator>,
}

impl ShmLockManager {
    /// Create a new segment; `num_locks` is rounded up to a multiple of
    /// `BITMAP_SIZE`, read the real count back with `num_locks()`.
    pub fn create(path: &str, num_locks: u32) -> Result<Self> {
        let segment = SegmentAllocator::create(path, num_locks)?;
        Ok(Self { segment: Arc::new(segment) })
    }

    /// Open an existing segment that was created for `num_locks` locks.
    pub fn open(path: &str, num_locks: u32) -> Result<Self> {
        let segment = SegmentAllocator::open(path, num_locks)?;
        Ok(Self { segment: Arc::new(segment) })
    }

    /// Remove the named segment.
    pub fn unlink(path: &str) -> Result<()> {
        SegmentAllocator::unlink(path)
    }

    pub fn num_locks(&self) -> u32 {
        self.segment.num_locks()
    }

    pub fn path(&self) -> &str {
        self.segment.path()
    }

    /// Drop this handle's reference to the mapping. The mapping goes away
    /// once every clone and every locker from this manager is gone.
    /// Testing only.
    pub fn close(self) -> Result<()> {
        match Arc::try_unwrap(self.segment) {
            Ok(segment) => segment.close(),
            Err(_) => {
                debug!("SHM lock segment still referenced; unmapping deferred");
                Ok(())
            }
        }
    }

    fn locker(&self, id: u32) -> Box<dyn Locker> {
        Box::new(ShmLocker { id, segment: Arc::clone(&self.segment) })
    }
}

impl LockManager for ShmLockManager {
    fn allocate_lock(&self) -> Result<Box<dyn Locker>> {
        let id = self.segment.allocate_slot()?;
        Ok(self.locker(id))
    }

    fn retrieve_lock(&self, id: u32) -> Result<Box<dyn Locker>> {
        if id >= self.segment.num_locks() {
            return Err(Error::OutOfRange { id, num_locks: self.segment.num_locks() });
        }
        Ok(self.locker(id))
    }

    fn allocate_and_retrieve_lock(&self, id: u32) -> Result<Box<dyn Locker>> {
        self.segment.allocate_given_slot(id)?;
        Ok(self.locker(id))
    }

    fn free_all_locks(&self) -> Result<()> {
        self.segment.deallocate_all()
    }

    fn available_locks(&self) -> Result<Option<u32>> {
        self.segment.report_free_metric().map(Some)
    }

    fn locks_held(&self) -> Result<Vec<u32>> {
        self.segment.list_allocated()
    }
}

/// One slot of a shared-memory segment.
pub struct ShmLocker {
    id: u32,
    segment: Arc<SegmentAllocator>,
}

impl Locker for ShmLocker {
    fn id(&self) -> u32 {
        self.id
    }

    fn lock(&self) {
        lock_or_abort(self.id, self.segment.lock_slot(self.id));
    }

    fn unlock(&self) {
        unlock_or_abort(self.id, self.segment.unlock_slot(self.id));
    }

    fn free(&self) -> Result<()> {
        self.segment.deallocate_slot(self.id)
    }
}
