//! Shared segment allocator.
//!
//! A single named POSIX shared-memory object holds a header, a segment-wide
//! robust mutex and `num_bitmaps` lock groups. Each group pairs one bitmap
//! word (which slots are allocated) with one robust mutex per slot. The bitmap
//! is only touched while holding the segment lock; the slot mutexes are never
//! touched by the allocator's bookkeeping, so allocation state and lock state
//! stay independent. Any process that maps the segment can lock any slot by
//! index alone.

use crate::constants::{BITMAP_SIZE, SEGMENT_MAGIC};
use crate::errors::{Error, Result};
use crate::helpers::{bitmaps_for, first_clear_bit, free_bits, normalize_shm_name, slot_index, slot_position};
use crate::platform::unix::{platform_drop, LockState, MutexAttr, RobustMutex, TryLockState};
use crate::types::{groups_offset, segment_size, LockGroup, SegmentHeader};
use log::{debug, trace, warn};
use metrics::counter;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use std::mem::size_of;
use std::ptr::{addr_of, addr_of_mut, NonNull};
use std::sync::atomic::Ordering;

/// Handle on a mapped lock segment.
pub struct SegmentAllocator {
    shmem: Shmem,                  // the mapping; unmapped on drop, never unlinked
    hdr: NonNull<SegmentHeader>,   // header at the start of the mapping
    groups: NonNull<LockGroup>,    // first lock group
    num_bitmaps: u32,
    num_locks: u32,
    os_id: String,
}

// SAFETY: the raw pointers target the shared mapping owned by `shmem`, which
// lives as long as `self`. Every mutation of shared state goes through
// process-shared pthread mutexes or atomics.
unsafe impl Send for SegmentAllocator {}
unsafe impl Sync for SegmentAllocator {}

impl SegmentAllocator {
    /// Create a new segment at `path` holding at least `requested` locks.
    ///
    /// Fails if a segment with that name already exists. On any failure the
    /// half-built segment is unmapped and unlinked.
    pub fn create(path: &str, requested: u32) -> Result<Self> {
        crate::ensure_logging();
        if requested == 0 {
            return Err(Error::ZeroCapacity);
        }
        let os_id = normalize_shm_name(path)?;
        let num_bitmaps = bitmaps_for(requested);
        let num_locks = num_bitmaps * BITMAP_SIZE;
        let size = segment_size(num_bitmaps);

        let mut shmem = match ShmemConf::new().os_id(&os_id).size(size).create() {
            Ok(m) => m,
            Err(ShmemError::MappingIdExists) => return Err(Error::SegmentExists(os_id)),
            Err(e) => return Err(e.into()),
        };
        // The mapping is still owned here: returning early drops it, which
        // unmaps and unlinks the name.
        let (hdr, groups) = Self::layout(&shmem, &os_id)?;

        let attr = MutexAttr::new()?;
        // SAFETY: the mapping is at least `size` bytes, freshly created by us,
        // and nobody else can have opened it before the header is written.
        unsafe {
            let h = hdr.as_ptr();
            (*h).magic = 0;
            (*h).num_locks = num_locks;
            (*h).num_bitmaps = num_bitmaps;
            RobustMutex::init_in_place(addr_of_mut!((*h).segment_lock), &attr)?;
            for i in 0..num_bitmaps as usize {
                let group = groups.as_ptr().add(i);
                (*group).bitmap.store(0, Ordering::Relaxed);
                for j in 0..BITMAP_SIZE as usize {
                    RobustMutex::init_in_place(addr_of_mut!((*group).locks[j]), &attr)?;
                }
            }
            // Magic last, so a reader never trusts a half-initialised segment.
            std::sync::atomic::fence(Ordering::Release);
            (*h).magic = SEGMENT_MAGIC;
        }
        shmem.set_owner(false);

        debug!("Initialized SHM lock segment {os_id} with {num_locks} locks");
        Ok(Self { shmem, hdr, groups, num_bitmaps, num_locks, os_id })
    }

    /// Open an existing segment created for `expected` locks.
    pub fn open(path: &str, expected: u32) -> Result<Self> {
        crate::ensure_logging();
        if expected == 0 {
            return Err(Error::ZeroCapacity);
        }
        let os_id = normalize_shm_name(path)?;
        let num_bitmaps = bitmaps_for(expected);

        let shmem = match ShmemConf::new().os_id(&os_id).open() {
            Ok(m) => m,
            Err(ShmemError::MapOpenFailed(code)) if code == libc::ENOENT as u32 => {
                return Err(Error::SegmentNotFound(os_id))
            }
            // Zero length: created but not yet sized by its creator.
            Err(ShmemError::MapOpenFailed(code)) if code == libc::EINVAL as u32 => {
                return Err(Error::ForeignSegment(os_id))
            }
            Err(e) => return Err(e.into()),
        };
        if shmem.len() < size_of::<SegmentHeader>() {
            return Err(Error::ForeignSegment(os_id));
        }
        let (hdr, groups) = Self::layout(&shmem, &os_id)?;

        // SAFETY: the mapping covers at least the header.
        let (magic, stored_locks, stored_bitmaps) = unsafe {
            let h = hdr.as_ptr();
            (
                std::ptr::read_volatile(addr_of!((*h).magic)),
                (*h).num_locks,
                (*h).num_bitmaps,
            )
        };
        if magic != SEGMENT_MAGIC {
            return Err(Error::ForeignSegment(os_id));
        }
        if stored_locks != num_bitmaps * BITMAP_SIZE {
            return Err(Error::SegmentShapeMismatch {
                expected: num_bitmaps * BITMAP_SIZE,
                actual: stored_locks,
            });
        }
        if stored_bitmaps != num_bitmaps || shmem.len() < segment_size(num_bitmaps) {
            return Err(Error::ForeignSegment(os_id));
        }

        debug!("Opened SHM lock segment {os_id} with {stored_locks} locks");
        Ok(Self {
            shmem,
            hdr,
            groups,
            num_bitmaps,
            num_locks: stored_locks,
            os_id,
        })
    }

    fn layout(shmem: &Shmem, os_id: &str) -> Result<(NonNull<SegmentHeader>, NonNull<LockGroup>)> {
        let base = NonNull::new(shmem.as_ptr()).ok_or_else(|| Error::ForeignSegment(os_id.to_string()))?;
        let hdr = base.cast::<SegmentHeader>();
        // SAFETY: callers check the mapping length before dereferencing groups.
        let groups = unsafe { NonNull::new_unchecked(base.as_ptr().add(groups_offset())) }.cast::<LockGroup>();
        Ok((hdr, groups))
    }

    /// Unmap the segment. The name stays in place for other processes.
    ///
    /// Maintenance and testing only: a process that still holds one of this
    /// mapping's locks can no longer release it through this handle.
    pub fn close(self) -> Result<()> {
        debug!("Closing SHM lock segment {}", self.os_id);
        drop(self);
        Ok(())
    }

    /// Remove the segment name. Existing mappings keep working until unmapped;
    /// later `open` calls fail and a later `create` builds a fresh segment.
    pub fn unlink(path: &str) -> Result<()> {
        let os_id = normalize_shm_name(path)?;
        debug!("Unlinking SHM lock segment {os_id}");
        platform_drop(&os_id)
    }

    /// Usable number of locks, always a multiple of `BITMAP_SIZE`.
    pub fn num_locks(&self) -> u32 {
        self.num_locks
    }

    pub fn path(&self) -> &str {
        &self.os_id
    }

    #[inline]
    fn header(&self) -> &SegmentHeader {
        // SAFETY: validated in create/open; lives as long as the mapping.
        unsafe { self.hdr.as_ref() }
    }

    #[inline]
    fn group(&self, word: usize) -> &LockGroup {
        debug_assert!(word < self.num_bitmaps as usize);
        // SAFETY: word < num_bitmaps and the mapping holds that many groups.
        unsafe { &*self.groups.as_ptr().add(word) }
    }

    fn slot_mutex(&self, index: u32) -> Result<&RobustMutex> {
        self.check_range(index)?;
        let (word, bit) = slot_position(index);
        Ok(&self.group(word).locks[bit])
    }

    #[inline]
    fn check_range(&self, index: u32) -> Result<()> {
        if index >= self.num_locks {
            return Err(Error::OutOfRange { id: index, num_locks: self.num_locks });
        }
        Ok(())
    }

    /// Run `f` while holding the segment lock.
    fn with_segment_lock<T>(&self, f: impl FnOnce() -> T) -> Result<T> {
        let mutex = &self.header().segment_lock;
        if mutex.lock()? == LockState::Recovered {
            warn!("Recovered SHM segment lock of {} from a dead owner", self.os_id);
            counter!("shmlock_owner_died_recoveries_total").increment(1);
        }
        let out = f();
        mutex
            .unlock()
            .map_err(|e| Error::Os { op: "pthread_mutex_unlock", errno: e })?;
        Ok(out)
    }

    /// Allocate the lowest free slot.
    pub fn allocate_slot(&self) -> Result<u32> {
        let found = self.with_segment_lock(|| {
            for word in 0..self.num_bitmaps as usize {
                let group = self.group(word);
                let bits = group.bitmap.load(Ordering::Relaxed);
                if let Some(bit) = first_clear_bit(bits) {
                    group.bitmap.store(bits | (1 << bit), Ordering::Relaxed);
                    return Some(slot_index(word, bit));
                }
            }
            None
        })?;
        match found {
            Some(index) => {
                counter!("shmlock_allocations_total").increment(1);
                trace!("Allocated lock {index} in {}", self.os_id);
                Ok(index)
            }
            None => {
                counter!("shmlock_alloc_failures_total").increment(1);
                Err(Error::CapacityExhausted { num_locks: self.num_locks })
            }
        }
    }

    /// Allocate the given slot; fails if it is already allocated.
    pub fn allocate_given_slot(&self, index: u32) -> Result<()> {
        self.check_range(index)?;
        let (word, bit) = slot_position(index);
        let mask = 1u32 << bit;
        let taken = self.with_segment_lock(|| {
            let group = self.group(word);
            let bits = group.bitmap.load(Ordering::Relaxed);
            if bits & mask != 0 {
                return true;
            }
            group.bitmap.store(bits | mask, Ordering::Relaxed);
            false
        })?;
        if taken {
            return Err(Error::AlreadyAllocated(index));
        }
        counter!("shmlock_allocations_total").increment(1);
        trace!("Allocated given lock {index} in {}", self.os_id);
        Ok(())
    }

    /// Release a slot for reallocation. A slot that is already free is
    /// reported as `NotAllocated`.
    pub fn deallocate_slot(&self, index: u32) -> Result<()> {
        self.check_range(index)?;
        let (word, bit) = slot_position(index);
        let mask = 1u32 << bit;
        let was_set = self.with_segment_lock(|| {
            let group = self.group(word);
            let bits = group.bitmap.load(Ordering::Relaxed);
            group.bitmap.store(bits & !mask, Ordering::Relaxed);
            bits & mask != 0
        })?;
        if !was_set {
            return Err(Error::NotAllocated(index));
        }
        counter!("shmlock_deallocations_total").increment(1);
        trace!("Deallocated lock {index} in {}", self.os_id);
        Ok(())
    }

    /// Mark every slot free.
    ///
    /// DANGEROUS: this wipes allocation state for every process using the
    /// segment. Processes allocating or freeing concurrently will race with
    /// it and leave the bitmaps inconsistent with their own records. Only for
    /// renumbering all locks or tearing down tests.
    pub fn deallocate_all(&self) -> Result<()> {
        self.with_segment_lock(|| {
            for word in 0..self.num_bitmaps as usize {
                self.group(word).bitmap.store(0, Ordering::Relaxed);
            }
        })?;
        warn!("Deallocated all {} locks in {}", self.num_locks, self.os_id);
        Ok(())
    }

    /// Block until the slot's mutex is held by the calling thread.
    ///
    /// Does not look at the allocation bit: a freed slot can still be locked,
    /// which is how callers safely discover that its resource is gone.
    pub fn lock_slot(&self, index: u32) -> Result<()> {
        let mutex = self.slot_mutex(index)?;
        if mutex.lock()? == LockState::Recovered {
            warn!("Lock {index} in {} was held by a dead owner; recovered", self.os_id);
            counter!("shmlock_owner_died_recoveries_total").increment(1);
        }
        trace!("Locked {index}");
        Ok(())
    }

    /// Release the slot's mutex. Must run on the thread that locked it.
    pub fn unlock_slot(&self, index: u32) -> Result<()> {
        let mutex = self.slot_mutex(index)?;
        match mutex.unlock() {
            Ok(()) => {
                trace!("Unlocked {index}");
                Ok(())
            }
            Err(e) if e.0 == libc::EPERM => Err(Error::NotLocked(index)),
            Err(e) => Err(Error::Os { op: "pthread_mutex_unlock", errno: e }),
        }
    }

    /// Number of unallocated slots.
    pub fn count_free(&self) -> Result<u32> {
        self.with_segment_lock(|| {
            (0..self.num_bitmaps as usize)
                .map(|word| free_bits(self.group(word).bitmap.load(Ordering::Relaxed)))
                .sum()
        })
    }

    /// Slots whose mutex is currently held by someone.
    ///
    /// Each slot is checked with a try-lock that is released straight away.
    /// This is a diagnostic for spotting stuck locks, not a view of allocation
    /// state, and the answer can be stale by the time it is returned.
    pub fn list_allocated(&self) -> Result<Vec<u32>> {
        let mut held = Vec::new();
        for index in 0..self.num_locks {
            let mutex = self.slot_mutex(index)?;
            match mutex.try_lock()? {
                TryLockState::Busy => held.push(index),
                TryLockState::Acquired(state) => {
                    if state == LockState::Recovered {
                        warn!("Lock {index} in {} was held by a dead owner; recovered", self.os_id);
                        counter!("shmlock_owner_died_recoveries_total").increment(1);
                    }
                    mutex
                        .unlock()
                        .map_err(|e| Error::Os { op: "pthread_mutex_unlock", errno: e })?;
                }
            }
        }
        Ok(held)
    }

    /// Unallocated slot count as of now, for gauges.
    pub fn report_free_metric(&self) -> Result<u32> {
        let free = self.count_free()?;
        metrics::gauge!("shmlock_free_locks").set(free as f64);
        Ok(free)
    }
}

impl std::fmt::Debug for SegmentAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentAllocator")
            .field("os_id", &self.os_id)
            .field("num_locks", &self.num_locks)
            .field("mapped_len", &self.shmem.len())
            .finish()
    }
}
