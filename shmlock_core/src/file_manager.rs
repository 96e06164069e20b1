//! Lock manager with one lock file per allocated ID.
//!
//! Allocation is the existence of `<dir>/<id>`, created with exclusive-create
//! semantics so two processes can never claim the same ID. Locking is an
//! advisory `flock` on a separate `<dir>/<id>.lock` file, created on first
//! use and never removed: a locked inode that is unlinked and recreated
//! would let two holders in at once. Keeping the two files apart also means
//! locking never touches allocation state, and `free` never touches a lock.
//!
//! `flock` belongs to the open file description, so threads of one process
//! are serialised by a per-ID gate before they touch the file.

use crate::constants::{LOCK_DIR_MODE, LOCK_FILE_MODE};
use crate::errors::{Error, Result};
use crate::manager::{lock_or_abort, unlock_or_abort, LockManager, Locker};
use crate::platform::unix::{flock_exclusive, flock_release};
use dashmap::DashMap;
use lock_api::RawMutex as _;
use log::{debug, trace, warn};
use parking_lot::{Mutex, RawMutex};
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const LOCK_SUFFIX: &str = "lock";

/// Per-process state of one lock ID. Lives in `Inner::slots` only while some
/// thread holds or waits for the lock.
struct FileSlot {
    gate: RawMutex,
    held: Mutex<Option<File>>,
}

impl FileSlot {
    fn new() -> Self {
        Self { gate: RawMutex::INIT, held: Mutex::new(None) }
    }
}

struct Inner {
    dir: PathBuf,
    slots: DashMap<u32, Arc<FileSlot>>,
    alloc: Mutex<()>,
}

impl Inner {
    /// Allocation marker.
    fn alloc_path(&self, id: u32) -> PathBuf {
        self.dir.join(id.to_string())
    }

    /// `flock` target.
    fn lock_path(&self, id: u32) -> PathBuf {
        self.dir.join(format!("{id}.{LOCK_SUFFIX}"))
    }

    fn slot(&self, id: u32) -> Arc<FileSlot> {
        Arc::clone(&self.slots.entry(id).or_insert_with(|| Arc::new(FileSlot::new())))
    }

    /// Exclusively create the allocation marker for `id`. `Ok(false)` when it exists.
    fn create_alloc_file(&self, id: u32) -> Result<bool> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(LOCK_FILE_MODE)
            .open(self.alloc_path(id))
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn open_lock_file(&self, id: u32) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(LOCK_FILE_MODE)
            .open(self.lock_path(id))?;
        Ok(file)
    }

    fn lock(&self, id: u32) -> Result<()> {
        let slot = self.slot(id);
        slot.gate.lock();
        let res = self.open_lock_file(id).and_then(|file| {
            flock_exclusive(&file)?;
            Ok(file)
        });
        match res {
            Ok(file) => {
                trace!("Locked file lock {id}");
                *slot.held.lock() = Some(file);
                Ok(())
            }
            Err(e) => {
                self.slots.remove_if(&id, |_, s| Arc::strong_count(s) == 2);
                // SAFETY: taken by this call just above.
                unsafe { slot.gate.unlock() };
                Err(e)
            }
        }
    }

    fn unlock(&self, id: u32) -> Result<()> {
        let slot = self.slots.get(&id).map(|s| Arc::clone(&s)).ok_or(Error::NotLocked(id))?;
        let file = slot.held.lock().take().ok_or(Error::NotLocked(id))?;
        let res = flock_release(&file);
        drop(file);
        // Still holding the gate, so nobody can be mid-lock through this slot.
        // Only the map and `slot` reference it when no other thread waits.
        self.slots.remove_if(&id, |_, s| Arc::strong_count(s) == 2);
        // SAFETY: `held` was Some, so the gate was taken by `lock`.
        unsafe { slot.gate.unlock() };
        res.map_err(Error::from)
    }
}

/// Lock manager over a directory of lock files. No fixed capacity.
#[derive(Clone)]
pub struct FileLockManager {
    inner: Arc<Inner>,
}

impl FileLockManager {
    /// Create the lock directory. Fails if it already exists.
    pub fn create(dir: impl AsRef<Path>) -> Result<Self> {
        crate::ensure_logging();
        let dir = dir.as_ref().to_path_buf();
        if dir.exists() {
            return Err(Error::LockDirExists(dir));
        }
        DirBuilder::new().recursive(true).mode(LOCK_DIR_MODE).create(&dir)?;
        debug!("Initialized file lock manager at {}", dir.display());
        Ok(Self::with_dir(dir))
    }

    /// Open an existing lock directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        crate::ensure_logging();
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(Error::LockDirNotFound(dir));
        }
        Ok(Self::with_dir(dir))
    }

    fn with_dir(dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(Inner { dir, slots: DashMap::new(), alloc: Mutex::new(()) }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    fn locker(&self, id: u32) -> Box<dyn Locker> {
        Box::new(FileLocker { id, inner: Arc::clone(&self.inner) })
    }
}

impl LockManager for FileLockManager {
    fn allocate_lock(&self) -> Result<Box<dyn Locker>> {
        let _alloc = self.inner.alloc.lock();
        for id in 0..=u32::MAX {
            if self.inner.create_alloc_file(id)? {
                trace!("Allocated file lock {id}");
                return Ok(self.locker(id));
            }
        }
        Err(Error::CapacityExhausted { num_locks: u32::MAX })
    }

    fn retrieve_lock(&self, id: u32) -> Result<Box<dyn Locker>> {
        Ok(self.locker(id))
    }

    fn allocate_and_retrieve_lock(&self, id: u32) -> Result<Box<dyn Locker>> {
        let _alloc = self.inner.alloc.lock();
        if !self.inner.create_alloc_file(id)? {
            return Err(Error::AlreadyAllocated(id));
        }
        Ok(self.locker(id))
    }

    fn free_all_locks(&self) -> Result<()> {
        let _alloc = self.inner.alloc.lock();
        for entry in fs::read_dir(&self.inner.dir)? {
            let entry = entry?;
            // Only allocation markers; `<id>.lock` files stay.
            let is_marker = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.parse::<u32>().is_ok());
            if !is_marker {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        warn!("Deallocated all file locks in {}", self.inner.dir.display());
        Ok(())
    }

    fn available_locks(&self) -> Result<Option<u32>> {
        Ok(None)
    }

    fn locks_held(&self) -> Result<Vec<u32>> {
        Err(Error::NotImplemented("locks_held"))
    }
}

struct FileLocker {
    id: u32,
    inner: Arc<Inner>,
}

impl Locker for FileLocker {
    fn id(&self) -> u32 {
        self.id
    }

    fn lock(&self) {
        lock_or_abort(self.id, self.inner.lock(self.id));
    }

    fn unlock(&self) {
        unlock_or_abort(self.id, self.inner.unlock(self.id));
    }

    fn free(&self) -> Result<()> {
        match fs::remove_file(self.inner.alloc_path(self.id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::NotAllocated(self.id)),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Barrier};
    use std::thread;
    use std::time::{Duration, Instant};

    fn manager() -> (tempfile::TempDir, FileLockManager) {
        let tmp = tempfile::tempdir().unwrap();
        let m = FileLockManager::create(tmp.path().join("locks")).unwrap();
        (tmp, m)
    }

    #[test]
    fn create_and_open_check_the_directory() {
        let (tmp, m) = manager();
        assert!(matches!(FileLockManager::create(m.dir()), Err(Error::LockDirExists(_))));
        assert!(FileLockManager::open(m.dir()).is_ok());
        assert!(matches!(
            FileLockManager::open(tmp.path().join("missing")),
            Err(Error::LockDirNotFound(_))
        ));
    }

    #[test]
    fn allocation_creates_files_in_order() {
        let (_tmp, m) = manager();
        let a = m.allocate_lock().unwrap();
        let b = m.allocate_lock().unwrap();
        assert_eq!((a.id(), b.id()), (0, 1));
        assert!(m.dir().join("0").exists());
        a.free().unwrap();
        assert!(!m.dir().join("0").exists());
        assert!(matches!(a.free(), Err(Error::NotAllocated(0))));
        assert_eq!(m.allocate_lock().unwrap().id(), 0);
    }

    #[test]
    fn allocate_given_conflicts_across_managers() {
        let (_tmp, m) = manager();
        m.allocate_and_retrieve_lock(7).unwrap();
        let other = FileLockManager::open(m.dir()).unwrap();
        assert!(matches!(
            other.allocate_and_retrieve_lock(7).map(|_| ()),
            Err(Error::AlreadyAllocated(7))
        ));
        assert_eq!(other.allocate_lock().unwrap().id(), 0);
    }

    #[test]
    fn capacity_is_unbounded_and_unlisted() {
        let (_tmp, m) = manager();
        assert_eq!(m.available_locks().unwrap(), None);
        assert!(m.locks_held().unwrap_err().is_not_implemented());
        assert_eq!(m.retrieve_lock(1_000_000).unwrap().id(), 1_000_000);
    }

    #[test]
    fn locking_leaves_allocation_alone() {
        let (_tmp, m) = manager();
        let l = m.retrieve_lock(3).unwrap();
        l.lock();
        assert!(!m.dir().join("3").exists());
        assert!(m.dir().join("3.lock").exists());
        // Allocating and freeing while held does not touch the lock.
        let allocated = m.allocate_and_retrieve_lock(3).unwrap();
        allocated.free().unwrap();
        l.unlock();
        assert!(m.dir().join("3.lock").exists());
        assert_eq!(m.allocate_lock().unwrap().id(), 0);
    }

    #[test]
    fn unallocated_id_excludes_across_managers() {
        let (_tmp, m) = manager();
        let managers: Vec<FileLockManager> =
            (0..3).map(|_| FileLockManager::open(m.dir()).unwrap()).collect();
        let inside = Arc::new(AtomicUsize::new(0));
        let total = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(managers.len()));

        let handles: Vec<_> = managers
            .into_iter()
            .map(|other| {
                let inside = Arc::clone(&inside);
                let total = Arc::clone(&total);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let l = other.retrieve_lock(3).unwrap();
                    barrier.wait();
                    for _ in 0..100 {
                        l.lock();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        thread::yield_now();
                        total.fetch_add(1, Ordering::Relaxed);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        l.unlock();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(total.load(Ordering::Relaxed), 300);
        assert!(!m.dir().join("3").exists());
    }

    #[test]
    fn slots_are_dropped_once_idle() {
        let (_tmp, m) = manager();
        for id in 0..64 {
            let l = m.retrieve_lock(id).unwrap();
            l.lock();
            assert_eq!(m.inner.slots.len(), 1);
            l.unlock();
        }
        assert!(m.inner.slots.is_empty());
    }

    #[test]
    fn slot_survives_unlock_while_contended() {
        let (_tmp, m) = manager();
        let held = m.retrieve_lock(5).unwrap();
        held.lock();

        let m2 = m.clone();
        let waiter = thread::spawn(move || {
            let l = m2.retrieve_lock(5).unwrap();
            l.lock();
            thread::sleep(Duration::from_millis(20));
            l.unlock();
        });
        // Let the waiter block on the gate before releasing.
        thread::sleep(Duration::from_millis(50));
        held.unlock();
        waiter.join().unwrap();
        assert!(m.inner.slots.is_empty());

        // No stale state is left for the next holder.
        held.lock();
        held.unlock();
    }

    #[test]
    fn lock_excludes_other_threads() {
        let (_tmp, m) = manager();
        let held = m.allocate_lock().unwrap();
        held.lock();

        let (tx, rx) = mpsc::channel();
        let m2 = m.clone();
        let id = held.id();
        let waiter = thread::spawn(move || {
            let l = m2.retrieve_lock(id).unwrap();
            let start = Instant::now();
            l.lock();
            tx.send(start.elapsed()).unwrap();
            l.unlock();
        });
        thread::sleep(Duration::from_millis(50));
        held.unlock();
        let waited = rx.recv().unwrap();
        waiter.join().unwrap();
        assert!(waited >= Duration::from_millis(40));
    }

    #[test]
    fn free_all_keeps_foreign_files() {
        let (_tmp, m) = manager();
        for _ in 0..3 {
            let l = m.allocate_lock().unwrap();
            l.lock();
            l.unlock();
        }
        fs::write(m.dir().join("README"), b"x").unwrap();
        m.free_all_locks().unwrap();
        assert!(m.dir().join("README").exists());
        assert!(!m.dir().join("2").exists());
        assert!(m.dir().join("2.lock").exists());
        assert_eq!(m.allocate_lock().unwrap().id(), 0);
    }

    #[test]
    fn unlock_without_lock_is_ignored() {
        let (_tmp, m) = manager();
        m.allocate_lock().unwrap().unlock();
    }
}
