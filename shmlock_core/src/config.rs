//! Backend selection and configuration.

use crate::constants::*;
use crate::errors::{Error, Result};
use crate::manager::LockManager;
use crate::memory_manager::InMemoryManager;
use log::{debug, trace, warn};
use std::path::PathBuf;
use std::str::FromStr;
#[cfg(target_os = "linux")]
use std::{thread, time::Duration};

#[cfg(unix)]
use crate::file_manager::FileLockManager;
#[cfg(target_os = "linux")]
use crate::shm_manager::ShmLockManager;

/// Which lock manager backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockType {
    #[default]
    Shm,
    File,
    Memory,
}

impl FromStr for LockType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "shm" => Ok(LockType::Shm),
            "file" => Ok(LockType::File),
            "memory" => Ok(LockType::Memory),
            other => Err(Error::InvalidConfig(format!("unknown lock type {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    pub lock_type: LockType,
    pub num_locks: u32,
    /// Name of the shared memory segment (`Shm` only).
    pub shm_path: String,
    /// Directory holding lock files (`File` only).
    pub lock_dir: PathBuf,
    /// Recreate the shm segment when its lock count no longer matches
    /// `num_locks`. Every existing allocation is lost.
    pub renumber: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_type: LockType::Shm,
            num_locks: DEFAULT_NUM_LOCKS,
            shm_path: default_shm_path(),
            lock_dir: std::env::temp_dir().join("shmlock").join("locks"),
            renumber: false,
        }
    }
}

/// Root gets the shared system path; other users get one keyed by their UID.
pub fn default_shm_path() -> String {
    #[cfg(unix)]
    {
        // SAFETY: geteuid cannot fail.
        let uid = unsafe { libc::geteuid() };
        if uid != 0 {
            return format!("{DEFAULT_ROOTLESS_SHM_PATH}_{uid}");
        }
    }
    DEFAULT_SHM_PATH.to_string()
}

impl LockConfig {
    /// Defaults overridden by the `SHMLOCK_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(v) = get(ENV_LOCK_TYPE) {
            cfg.lock_type = v.parse()?;
        }
        if let Some(v) = get(ENV_NUM_LOCKS) {
            cfg.num_locks = v
                .trim()
                .parse()
                .map_err(|e| Error::InvalidConfig(format!("{ENV_NUM_LOCKS}={v:?}: {e}")))?;
            if cfg.num_locks == 0 {
                return Err(Error::ZeroCapacity);
            }
        }
        if let Some(v) = get(ENV_SHM_PATH) {
            cfg.shm_path = v;
        }
        if let Some(v) = get(ENV_LOCK_DIR) {
            cfg.lock_dir = PathBuf::from(v);
        }
        if let Some(v) = get(ENV_RENUMBER) {
            cfg.renumber = match v.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                other => {
                    return Err(Error::InvalidConfig(format!("{ENV_RENUMBER}={other:?}")))
                }
            };
        }
        Ok(cfg)
    }
}

/// Open the configured backend, creating its backing store on first use.
pub fn open_manager(cfg: &LockConfig) -> Result<Box<dyn LockManager>> {
    match cfg.lock_type {
        LockType::Shm => open_shm(cfg),
        LockType::File => open_file(cfg),
        LockType::Memory => Ok(Box::new(InMemoryManager::new(cfg.num_locks)?)),
    }
}

#[cfg(target_os = "linux")]
fn open_shm(cfg: &LockConfig) -> Result<Box<dyn LockManager>> {
    let manager = match open_initialised_shm(cfg) {
        Ok(m) => m,
        Err(Error::SegmentNotFound(_)) => {
            debug!("No lock segment at {}, creating one", cfg.shm_path);
            create_or_open_shm(cfg)?
        }
        Err(Error::SegmentShapeMismatch { expected, actual }) if cfg.renumber => {
            warn!(
                "Lock segment {} holds {actual} locks, {expected} configured; recreating it",
                cfg.shm_path
            );
            ShmLockManager::unlink(&cfg.shm_path)?;
            create_or_open_shm(cfg)?
        }
        Err(e) => return Err(e),
    };
    Ok(Box::new(manager))
}

/// Another process may create the segment between our open and create.
#[cfg(target_os = "linux")]
fn create_or_open_shm(cfg: &LockConfig) -> Result<ShmLockManager> {
    match ShmLockManager::create(&cfg.shm_path, cfg.num_locks) {
        Err(Error::SegmentExists(_)) => open_initialised_shm(cfg),
        res => res,
    }
}

#[cfg(target_os = "linux")]
const INIT_WAIT_ATTEMPTS: u32 = 50;
#[cfg(target_os = "linux")]
const INIT_WAIT_DELAY: Duration = Duration::from_millis(10);

/// Open the segment, waiting a bounded time for a concurrent creator to
/// finish initialising it. A segment that never gets a valid header is
/// reported as foreign.
#[cfg(target_os = "linux")]
fn open_initialised_shm(cfg: &LockConfig) -> Result<ShmLockManager> {
    let mut attempt = 1;
    loop {
        match ShmLockManager::open(&cfg.shm_path, cfg.num_locks) {
            Err(Error::ForeignSegment(_)) if attempt < INIT_WAIT_ATTEMPTS => {
                trace!("Lock segment {} not initialised yet (attempt {attempt})", cfg.shm_path);
                attempt += 1;
                thread::sleep(INIT_WAIT_DELAY);
            }
            res => return res,
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn open_shm(_cfg: &LockConfig) -> Result<Box<dyn LockManager>> {
    Err(Error::NotImplemented("shared memory locks on this platform"))
}

#[cfg(unix)]
fn open_file(cfg: &LockConfig) -> Result<Box<dyn LockManager>> {
    let manager = match FileLockManager::open(&cfg.lock_dir) {
        Ok(m) => m,
        Err(Error::LockDirNotFound(_)) => match FileLockManager::create(&cfg.lock_dir) {
            Err(Error::LockDirExists(_)) => FileLockManager::open(&cfg.lock_dir)?,
            res => res?,
        },
        Err(e) => return Err(e),
    };
    Ok(Box::new(manager))
}

#[cfg(not(unix))]
fn open_file(_cfg: &LockConfig) -> Result<Box<dyn LockManager>> {
    Err(Error::NotImplemented("file locks on this platform"))
}
