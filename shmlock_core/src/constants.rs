//! Constants and configuration defaults for the lock manager

/// Bits per bitmap word. Lock counts are always rounded up to a multiple of this.
pub const BITMAP_SIZE: u32 = u32::BITS;

pub const SEGMENT_MAGIC: u64 = 0x5348_4D4C_4F43_4B53; // "SHMLOCKS"

pub const DEFAULT_NUM_LOCKS: u32 = 2048;

pub const DEFAULT_SHM_PATH: &str = "/libpod_lock";
pub const DEFAULT_ROOTLESS_SHM_PATH: &str = "/libpod_rootless_lock";

/// POSIX shm names are limited to NAME_MAX including the leading slash.
pub const SHM_NAME_MAX: usize = 255;

pub const LOCK_DIR_MODE: u32 = 0o700;
pub const LOCK_FILE_MODE: u32 = 0o600;

// Environment overrides read by `LockConfig::from_env`
pub const ENV_LOCK_TYPE: &str = "SHMLOCK_LOCK_TYPE";
pub const ENV_NUM_LOCKS: &str = "SHMLOCK_NUM_LOCKS";
pub const ENV_SHM_PATH: &str = "SHMLOCK_SHM_PATH";
pub const ENV_LOCK_DIR: &str = "SHMLOCK_LOCK_DIR";
pub const ENV_RENUMBER: &str = "SHMLOCK_RENUMBER";
