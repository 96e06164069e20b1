//! Multiprocess lock manager.
//!
//! Hands out numbered locks that any process on the host can take by ID. The
//! default backend keeps a fixed pool of robust, process-shared pthread
//! mutexes in a named shared-memory segment together with an allocation
//! bitmap; a lock whose holder dies is recovered by the next locker. A
//! lock-file backend and an in-process backend implement the same
//! `LockManager` interface.

pub mod config;
pub mod constants;
pub mod errors;
pub mod handle_registry;
pub mod helpers;
pub mod manager;
pub mod memory_manager;
pub mod platform;
pub mod public_api;
pub mod telemetry;

#[cfg(unix)]
pub mod file_manager;
#[cfg(target_os = "linux")]
pub mod segment;
#[cfg(target_os = "linux")]
pub mod shm_manager;
#[cfg(target_os = "linux")]
pub mod types;

pub use config::{open_manager, LockConfig, LockType};
pub use errors::{Error, ErrorCode, Result};
pub use manager::{LockGuard, LockManager, Locker};
pub use memory_manager::InMemoryManager;

#[cfg(unix)]
pub use file_manager::FileLockManager;
#[cfg(target_os = "linux")]
pub use segment::SegmentAllocator;
#[cfg(target_os = "linux")]
pub use shm_manager::ShmLockManager;

use once_cell::sync::OnceCell;

// ---- logging bootstraper -------------------------------------------------
pub(crate) fn ensure_logging() {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_init(|| {
        // Fallback: simple env_logger with RFC‑3339 ts off.
        let _ = env_logger::builder()
            .format_timestamp(None)
            .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
            .try_init();
    });
}
