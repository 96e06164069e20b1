//! Platform-specific module for shmlock

#[cfg(unix)]
pub mod unix;
