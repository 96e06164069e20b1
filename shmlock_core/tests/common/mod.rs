#![allow(dead_code)]

/// A shm name no other test run can collide with.
pub fn unique_name(tag: &str) -> String {
    format!("/shmlock_test_{tag}_{}_{:08x}", std::process::id(), rand::random::<u32>())
}

/// Unlinks the named segment when dropped, so failed tests don't leak it.
#[cfg(target_os = "linux")]
pub struct Cleanup(pub String);

#[cfg(target_os = "linux")]
impl Drop for Cleanup {
    fn drop(&mut self) {
        let _ = shmlock_core::ShmLockManager::unlink(&self.0);
    }
}

/// Run `child` in a forked process and return its exit status. The child
/// never returns into the test harness.
#[cfg(target_os = "linux")]
pub fn run_in_child(child: impl FnOnce() -> i32) -> i32 {
    // SAFETY: the child only runs `child` and then `_exit`s.
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");
    if pid == 0 {
        let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(child)).unwrap_or(101);
        unsafe { libc::_exit(code) };
    }
    wait_child(pid)
}

#[cfg(target_os = "linux")]
pub fn wait_child(pid: libc::pid_t) -> i32 {
    let mut status = 0;
    let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(rc, pid, "waitpid failed");
    assert!(libc::WIFEXITED(status), "child did not exit normally: {status}");
    libc::WEXITSTATUS(status)
}
