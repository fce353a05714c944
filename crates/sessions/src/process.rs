//! Process liveness and termination.

use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(20);
const POLL: Duration = Duration::from_millis(500);

/// Whether a process exists (signal 0 probe).
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Whether a *child* process has exited (reaping it if so). Falls back to
/// the signal-0 probe for processes we did not spawn.
pub fn child_exited(pid: i32) -> bool {
    if pid <= 0 {
        return true;
    }
    match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => false,
        Ok(_) => true,
        // Not our child; the probe is all we have.
        Err(_) => !is_alive(pid),
    }
}

/// SIGTERM, wait up to the grace period, then SIGKILL. Reaps the child.
pub fn terminate(pid: i32) {
    if pid <= 0 {
        return;
    }
    let target = Pid::from_raw(pid);
    let _ = kill(target, Signal::SIGTERM);

    let deadline = Instant::now() + TERM_GRACE;
    while Instant::now() < deadline {
        if child_exited(pid) {
            return;
        }
        std::thread::sleep(POLL);
    }

    let _ = kill(target, Signal::SIGKILL);
    let _ = waitpid(target, None);
}

/// Immediate SIGKILL plus reap.
pub fn kill_now(pid: i32) {
    if pid <= 0 {
        return;
    }
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    let _ = waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG));
}
