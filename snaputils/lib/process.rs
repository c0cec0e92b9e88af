//! Helpers for inspecting and signalling processes by pid.

use std::time::Duration;

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};

use crate::{UtilsError, UtilsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How often [`wait_for_exit`] re-checks the pid.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks whether a process with the given pid exists.
///
/// Sending signal 0 checks existence without delivering anything. `EPERM` means the process
/// exists but belongs to someone else, so it counts as running.
pub fn is_process_running(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Checks whether the process has exited but has not been reaped yet.
pub fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };

    // The command name is wrapped in parentheses and may itself contain spaces.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|state| state == "Z")
        .unwrap_or(false)
}

/// Checks whether a process is running and able to do work.
pub fn is_process_alive(pid: u32) -> bool {
    is_process_running(pid) && !is_zombie(pid)
}

/// Sends `SIGTERM` to the process. A process that is already gone is not an error.
pub fn terminate_process(pid: u32) -> UtilsResult<()> {
    signal_process(pid, Signal::SIGTERM)
}

/// Sends `SIGKILL` to the process. A process that is already gone is not an error.
pub fn kill_process(pid: u32) -> UtilsResult<()> {
    signal_process(pid, Signal::SIGKILL)
}

/// Waits until the process disappears or turns into a zombie.
///
/// Returns `false` if the process was still alive when `timeout` elapsed.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while is_process_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }

    true
}

fn signal_process(pid: u32, sig: Signal) -> UtilsResult<()> {
    if pid == 0 {
        return Ok(());
    }

    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(UtilsError::Signal { pid, source }),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
