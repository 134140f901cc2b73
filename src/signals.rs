//! Signal delivery to supervised processes.
//!
//! Signals go to the process group as well as the pid itself, since launches
//! run in their own session and may have spawned helpers.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::debug;

/// Ask a process (and its group) to terminate.
pub fn terminate(pid: u32) {
    send(pid, Signal::SIGTERM);
}

/// Forcibly kill a process (and its group).
pub fn force_kill(pid: u32) {
    send(pid, Signal::SIGKILL);
}

fn send(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if raw <= 0 {
        return;
    }
    // Group first, then the pid, tolerating processes already gone.
    if let Err(err) = kill(Pid::from_raw(-raw), signal) {
        debug!("{} to group {raw}: {err}", signal.as_str());
    }
    if let Err(err) = kill(Pid::from_raw(raw), signal) {
        debug!("{} to pid {raw}: {err}", signal.as_str());
    }
}
