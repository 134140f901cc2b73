//! Read-only OS introspection.
//!
//! The probe answers three questions about live system state: is a pid
//! alive, which pids are listening on a TCP port, and which pids match a
//! health pattern. It never mutates anything; reconciliation decisions stay
//! in the engine.

use std::collections::BTreeSet;
use std::process::Command;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use procfs::net::TcpState;
use procfs::process::{all_processes, FDTarget, Process};
use regex::Regex;
use tracing::debug;

/// Liveness queries the engine and drivers depend on. Object-safe so fakes
/// can be injected in tests.
pub trait LivenessProbe: Send + Sync {
    /// True iff a process with this pid exists and is not a zombie.
    fn is_alive(&self, pid: u32) -> bool;

    /// Pids bound to the given TCP port in the listening state.
    fn listening_pids(&self, port: u16) -> BTreeSet<u32>;

    /// Pids whose full command line matches the pattern. Never includes the
    /// probing process itself.
    fn matching_pids(&self, pattern: &Regex) -> BTreeSet<u32>;
}

/// Probe backed by the proc filesystem, corroborated by `lsof` for port
/// queries. A mechanism that is unavailable contributes the empty set.
pub struct ProcProbe {
    own_pid: u32,
}

impl ProcProbe {
    pub fn new() -> Self {
        Self {
            own_pid: std::process::id(),
        }
    }
}

impl Default for ProcProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessProbe for ProcProbe {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        let raw = match i32::try_from(pid) {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => !is_zombie(raw),
            // Exists but owned by someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn listening_pids(&self, port: u16) -> BTreeSet<u32> {
        let mut pids = socket_table_pids(port);
        pids.extend(lsof_pids(port));
        pids
    }

    fn matching_pids(&self, pattern: &Regex) -> BTreeSet<u32> {
        let mut pids = BTreeSet::new();
        let Ok(processes) = all_processes() else {
            return pids;
        };
        for process in processes.filter_map(|p| p.ok()) {
            let pid = process.pid as u32;
            if pid == self.own_pid {
                continue;
            }
            if process.stat().map(|s| s.state == 'Z').unwrap_or(true) {
                continue;
            }
            let Ok(cmdline) = process.cmdline() else {
                continue;
            };
            if cmdline.is_empty() {
                continue;
            }
            if pattern.is_match(&cmdline.join(" ")) {
                pids.insert(pid);
            }
        }
        pids
    }
}

fn is_zombie(pid: i32) -> bool {
    Process::new(pid)
        .and_then(|p| p.stat())
        .map(|s| s.state == 'Z')
        .unwrap_or(false)
}

/// Kernel socket table joined against per-process fd inodes.
fn socket_table_pids(port: u16) -> BTreeSet<u32> {
    let mut inodes = BTreeSet::new();
    for entries in [procfs::net::tcp(), procfs::net::tcp6()]
        .into_iter()
        .filter_map(|r| r.ok())
    {
        for entry in entries {
            if entry.local_address.port() == port && matches!(entry.state, TcpState::Listen) {
                inodes.insert(entry.inode);
            }
        }
    }
    if inodes.is_empty() {
        return BTreeSet::new();
    }

    let mut pids = BTreeSet::new();
    let Ok(processes) = all_processes() else {
        return pids;
    };
    for process in processes.filter_map(|p| p.ok()) {
        let Ok(fds) = process.fd() else {
            // Not ours to inspect; lsof may still see it.
            continue;
        };
        for fd in fds.filter_map(|f| f.ok()) {
            if let FDTarget::Socket(inode) = fd.target {
                if inodes.contains(&inode) {
                    pids.insert(process.pid as u32);
                    break;
                }
            }
        }
    }
    pids
}

/// Secondary corroboration via lsof. Absent binary or failed run yields the
/// empty set.
fn lsof_pids(port: u16) -> BTreeSet<u32> {
    let output = Command::new("lsof")
        .args(["-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .output();
    match output {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect(),
        Ok(_) => BTreeSet::new(),
        Err(err) => {
            debug!("lsof unavailable: {err}");
            BTreeSet::new()
        }
    }
}
