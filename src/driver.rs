//! Kind-specific launch and stop behavior.
//!
//! One driver per runtime kind supplies the launch action (with its
//! pre-step), the graceful-stop action, and the health signature used for
//! process-table matching. The lifecycle engine is driver-agnostic and only
//! talks to the `Driver` trait.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{ServiceDescriptor, ServiceKind};
use crate::error::{Error, Result};
use crate::logs;
use crate::probe::LivenessProbe;
use crate::signals;

/// How a kind presents itself to the outside world: the pattern its server
/// process matches in the process table, and whether the canonical URL sits
/// below a path suffix.
#[derive(Debug, Clone)]
pub struct HealthSignature {
    pub pattern: Regex,
    pub url_path: Option<String>,
}

/// Capability interface of one runtime kind.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Runs the kind-specific pre-step (if any), spawns the launch command
    /// detached, and returns the pid that best represents the main process.
    /// Forking kinds re-resolve the pid against the health pattern within
    /// `resolve_window` before falling back to the initiating pid.
    async fn launch(
        &self,
        desc: &ServiceDescriptor,
        probe: &dyn LivenessProbe,
        log_path: &Path,
        resolve_window: Duration,
    ) -> Result<u32>;

    /// Kind-specific graceful shutdown: the dedicated stop command when the
    /// kind has one, otherwise a termination signal to the recorded pid.
    async fn graceful_stop(&self, desc: &ServiceDescriptor, pid: Option<u32>) -> Result<()> {
        let _ = desc;
        if let Some(pid) = pid {
            self.terminate(pid);
        }
        Ok(())
    }

    fn health_signature(&self, desc: &ServiceDescriptor) -> HealthSignature {
        HealthSignature {
            pattern: desc.pattern.clone(),
            url_path: desc.url_path.clone(),
        }
    }

    /// Plain-signal primitives the engine applies to gathered candidates.
    /// Overridable so tests can exercise escalation without real signals.
    fn terminate(&self, pid: u32) {
        signals::terminate(pid);
    }

    fn force_kill(&self, pid: u32) {
        signals::force_kill(pid);
    }
}

/// Default driver for a runtime kind.
pub fn driver_for(kind: ServiceKind) -> &'static dyn Driver {
    match kind {
        ServiceKind::Python => &PythonDriver,
        ServiceKind::Jvm => &JvmDriver,
        ServiceKind::Node => &NodeDriver,
        ServiceKind::Httpd => &HttpdDriver,
    }
}

/// Interpreted runtime: the launched interpreter is the server process.
pub struct PythonDriver;

#[async_trait]
impl Driver for PythonDriver {
    async fn launch(
        &self,
        desc: &ServiceDescriptor,
        _probe: &dyn LivenessProbe,
        log_path: &Path,
        _resolve_window: Duration,
    ) -> Result<u32> {
        run_pre_cmd(desc, log_path).await?;
        spawn_detached(desc, log_path)
    }
}

/// VM-based runtime: a build pre-step, then one long-lived VM process whose
/// multi-stage startup is covered by the engine's confirmation budget.
pub struct JvmDriver;

#[async_trait]
impl Driver for JvmDriver {
    async fn launch(
        &self,
        desc: &ServiceDescriptor,
        _probe: &dyn LivenessProbe,
        log_path: &Path,
        _resolve_window: Duration,
    ) -> Result<u32> {
        run_pre_cmd(desc, log_path).await?;
        spawn_detached(desc, log_path)
    }
}

/// Package-manager wrapper: the launch command forks the real server, so the
/// recorded pid is re-resolved against the health pattern.
pub struct NodeDriver;

#[async_trait]
impl Driver for NodeDriver {
    async fn launch(
        &self,
        desc: &ServiceDescriptor,
        probe: &dyn LivenessProbe,
        log_path: &Path,
        resolve_window: Duration,
    ) -> Result<u32> {
        run_pre_cmd(desc, log_path).await?;
        let spawned = spawn_detached(desc, log_path)?;
        Ok(resolve_spawned_pid(probe, &desc.pattern, spawned, resolve_window).await)
    }
}

/// Process-forking web server with a bundled stop script that may release
/// resources a bare signal would not.
pub struct HttpdDriver;

#[async_trait]
impl Driver for HttpdDriver {
    async fn launch(
        &self,
        desc: &ServiceDescriptor,
        probe: &dyn LivenessProbe,
        log_path: &Path,
        resolve_window: Duration,
    ) -> Result<u32> {
        run_pre_cmd(desc, log_path).await?;
        let spawned = spawn_detached(desc, log_path)?;
        Ok(resolve_spawned_pid(probe, &desc.pattern, spawned, resolve_window).await)
    }

    async fn graceful_stop(&self, desc: &ServiceDescriptor, pid: Option<u32>) -> Result<()> {
        if let Some(stop_cmd) = &desc.stop_cmd {
            match run_stop_cmd(desc, stop_cmd).await {
                Ok(()) => return Ok(()),
                Err(detail) => {
                    warn!("{}: stop command failed ({detail}), falling back to signal", desc.key);
                }
            }
        }
        if let Some(pid) = pid {
            self.terminate(pid);
        }
        Ok(())
    }
}

/// Runs the configured pre command (dependency install, build) to completion,
/// with its output appended to the service log.
async fn run_pre_cmd(desc: &ServiceDescriptor, log_path: &Path) -> Result<()> {
    let Some(pre_cmd) = &desc.pre_cmd else {
        return Ok(());
    };
    let mut parts = shell_words::split(pre_cmd).map_err(|e| Error::Launch {
        service: desc.key.clone(),
        detail: format!("failed to parse pre_cmd: {e}"),
    })?;
    if parts.is_empty() {
        return Ok(());
    }
    let program = parts.remove(0);

    let log = logs::open_append(log_path)?;
    let log_err = log
        .try_clone()
        .map_err(|e| Error::Io("failed to clone log handle", e))?;
    let mut command = Command::new(&program);
    command
        .args(&parts)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    if let Some(dir) = &desc.dir {
        command.current_dir(dir);
    }
    if !desc.env.is_empty() {
        command.envs(&desc.env);
    }

    let status = command.status().await.map_err(|e| Error::Launch {
        service: desc.key.clone(),
        detail: format!("pre_cmd {program} failed to run: {e}"),
    })?;
    if !status.success() {
        return Err(Error::Launch {
            service: desc.key.clone(),
            detail: format!("pre_cmd exited {}", status.code().unwrap_or(1)),
        });
    }
    Ok(())
}

/// Spawns the launch command in its own session with stdio appended to the
/// service log, and returns without waiting: the server must outlive this
/// invocation.
fn spawn_detached(desc: &ServiceDescriptor, log_path: &Path) -> Result<u32> {
    let log = logs::open_append(log_path)?;
    let log_err = log
        .try_clone()
        .map_err(|e| Error::Io("failed to clone log handle", e))?;

    let mut command = Command::new(&desc.cmd);
    command
        .args(&desc.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    if let Some(dir) = &desc.dir {
        command.current_dir(dir);
    }
    if !desc.env.is_empty() {
        command.envs(&desc.env);
    }

    unsafe {
        command.pre_exec(|| {
            // Own session: detached from our terminal, signallable as a group.
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command.spawn().map_err(|e| Error::Launch {
        service: desc.key.clone(),
        detail: format!("failed to spawn {}: {e}", desc.cmd),
    })?;
    child.id().ok_or_else(|| Error::Launch {
        service: desc.key.clone(),
        detail: "spawned process exited before its pid could be read".to_string(),
    })
}

/// After a forking launch, watch the process table for a health-pattern
/// match with a different pid than the initiating call's. Falls back to the
/// initiating pid when the window closes: a possibly wrong record is better
/// than none.
async fn resolve_spawned_pid(
    probe: &dyn LivenessProbe,
    pattern: &Regex,
    spawned: u32,
    window: Duration,
) -> u32 {
    const POLL: Duration = Duration::from_millis(200);
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let matches = probe.matching_pids(pattern);
        // Highest non-initiating pid: the most recently spawned match.
        if let Some(pid) = matches.iter().rev().find(|p| **p != spawned) {
            return *pid;
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(POLL).await;
    }
    debug!(
        "no distinct pattern match within {}ms, recording initiating pid {spawned}",
        window.as_millis()
    );
    spawned
}

/// Runs a dedicated stop command to completion. Errors are returned as plain
/// detail strings; the caller decides whether to fall back to signaling.
async fn run_stop_cmd(desc: &ServiceDescriptor, raw: &str) -> std::result::Result<(), String> {
    let mut parts =
        shell_words::split(raw).map_err(|e| format!("failed to parse stop_cmd: {e}"))?;
    if parts.is_empty() {
        return Ok(());
    }
    let program = parts.remove(0);
    let mut command = Command::new(&program);
    command
        .args(&parts)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if let Some(dir) = &desc.dir {
        command.current_dir(dir);
    }
    if !desc.env.is_empty() {
        command.envs(&desc.env);
    }
    let status = command
        .status()
        .await
        .map_err(|e| format!("{program} failed to run: {e}"))?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("{program} exited {}", status.code().unwrap_or(1)))
    }
}
