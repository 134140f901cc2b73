//! stackctl: a local supervisor for a polyglot service stack.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads the service registry, constructs the lifecycle engine,
//! and dispatches one operation per invocation. Operating on "all" is a
//! sequential loop in registry order; one service's failure is recorded and
//! iteration continues.

mod config;
mod driver;
mod engine;
mod error;
mod logs;
mod probe;
mod signals;
mod store;

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use crate::config::Registry;
use crate::engine::{
    fmt_pids, PollPolicy, RestartOutcome, RuntimeStatus, StartOutcome, StopOutcome, Supervisor,
};
use crate::probe::ProcProbe;
use crate::store::FilePidStore;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "stackctl",
    version,
    about = "Supervisor for a local polyglot service stack",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to stackctl.toml configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Emit machine-readable JSON instead of status lines.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a service (or "all").
    Start { service: String },
    /// Stop a service (or "all").
    Stop { service: String },
    /// Stop and then start a service (or "all").
    Restart { service: String },
    /// Report liveness of a service (or "all").
    Status { service: String },
    /// Print the tail of one service's log file.
    Logs {
        service: String,
        /// Number of lines to print.
        #[arg(long, default_value_t = 50)]
        lines: usize,
    },
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Start,
    Stop,
    Restart,
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("stackctl.toml"));
    let config = config::load_config(&config_path)?;
    let registry = Registry::from_config(&config)?;
    if registry.is_empty() {
        bail!("no services defined in {}", config_path.display());
    }

    let base = match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let state_dir = config.resolved_state_dir(base);
    let log_dir = state_dir.join("logs");

    if let Commands::Logs { service, lines } = &cli.command {
        return run_logs(&registry, service, *lines, &log_dir, cli.json);
    }

    let supervisor = Supervisor::new(
        registry,
        Box::new(ProcProbe::new()),
        Box::new(FilePidStore::new(state_dir.join("run"))),
        &log_dir,
    )
    .with_policy(PollPolicy::from_config(&config));

    let (op, service) = match &cli.command {
        Commands::Start { service } => (Op::Start, service),
        Commands::Stop { service } => (Op::Stop, service),
        Commands::Restart { service } => (Op::Restart, service),
        Commands::Status { service } => (Op::Status, service),
        Commands::Logs { .. } => unreachable!("handled above"),
    };
    run_op(&supervisor, service, op, cli.json).await
}

/// Applies one operation to each target service in registry order. A failure
/// is reported for its service and does not abort the remaining ones.
async fn run_op(supervisor: &Supervisor, service: &str, op: Op, json: bool) -> Result<()> {
    let targets = resolve_targets(supervisor.registry(), service)?;
    let mut reports = Vec::with_capacity(targets.len());
    for key in targets {
        let report = apply(supervisor, &key, op).await;
        if !json {
            for line in &report.lines {
                println!("{line}");
            }
        }
        reports.push(report);
    }

    if json {
        let values: Vec<serde_json::Value> = reports.iter().map(|r| r.value.clone()).collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
    }

    let failures = reports.iter().filter(|r| !r.ok).count();
    if failures > 0 {
        bail!("{failures} of {} service operation(s) failed", reports.len());
    }
    Ok(())
}

fn resolve_targets(registry: &Registry, service: &str) -> Result<Vec<String>> {
    if service == "all" {
        Ok(registry.keys().map(str::to_string).collect())
    } else if registry.get(service).is_some() {
        Ok(vec![service.to_string()])
    } else {
        bail!("unknown service: {service}");
    }
}

/// Per-service outcome: human status lines plus the JSON value, and whether
/// the operation counts as failed for the exit code.
struct OpReport {
    ok: bool,
    lines: Vec<String>,
    value: serde_json::Value,
}

async fn apply(supervisor: &Supervisor, key: &str, op: Op) -> OpReport {
    match op {
        Op::Start => start_report(key, supervisor.start(key).await),
        Op::Stop => stop_report(key, supervisor.stop(key).await),
        Op::Restart => match supervisor.restart(key).await {
            Ok(RestartOutcome { stop, start }) => {
                let mut report = stop_report(key, Ok(stop));
                let started = start_report(key, Ok(start));
                report.lines.extend(started.lines);
                report.value = json!({
                    "service": key,
                    "result": "restarted",
                    "stop": report.value["result"].clone(),
                    "start": started.value,
                });
                report
            }
            Err(err) => fail_report(key, &err),
        },
        Op::Status => match supervisor.status(key) {
            Ok(report) => {
                let name = supervisor
                    .registry()
                    .get(key)
                    .map(|d| d.display_name.clone())
                    .unwrap_or_else(|| key.to_string());
                let mut lines = Vec::new();
                let mut value = match &report.status {
                    RuntimeStatus::Running { pids, port } => {
                        lines.push(format!(
                            "● {name}: running (pid {}) {}",
                            fmt_pids(pids),
                            report.url
                        ));
                        json!({
                            "service": key,
                            "name": name,
                            "result": "running",
                            "pids": pids,
                            "port": port,
                            "url": report.url,
                        })
                    }
                    RuntimeStatus::NotRunning => {
                        lines.push(format!("○ {name}: not running"));
                        json!({ "service": key, "name": name, "result": "not-running" })
                    }
                };
                if let Some(inconsistency) = &report.inconsistency {
                    lines.push(format!("! {name}: warning: {inconsistency}"));
                    value["warning"] = json!({
                        "matched": inconsistency.matched,
                        "listeners": inconsistency.listeners,
                    });
                }
                OpReport {
                    ok: true,
                    lines,
                    value,
                }
            }
            Err(err) => fail_report(key, &err),
        },
    }
}

fn start_report(key: &str, result: crate::error::Result<StartOutcome>) -> OpReport {
    match result {
        Ok(StartOutcome::Started { pid, url }) => OpReport {
            ok: true,
            lines: vec![format!("◆ {key}: started (pid {pid}) {url}")],
            value: json!({ "service": key, "result": "started", "pid": pid, "url": url }),
        },
        Ok(StartOutcome::AlreadyRunning { pid }) => OpReport {
            ok: true,
            lines: vec![format!("◆ {key}: already running (pid {pid})")],
            value: json!({ "service": key, "result": "already-running", "pid": pid }),
        },
        Err(err) => fail_report(key, &err),
    }
}

fn stop_report(key: &str, result: crate::error::Result<StopOutcome>) -> OpReport {
    match result {
        Ok(StopOutcome::Stopped) => OpReport {
            ok: true,
            lines: vec![format!("◆ {key}: stopped")],
            value: json!({ "service": key, "result": "stopped" }),
        },
        Ok(StopOutcome::WasNotRunning) => OpReport {
            ok: true,
            lines: vec![format!("◆ {key}: was not running")],
            value: json!({ "service": key, "result": "was-not-running" }),
        },
        // Non-fatal: the stop completed but the port is not free.
        Ok(StopOutcome::ResidualProcesses { listeners }) => OpReport {
            ok: true,
            lines: vec![
                format!("◆ {key}: stopped"),
                format!(
                    "! {key}: warning: port still has listeners (pid {})",
                    fmt_pids(&listeners)
                ),
            ],
            value: json!({
                "service": key,
                "result": "residual-listeners",
                "listeners": listeners,
            }),
        },
        Err(err) => fail_report(key, &err),
    }
}

fn fail_report(key: &str, err: &crate::error::Error) -> OpReport {
    OpReport {
        ok: false,
        lines: vec![format!("✖ {key}: {err}")],
        value: json!({ "service": key, "error": err.to_string() }),
    }
}

fn run_logs(
    registry: &Registry,
    service: &str,
    lines: usize,
    log_dir: &Path,
    json: bool,
) -> Result<()> {
    if service == "all" {
        bail!("logs requires a single service key");
    }
    if registry.get(service).is_none() {
        bail!("unknown service: {service}");
    }
    let path = logs::log_path(log_dir, service);
    let tail = logs::tail(&path, lines)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "service": service, "lines": tail }))?
        );
        return Ok(());
    }
    if tail.is_empty() {
        println!("◆ {service}: no log output yet");
    }
    for line in &tail {
        println!("{line}");
    }
    Ok(())
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
