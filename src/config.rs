//! Configuration management for stackctl.
//!
//! This module defines the structure of the `stackctl.toml` registry file and
//! turns it into the immutable `Registry` of service descriptors that the
//! lifecycle engine is constructed with.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use serde::Deserialize;

/// Top-level configuration structure corresponding to `stackctl.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory for pid files and service logs (default: ".stackctl").
    pub state_dir: Option<String>,
    /// Confirmation polling attempts after a launch.
    pub start_attempts: Option<u32>,
    /// Delay between confirmation attempts, in milliseconds.
    pub start_interval_ms: Option<u64>,
    /// Grace period before escalating a stop to a force kill, in milliseconds.
    pub stop_grace_ms: Option<u64>,
    /// Settle delay before re-probing a port after stop, and between the
    /// halves of a restart, in milliseconds.
    pub settle_ms: Option<u64>,
    /// Window for re-resolving the real server pid after a forking launch,
    /// in milliseconds.
    pub resolve_window_ms: Option<u64>,
    /// List of supervised services.
    #[serde(rename = "service")]
    pub services: Vec<ServiceConfig>,
}

/// Configuration for a single service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Unique registry key (e.g. "python").
    pub key: String,
    /// Display name; defaults to the key.
    pub name: Option<String>,
    /// Runtime kind selecting the driver.
    pub kind: ServiceKind,
    /// TCP port the service is expected to bind. Unique across services.
    pub port: u16,
    /// Working directory for launch and stop commands.
    pub dir: Option<String>,
    /// Launch command.
    pub cmd: String,
    /// Command to run before launching (dependency install, build).
    pub pre_cmd: Option<String>,
    /// Dedicated stop command for kinds with a bundled shutdown script.
    pub stop_cmd: Option<String>,
    /// Override for the health pattern matched against process command lines.
    /// Defaults to the escaped launch command.
    #[serde(rename = "match")]
    pub match_pattern: Option<String>,
    /// Path suffix appended to the reported URL when the canonical route is
    /// not at the root.
    pub url_path: Option<String>,
    /// Environment variables to set for launch and pre commands.
    pub env: Option<HashMap<String, String>>,
}

/// The closed set of runtime kinds the driver set covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Interpreted runtime launched directly (the interpreter is the server).
    Python,
    /// VM-based runtime with a build pre-step and multi-stage startup.
    Jvm,
    /// JIT runtime launched through a package-manager wrapper that forks the
    /// real server process.
    Node,
    /// Process-forking web server with a bundled stop script.
    Httpd,
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Python => "python",
            Self::Jvm => "jvm",
            Self::Node => "node",
            Self::Httpd => "httpd",
        };
        f.write_str(name)
    }
}

/// Immutable description of one supervised service. Created at registry load
/// and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub key: String,
    pub display_name: String,
    pub kind: ServiceKind,
    pub port: u16,
    pub dir: Option<PathBuf>,
    /// Launch program.
    pub cmd: String,
    /// Launch arguments.
    pub args: Vec<String>,
    pub pre_cmd: Option<String>,
    pub stop_cmd: Option<String>,
    /// Compiled health pattern matched against full command lines.
    pub pattern: Regex,
    pub url_path: Option<String>,
    pub env: HashMap<String, String>,
}

/// The service registry: descriptors in file order, unique keys and ports.
#[derive(Debug, Clone)]
pub struct Registry {
    services: Vec<ServiceDescriptor>,
}

impl Registry {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut services = Vec::with_capacity(config.services.len());
        for service in &config.services {
            services.push(descriptor_from_config(service)?);
        }
        ensure_unique(&services)?;
        Ok(Self { services })
    }

    pub fn get(&self, key: &str) -> Option<&ServiceDescriptor> {
        self.services.iter().find(|s| s.key == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|s| s.key.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl Config {
    /// State directory resolved against the directory the config was loaded
    /// from, so invocations behave the same regardless of cwd.
    pub fn resolved_state_dir(&self, base: &Path) -> PathBuf {
        let dir = self.state_dir.as_deref().unwrap_or(".stackctl");
        let dir = Path::new(dir);
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            base.join(dir)
        }
    }
}

fn descriptor_from_config(config: &ServiceConfig) -> Result<ServiceDescriptor> {
    let mut parts = shell_words::split(&config.cmd)
        .with_context(|| format!("failed to parse cmd for {}", config.key))?;
    if parts.is_empty() {
        return Err(anyhow!("empty cmd for {}", config.key));
    }
    let cmd = parts.remove(0);

    // Health pattern: explicit override, or the launch command line verbatim.
    let pattern = match &config.match_pattern {
        Some(raw) => Regex::new(raw)
            .with_context(|| format!("invalid match pattern for {}", config.key))?,
        None => {
            let mut line = cmd.clone();
            for arg in &parts {
                line.push(' ');
                line.push_str(arg);
            }
            Regex::new(&regex::escape(&line))
                .with_context(|| format!("failed to build health pattern for {}", config.key))?
        }
    };

    Ok(ServiceDescriptor {
        key: config.key.clone(),
        display_name: config.name.clone().unwrap_or_else(|| config.key.clone()),
        kind: config.kind,
        port: config.port,
        dir: config.dir.as_ref().map(PathBuf::from),
        cmd,
        args: parts,
        pre_cmd: config.pre_cmd.clone(),
        stop_cmd: config.stop_cmd.clone(),
        pattern,
        url_path: config.url_path.clone(),
        env: config.env.clone().unwrap_or_default(),
    })
}

fn ensure_unique(services: &[ServiceDescriptor]) -> Result<()> {
    for (idx, service) in services.iter().enumerate() {
        for other in &services[..idx] {
            if other.key == service.key {
                bail!("duplicate service key: {}", service.key);
            }
            if other.port == service.port {
                bail!(
                    "services {} and {} share port {}",
                    other.key,
                    service.key,
                    service.port
                );
            }
        }
    }
    Ok(())
}

/// Loads and parses the registry from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}
