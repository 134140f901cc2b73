//! Lifecycle reconciliation engine.
//!
//! The `Supervisor` decides, per service, whether it is running, which pids
//! identify it when the record and the observed state disagree, how a stop
//! escalates, and when a start counts as confirmed. It reconciles two
//! independent sources of truth, the pid record and live OS introspection,
//! because either can go stale on its own.
//!
//! Every wait is a bounded sleep-and-recheck loop; the engine runs to
//! completion within one invocation and never blocks unboundedly.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{Config, Registry, ServiceDescriptor, ServiceKind};
use crate::driver::{driver_for, Driver, HealthSignature};
use crate::error::{Error, Result};
use crate::logs;
use crate::probe::LivenessProbe;
use crate::store::PidStore;

const GRACE_POLL: Duration = Duration::from_millis(100);

/// Bounded-wait policy for the polling loops.
#[derive(Debug, Clone)]
pub struct PollPolicy {
    /// Confirmation attempts after a launch.
    pub start_attempts: u32,
    /// Delay between confirmation attempts.
    pub start_interval: Duration,
    /// Grace period before a stop escalates to a force kill.
    pub stop_grace: Duration,
    /// Delay before the post-stop port re-probe, and between the halves of a
    /// restart.
    pub settle: Duration,
    /// Window drivers get to re-resolve a forked server pid.
    pub resolve_window: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            start_attempts: 10,
            start_interval: Duration::from_secs(1),
            stop_grace: Duration::from_millis(1500),
            settle: Duration::from_secs(1),
            resolve_window: Duration::from_secs(2),
        }
    }
}

impl PollPolicy {
    /// Defaults overridden by whatever the config file sets.
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        Self {
            start_attempts: config.start_attempts.unwrap_or(defaults.start_attempts),
            start_interval: config
                .start_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.start_interval),
            stop_grace: config
                .stop_grace_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.stop_grace),
            settle: config
                .settle_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.settle),
            resolve_window: config
                .resolve_window_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.resolve_window),
        }
    }
}

/// Snapshot of the two observed liveness signals, computed fresh per query
/// and never stored.
#[derive(Debug, Clone)]
pub struct Observed {
    /// Pids matching the service's health pattern.
    pub matched: BTreeSet<u32>,
    /// Pids listening on the service's port.
    pub listeners: BTreeSet<u32>,
}

impl Observed {
    /// OR-combination of the two signals. Deliberately permissive: a foreign
    /// process squatting the port still reads as running, which is preferred
    /// over missing a live service. The accompanying inconsistency warning
    /// is how the operator tells the two apart.
    pub fn is_running(&self) -> bool {
        !self.matched.is_empty() || !self.listeners.is_empty()
    }

    pub fn union(&self) -> BTreeSet<u32> {
        self.matched.union(&self.listeners).copied().collect()
    }

    fn inconsistency(&self) -> Option<Inconsistency> {
        if self.matched.is_empty() != self.listeners.is_empty() {
            Some(Inconsistency {
                matched: self.matched.clone(),
                listeners: self.listeners.clone(),
            })
        } else {
            None
        }
    }
}

/// Liveness verdict for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    Running { pids: BTreeSet<u32>, port: u16 },
    NotRunning,
}

/// Disagreement between the two observed signals that cannot be silently
/// resolved: either a foreign process holds the port, or the service is
/// alive but has not bound its port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inconsistency {
    pub matched: BTreeSet<u32>,
    pub listeners: BTreeSet<u32>,
}

impl std::fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.matched.is_empty() {
            write!(
                f,
                "port is bound by pid(s) {} but no process matches the health pattern",
                fmt_pids(&self.listeners)
            )
        } else {
            write!(
                f,
                "pid(s) {} match the health pattern but none is listening on the port",
                fmt_pids(&self.matched)
            )
        }
    }
}

/// Status verdict plus the warning channel that must never be dropped.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub status: RuntimeStatus,
    pub inconsistency: Option<Inconsistency>,
    pub url: String,
}

/// Result of a `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The record already named a live pid; nothing was done.
    AlreadyRunning { pid: u32 },
    Started { pid: u32, url: String },
}

/// Result of a `stop`. All variants are success: residual listeners are a
/// warning, not a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    WasNotRunning,
    /// The port still had listeners after the settle re-probe.
    ResidualProcesses { listeners: BTreeSet<u32> },
}

/// Result of a `restart`: both halves, since either may carry a warning.
#[derive(Debug, Clone)]
pub struct RestartOutcome {
    pub stop: StopOutcome,
    pub start: StartOutcome,
}

/// The lifecycle engine. Constructed with its registry, probe and store
/// (dependency injection keeps it testable with synthetic descriptors);
/// drivers resolve per kind and can be replaced the same way.
pub struct Supervisor {
    registry: Registry,
    probe: Box<dyn LivenessProbe>,
    store: Box<dyn PidStore>,
    drivers: HashMap<ServiceKind, Box<dyn Driver>>,
    policy: PollPolicy,
    log_dir: PathBuf,
}

impl Supervisor {
    pub fn new(
        registry: Registry,
        probe: Box<dyn LivenessProbe>,
        store: Box<dyn PidStore>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            probe,
            store,
            drivers: HashMap::new(),
            policy: PollPolicy::default(),
            log_dir: log_dir.into(),
        }
    }

    pub fn with_policy(mut self, policy: PollPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the driver for one kind.
    pub fn with_driver(mut self, kind: ServiceKind, driver: Box<dyn Driver>) -> Self {
        self.drivers.insert(kind, driver);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn descriptor(&self, key: &str) -> Result<&ServiceDescriptor> {
        self.registry
            .get(key)
            .ok_or_else(|| Error::UnknownService(key.to_string()))
    }

    fn driver(&self, kind: ServiceKind) -> &dyn Driver {
        self.drivers
            .get(&kind)
            .map(|d| d.as_ref())
            .unwrap_or_else(|| driver_for(kind))
    }

    fn observe(&self, desc: &ServiceDescriptor) -> Observed {
        Observed {
            matched: self.probe.matching_pids(&desc.pattern),
            listeners: self.probe.listening_pids(desc.port),
        }
    }

    /// Self-healing read of the pid record: a recorded pid that is no longer
    /// alive is purged before the value escapes to the caller.
    fn recorded_live_pid(&self, key: &str) -> Result<Option<u32>> {
        match self.store.get(key)? {
            Some(pid) if self.probe.is_alive(pid) => Ok(Some(pid)),
            Some(pid) => {
                debug!("{key}: purging stale pid record {pid}");
                self.store.clear(key)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn url(desc: &ServiceDescriptor, sig: &HealthSignature) -> String {
        match sig.url_path.as_deref() {
            Some(path) => {
                let sep = if path.starts_with('/') { "" } else { "/" };
                format!("http://localhost:{}{}{}", desc.port, sep, path)
            }
            None => format!("http://localhost:{}", desc.port),
        }
    }

    /// Starts a service unless its record already names a live process.
    /// Confirmation polls the OR of both observed signals for a bounded
    /// number of attempts; exhaustion clears the record and fails.
    pub async fn start(&self, key: &str) -> Result<StartOutcome> {
        let desc = self.descriptor(key)?;
        if let Some(pid) = self.recorded_live_pid(key)? {
            info!("{key}: already running with pid {pid}");
            return Ok(StartOutcome::AlreadyRunning { pid });
        }

        let driver = self.driver(desc.kind);
        let sig = driver.health_signature(desc);
        let log_path = logs::log_path(&self.log_dir, key);
        let pid = driver
            .launch(desc, self.probe.as_ref(), &log_path, self.policy.resolve_window)
            .await?;
        self.store.set(key, pid)?;
        info!("{key}: launched with pid {pid}");

        for attempt in 1..=self.policy.start_attempts {
            let observed = self.observe(desc);
            if observed.is_running() {
                debug!("{key}: confirmed on attempt {attempt}");
                return Ok(StartOutcome::Started {
                    pid,
                    url: Self::url(desc, &sig),
                });
            }
            if attempt < self.policy.start_attempts {
                tokio::time::sleep(self.policy.start_interval).await;
            }
        }

        self.store.clear(key)?;
        Err(Error::StartupTimeout {
            service: key.to_string(),
            attempts: self.policy.start_attempts,
        })
    }

    /// Stops every process that looks like the service, escalating after a
    /// bounded grace period, and clears the record unconditionally.
    /// Idempotent: with nothing running it reports `WasNotRunning`.
    pub async fn stop(&self, key: &str) -> Result<StopOutcome> {
        let desc = self.descriptor(key)?;
        let driver = self.driver(desc.kind);

        // Candidates from all three sources: the record alone can miss
        // helper children spawned by wrapper launches.
        let recorded = self.store.get(key)?;
        let observed = self.observe(desc);
        let mut candidates = observed.union();
        if let Some(pid) = recorded {
            candidates.insert(pid);
        }
        let was_running = candidates.iter().any(|pid| self.probe.is_alive(*pid));

        driver.graceful_stop(desc, recorded).await?;
        for pid in &candidates {
            if Some(*pid) != recorded {
                driver.terminate(*pid);
            }
        }

        let deadline = tokio::time::Instant::now() + self.policy.stop_grace;
        while tokio::time::Instant::now() < deadline
            && candidates.iter().any(|pid| self.probe.is_alive(*pid))
        {
            tokio::time::sleep(GRACE_POLL.min(self.policy.stop_grace)).await;
        }
        for pid in &candidates {
            if self.probe.is_alive(*pid) {
                warn!("{key}: pid {pid} survived the grace period, force-killing");
                driver.force_kill(*pid);
            }
        }

        self.store.clear(key)?;

        tokio::time::sleep(self.policy.settle).await;
        let listeners = self.probe.listening_pids(desc.port);
        if !listeners.is_empty() {
            warn!(
                "{key}: port {} still has listeners {}",
                desc.port,
                fmt_pids(&listeners)
            );
            return Ok(StopOutcome::ResidualProcesses { listeners });
        }
        Ok(if was_running {
            StopOutcome::Stopped
        } else {
            StopOutcome::WasNotRunning
        })
    }

    /// Stop, settle, start. Either half's failure surfaces unchanged; there
    /// is no partial rollback.
    pub async fn restart(&self, key: &str) -> Result<RestartOutcome> {
        let stop = self.stop(key).await?;
        tokio::time::sleep(self.policy.settle).await;
        let start = self.start(key).await?;
        Ok(RestartOutcome { stop, start })
    }

    /// Computes the liveness verdict from observed state and the
    /// (self-healed) record. Mutates nothing except the lazy stale purge.
    pub fn status(&self, key: &str) -> Result<StatusReport> {
        let desc = self.descriptor(key)?;
        let sig = self.driver(desc.kind).health_signature(desc);
        let observed = self.observe(desc);
        let recorded = self.recorded_live_pid(key)?;

        let inconsistency = observed.inconsistency();
        if let Some(inconsistency) = &inconsistency {
            warn!("{key}: {inconsistency}");
        }

        let status = if observed.is_running() || recorded.is_some() {
            let mut pids = observed.union();
            if let Some(pid) = recorded {
                pids.insert(pid);
            }
            RuntimeStatus::Running {
                pids,
                port: desc.port,
            }
        } else {
            RuntimeStatus::NotRunning
        };

        Ok(StatusReport {
            status,
            inconsistency,
            url: Self::url(desc, &sig),
        })
    }
}

pub fn fmt_pids(pids: &BTreeSet<u32>) -> String {
    pids.iter()
        .map(|pid| pid.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::config::ServiceConfig;
    use crate::probe::testing::FakeProbe;
    use crate::store::testing::FakeStore;

    const KEY: &str = "svc";
    const PORT: u16 = 9801;

    fn test_registry(kind: ServiceKind, cmd: &str, match_pattern: Option<&str>) -> Registry {
        let config = Config {
            state_dir: None,
            start_attempts: None,
            start_interval_ms: None,
            stop_grace_ms: None,
            settle_ms: None,
            resolve_window_ms: None,
            services: vec![ServiceConfig {
                key: KEY.to_string(),
                name: None,
                kind,
                port: PORT,
                dir: None,
                cmd: cmd.to_string(),
                pre_cmd: None,
                stop_cmd: None,
                match_pattern: match_pattern.map(str::to_string),
                url_path: None,
                env: None,
            }],
        };
        Registry::from_config(&config).unwrap()
    }

    fn fast_policy() -> PollPolicy {
        PollPolicy {
            start_attempts: 3,
            start_interval: Duration::ZERO,
            stop_grace: Duration::ZERO,
            settle: Duration::ZERO,
            resolve_window: Duration::ZERO,
        }
    }

    /// Synthetic driver that manipulates the fake probe the way a real spawn
    /// would manipulate the OS.
    struct FakeDriver {
        probe: Arc<FakeProbe>,
        launch_pid: u32,
        /// Whether a launch registers a health-pattern match (a launch that
        /// never produces an observable signal times out).
        register_match: bool,
        fail_launch: bool,
        /// Pretend the process ignores SIGTERM.
        ignore_terminate: bool,
        /// Pretend nothing can kill it (foreign squatter case).
        indestructible: bool,
        launches: Arc<AtomicU32>,
    }

    impl FakeDriver {
        fn new(probe: &Arc<FakeProbe>, launch_pid: u32) -> Self {
            Self {
                probe: Arc::clone(probe),
                launch_pid,
                register_match: true,
                fail_launch: false,
                ignore_terminate: false,
                indestructible: false,
                launches: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl Driver for FakeDriver {
        async fn launch(
            &self,
            _desc: &ServiceDescriptor,
            _probe: &dyn LivenessProbe,
            _log_path: &std::path::Path,
            _resolve_window: Duration,
        ) -> crate::error::Result<u32> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            if self.fail_launch {
                return Err(Error::Launch {
                    service: KEY.to_string(),
                    detail: "synthetic failure".to_string(),
                });
            }
            if self.register_match {
                self.probe.add_match(self.launch_pid);
            } else {
                self.probe.add_alive(self.launch_pid);
            }
            Ok(self.launch_pid)
        }

        fn terminate(&self, pid: u32) {
            if !self.ignore_terminate && !self.indestructible {
                self.probe.kill(pid);
            }
        }

        fn force_kill(&self, pid: u32) {
            if !self.indestructible {
                self.probe.kill(pid);
            }
        }
    }

    struct Harness {
        probe: Arc<FakeProbe>,
        store: Arc<FakeStore>,
        launches: Arc<AtomicU32>,
        supervisor: Supervisor,
    }

    fn harness_with(driver: impl FnOnce(&Arc<FakeProbe>) -> FakeDriver) -> Harness {
        let registry = test_registry(ServiceKind::Python, "placeholder-server --serve", None);
        let probe = FakeProbe::new();
        let store = FakeStore::new();
        let driver = driver(&probe);
        let launches = Arc::clone(&driver.launches);
        let supervisor = Supervisor::new(
            registry,
            Box::new(Arc::clone(&probe)),
            Box::new(Arc::clone(&store)),
            std::env::temp_dir(),
        )
        .with_policy(fast_policy())
        .with_driver(ServiceKind::Python, Box::new(driver));
        Harness {
            probe,
            store,
            launches,
            supervisor,
        }
    }

    fn harness() -> Harness {
        harness_with(|probe| FakeDriver::new(probe, 500))
    }

    #[tokio::test]
    async fn unknown_service_is_an_error() {
        let h = harness();
        assert!(matches!(
            h.supervisor.start("nope").await,
            Err(Error::UnknownService(_))
        ));
        assert!(matches!(
            h.supervisor.stop("nope").await,
            Err(Error::UnknownService(_))
        ));
        assert!(matches!(
            h.supervisor.status("nope"),
            Err(Error::UnknownService(_))
        ));
    }

    #[tokio::test]
    async fn start_records_the_pid_and_confirms() {
        let h = harness();
        let outcome = h.supervisor.start(KEY).await.unwrap();
        assert_eq!(
            outcome,
            StartOutcome::Started {
                pid: 500,
                url: format!("http://localhost:{PORT}"),
            }
        );
        assert_eq!(h.store.pid(KEY), Some(500));
    }

    #[tokio::test]
    async fn start_while_running_is_a_noop() {
        let h = harness();
        h.probe.add_alive(777);
        h.store.seed(KEY, 777);

        let outcome = h.supervisor.start(KEY).await.unwrap();
        assert_eq!(outcome, StartOutcome::AlreadyRunning { pid: 777 });
        // Record untouched, no launch issued.
        assert_eq!(h.store.pid(KEY), Some(777));
        assert_eq!(h.launches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn start_purges_a_stale_record_and_launches() {
        let h = harness();
        h.store.seed(KEY, 444); // never alive

        let outcome = h.supervisor.start(KEY).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Started { pid: 500, .. }));
        assert_eq!(h.store.pid(KEY), Some(500));
    }

    #[tokio::test]
    async fn start_timeout_clears_the_record() {
        let h = harness_with(|probe| {
            let mut driver = FakeDriver::new(probe, 500);
            driver.register_match = false;
            driver
        });

        let err = h.supervisor.start(KEY).await.unwrap_err();
        assert!(matches!(
            err,
            Error::StartupTimeout {
                attempts: 3,
                ..
            }
        ));
        assert_eq!(h.store.pid(KEY), None);
    }

    #[tokio::test]
    async fn launch_failure_leaves_no_record() {
        let h = harness_with(|probe| {
            let mut driver = FakeDriver::new(probe, 500);
            driver.fail_launch = true;
            driver
        });

        let err = h.supervisor.start(KEY).await.unwrap_err();
        assert!(matches!(err, Error::Launch { .. }));
        assert_eq!(h.store.pid(KEY), None);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let h = harness();
        assert_eq!(h.supervisor.stop(KEY).await.unwrap(), StopOutcome::WasNotRunning);
        assert_eq!(h.supervisor.stop(KEY).await.unwrap(), StopOutcome::WasNotRunning);
        assert_eq!(h.supervisor.status(KEY).unwrap().status, RuntimeStatus::NotRunning);
    }

    #[tokio::test]
    async fn stop_twice_after_a_start_never_errors() {
        let h = harness();
        h.supervisor.start(KEY).await.unwrap();
        assert_eq!(h.supervisor.stop(KEY).await.unwrap(), StopOutcome::Stopped);
        assert_eq!(h.supervisor.stop(KEY).await.unwrap(), StopOutcome::WasNotRunning);
        assert_eq!(h.supervisor.status(KEY).unwrap().status, RuntimeStatus::NotRunning);
    }

    #[tokio::test]
    async fn stop_gathers_candidates_from_all_three_sources() {
        let h = harness();
        h.probe.add_alive(500);
        h.store.seed(KEY, 500);
        h.probe.add_match(501);
        h.probe.add_listener(PORT, 502);

        assert_eq!(h.supervisor.stop(KEY).await.unwrap(), StopOutcome::Stopped);
        for pid in [500, 501, 502] {
            assert!(!h.probe.is_alive(pid), "pid {pid} should be gone");
        }
        assert_eq!(h.store.pid(KEY), None);
    }

    #[tokio::test]
    async fn stop_escalates_when_terminate_is_ignored() {
        let h = harness_with(|probe| {
            let mut driver = FakeDriver::new(probe, 500);
            driver.ignore_terminate = true;
            driver
        });
        h.supervisor.start(KEY).await.unwrap();

        assert_eq!(h.supervisor.stop(KEY).await.unwrap(), StopOutcome::Stopped);
        assert!(!h.probe.is_alive(500));
        assert_eq!(h.store.pid(KEY), None);
    }

    #[tokio::test]
    async fn stop_reports_residual_listeners() {
        let h = harness_with(|probe| {
            let mut driver = FakeDriver::new(probe, 500);
            driver.indestructible = true;
            driver
        });
        h.probe.add_listener(PORT, 888);

        let outcome = h.supervisor.stop(KEY).await.unwrap();
        assert_eq!(
            outcome,
            StopOutcome::ResidualProcesses {
                listeners: BTreeSet::from([888]),
            }
        );
        // The record is still cleared unconditionally.
        assert_eq!(h.store.pid(KEY), None);
    }

    #[tokio::test]
    async fn status_reports_running_on_match_signal_alone() {
        let h = harness();
        h.probe.add_match(501);

        let report = h.supervisor.status(KEY).unwrap();
        assert_eq!(
            report.status,
            RuntimeStatus::Running {
                pids: BTreeSet::from([501]),
                port: PORT,
            }
        );
        let inconsistency = report.inconsistency.unwrap();
        assert_eq!(inconsistency.matched, BTreeSet::from([501]));
        assert!(inconsistency.listeners.is_empty());
    }

    #[tokio::test]
    async fn status_reports_running_on_port_signal_alone() {
        let h = harness();
        h.probe.add_listener(PORT, 502);

        let report = h.supervisor.status(KEY).unwrap();
        assert_eq!(
            report.status,
            RuntimeStatus::Running {
                pids: BTreeSet::from([502]),
                port: PORT,
            }
        );
        let inconsistency = report.inconsistency.unwrap();
        assert!(inconsistency.matched.is_empty());
        assert_eq!(inconsistency.listeners, BTreeSet::from([502]));
    }

    #[tokio::test]
    async fn status_with_both_signals_has_no_inconsistency() {
        let h = harness();
        h.probe.add_match(501);
        h.probe.add_listener(PORT, 501);

        let report = h.supervisor.status(KEY).unwrap();
        assert!(report.inconsistency.is_none());
        assert_eq!(
            report.status,
            RuntimeStatus::Running {
                pids: BTreeSet::from([501]),
                port: PORT,
            }
        );
    }

    #[tokio::test]
    async fn status_trusts_a_live_record_without_observed_signals() {
        let h = harness();
        h.probe.add_alive(500);
        h.store.seed(KEY, 500);

        let report = h.supervisor.status(KEY).unwrap();
        assert_eq!(
            report.status,
            RuntimeStatus::Running {
                pids: BTreeSet::from([500]),
                port: PORT,
            }
        );
        assert!(report.inconsistency.is_none());
    }

    #[tokio::test]
    async fn status_self_heals_a_dead_record() {
        let h = harness();
        h.store.seed(KEY, 444); // not alive

        let report = h.supervisor.status(KEY).unwrap();
        assert_eq!(report.status, RuntimeStatus::NotRunning);
        assert_eq!(h.store.pid(KEY), None);
    }

    #[tokio::test]
    async fn restart_stops_then_starts() {
        let h = harness();
        h.supervisor.start(KEY).await.unwrap();
        assert_eq!(h.store.pid(KEY), Some(500));

        let outcome = h.supervisor.restart(KEY).await.unwrap();
        assert_eq!(outcome.stop, StopOutcome::Stopped);
        assert!(matches!(outcome.start, StartOutcome::Started { pid: 500, .. }));
        assert_eq!(h.store.pid(KEY), Some(500));
    }

    #[tokio::test]
    async fn url_includes_the_path_suffix() {
        let config = Config {
            state_dir: None,
            start_attempts: None,
            start_interval_ms: None,
            stop_grace_ms: None,
            settle_ms: None,
            resolve_window_ms: None,
            services: vec![ServiceConfig {
                key: KEY.to_string(),
                name: None,
                kind: ServiceKind::Jvm,
                port: PORT,
                dir: None,
                cmd: "java -jar app.jar".to_string(),
                pre_cmd: None,
                stop_cmd: None,
                match_pattern: None,
                url_path: Some("/app".to_string()),
                env: None,
            }],
        };
        let registry = Registry::from_config(&config).unwrap();
        let probe = FakeProbe::new();
        let store = FakeStore::new();
        let supervisor = Supervisor::new(
            registry,
            Box::new(Arc::clone(&probe)),
            Box::new(store),
            std::env::temp_dir(),
        )
        .with_policy(fast_policy());

        let report = supervisor.status(KEY).unwrap();
        assert_eq!(report.url, format!("http://localhost:{PORT}/app"));
    }

    #[tokio::test]
    async fn policy_reads_config_overrides() {
        let config: Config = toml::from_str(
            r#"
start_attempts = 5
start_interval_ms = 250
stop_grace_ms = 100
settle_ms = 50
resolve_window_ms = 400

[[service]]
key = "svc"
kind = "python"
port = 9000
cmd = "python3 app.py"
"#,
        )
        .unwrap();
        let policy = PollPolicy::from_config(&config);
        assert_eq!(policy.start_attempts, 5);
        assert_eq!(policy.start_interval, Duration::from_millis(250));
        assert_eq!(policy.stop_grace, Duration::from_millis(100));
        assert_eq!(policy.settle, Duration::from_millis(50));
        assert_eq!(policy.resolve_window, Duration::from_millis(400));
    }

    /// Launch that forks into a child with a different pid (fake probe
    /// variant; see `system_tests` for the real one): the record must end up
    /// naming the child.
    #[tokio::test]
    async fn forked_launch_records_the_resolved_child() {
        struct ForkingDriver {
            probe: Arc<FakeProbe>,
        }

        #[async_trait]
        impl Driver for ForkingDriver {
            async fn launch(
                &self,
                desc: &ServiceDescriptor,
                probe: &dyn LivenessProbe,
                _log_path: &std::path::Path,
                resolve_window: Duration,
            ) -> crate::error::Result<u32> {
                // The initiating pid (600) forks the real server (601).
                self.probe.add_match(600);
                self.probe.add_match(601);
                let mut best = 600;
                let deadline = tokio::time::Instant::now() + resolve_window;
                loop {
                    if let Some(pid) = probe
                        .matching_pids(&desc.pattern)
                        .iter()
                        .rev()
                        .find(|p| **p != 600)
                    {
                        best = *pid;
                        break;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(best)
            }

            fn terminate(&self, pid: u32) {
                self.probe.kill(pid);
            }

            fn force_kill(&self, pid: u32) {
                self.probe.kill(pid);
            }
        }

        let registry = test_registry(ServiceKind::Node, "wrapper start", None);
        let probe = FakeProbe::new();
        let store = FakeStore::new();
        let supervisor = Supervisor::new(
            registry,
            Box::new(Arc::clone(&probe)),
            Box::new(Arc::clone(&store)),
            std::env::temp_dir(),
        )
        .with_policy(fast_policy())
        .with_driver(
            ServiceKind::Node,
            Box::new(ForkingDriver {
                probe: Arc::clone(&probe),
            }),
        );

        let outcome = supervisor.start(KEY).await.unwrap();
        assert!(matches!(outcome, StartOutcome::Started { pid: 601, .. }));
        assert_eq!(store.pid(KEY), Some(601));
    }
}
