//! Backend health monitoring.
//!
//! A check runs the probes of a [`BackendProbe`] in a fixed order, each under
//! its own timeout, and folds the results into a [`HealthSnapshot`]. The
//! periodic loop owns its interval and never shares retry state with
//! application calls.

pub mod latency;
pub mod probe;

pub use latency::{LatencyStatistics, LatencyTracker, DEFAULT_SAMPLE_WINDOW};
pub use probe::{BackendProbe, HttpBackendProbe};

use crate::errors::RawError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Probe names, in execution order
pub mod checks {
    /// Basic reachability
    pub const CONNECTIVITY: &str = "connectivity";
    /// Core table read
    pub const CORE_TABLE: &str = "core_table";
    /// Derived view read
    pub const DERIVED_VIEW: &str = "derived_view";
    /// Realtime capability
    pub const REALTIME: &str = "realtime";
}

/// Aggregate backend status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Connectivity, core table and derived view pass with acceptable latency
    Healthy,
    /// Reachable, but a capability failed or latency is elevated
    Degraded,
    /// Connectivity failed
    Down,
}

impl HealthStatus {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Down => "down",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded => 1,
            Self::Down => 2,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Aggregate status
    pub status: HealthStatus,
    /// Connectivity probe latency, when it succeeded
    pub latency_ms: Option<u64>,
    /// When the check finished
    pub timestamp: DateTime<Utc>,
    /// Outcome of each probe by name
    pub checks: BTreeMap<String, bool>,
    /// First probe failure, if any
    pub error: Option<String>,
}

impl HealthSnapshot {
    /// Outcome of one probe; unknown names are `false`
    pub fn check(&self, name: &str) -> bool {
        self.checks.get(name).copied().unwrap_or(false)
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    /// Time between periodic checks
    pub interval: Duration,
    /// Timeout for each probe
    pub probe_timeout: Duration,
    /// Connectivity latency at or above which the backend is degraded
    pub latency_threshold: Duration,
    /// Latency samples kept for statistics
    pub sample_window: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            latency_threshold: Duration::from_millis(1_000),
            sample_window: DEFAULT_SAMPLE_WINDOW,
        }
    }
}

impl HealthConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the periodic interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the per-probe timeout
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Set the latency threshold
    pub fn latency_threshold(mut self, threshold: Duration) -> Self {
        self.latency_threshold = threshold;
        self
    }

    /// Set the latency sample window
    pub fn sample_window(mut self, samples: usize) -> Self {
        self.sample_window = samples;
        self
    }
}

/// Handle returned by [`HealthMonitor::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type HealthCallback = Arc<dyn Fn(&HealthSnapshot) + Send + Sync>;

struct MonitorState {
    probe: Arc<dyn BackendProbe>,
    config: HealthConfig,
    latency: LatencyTracker,
    snapshots: watch::Sender<Option<HealthSnapshot>>,
    subscribers: Mutex<Vec<(SubscriptionId, HealthCallback)>>,
    next_subscription: AtomicU64,
}

struct PeriodicTask {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Runs health checks on demand or on a schedule
pub struct HealthMonitor {
    state: Arc<MonitorState>,
    task: Mutex<Option<PeriodicTask>>,
}

impl HealthMonitor {
    /// Create a monitor over `probe`
    pub fn new(probe: Arc<dyn BackendProbe>, config: HealthConfig) -> Self {
        let (snapshots, _) = watch::channel(None);
        Self {
            state: Arc::new(MonitorState {
                probe,
                config,
                latency: LatencyTracker::new(config.sample_window),
                snapshots,
                subscribers: Mutex::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
            }),
            task: Mutex::new(None),
        }
    }

    /// Monitor settings
    pub fn config(&self) -> &HealthConfig {
        &self.state.config
    }

    /// Run every probe once and publish the snapshot
    pub async fn check_once(&self) -> HealthSnapshot {
        self.state.check_once().await
    }

    /// Start checking every `interval`, beginning immediately.
    ///
    /// Does nothing if the loop is already running.
    pub fn start_periodic(&self, interval: Duration) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            debug!("Health monitor already running");
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        state.check_once().await;
                    }
                }
            }
            debug!("Health monitor loop stopped");
        });

        info!(interval_ms = interval.as_millis() as u64, "Health monitor started");
        *task = Some(PeriodicTask {
            shutdown_tx,
            handle,
        });
    }

    /// Stop the periodic loop.
    ///
    /// Waits for a check in progress to finish; no check runs after this
    /// returns.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown_tx.send(()).await;
            let _ = task.handle.await;
            info!("Health monitor stopped");
        }
    }

    /// Whether the periodic loop is running
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Latest snapshot, if a check has completed
    pub fn latest(&self) -> Option<HealthSnapshot> {
        self.state.snapshots.borrow().clone()
    }

    /// Receiver updated after every check
    pub fn watch(&self) -> watch::Receiver<Option<HealthSnapshot>> {
        self.state.snapshots.subscribe()
    }

    /// Call `callback` after every check
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&HealthSnapshot) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.state.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.state.subscribers.lock().push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscriber, returning whether it existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.state.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        subscribers.len() != before
    }

    /// Statistics over recent connectivity latencies
    pub fn latency_statistics(&self) -> LatencyStatistics {
        self.state.latency.statistics()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.handle.abort();
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.state.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl MonitorState {
    async fn check_once(&self) -> HealthSnapshot {
        let mut checks = BTreeMap::new();
        let mut first_error = None;

        let started = Instant::now();
        let connectivity = self.run_probe(self.probe.connectivity()).await;
        let elapsed = started.elapsed();

        let latency_ms = match &connectivity {
            Ok(()) => {
                self.latency.record(elapsed);
                Some(elapsed.as_millis() as u64)
            }
            Err(_) => None,
        };

        let results = [
            (checks::CONNECTIVITY, connectivity),
            (checks::CORE_TABLE, self.run_probe(self.probe.core_table()).await),
            (checks::DERIVED_VIEW, self.run_probe(self.probe.derived_view()).await),
            (checks::REALTIME, self.run_probe(self.probe.realtime()).await),
        ];
        for (name, result) in results {
            if let Err(error) = &result {
                debug!(check = name, code = %error.code, "Health probe failed");
                first_error.get_or_insert_with(|| format!("{name}: {error}"));
            }
            checks.insert(name.to_string(), result.is_ok());
        }

        let snapshot = HealthSnapshot {
            status: self.derive_status(&checks, elapsed),
            latency_ms,
            timestamp: Utc::now(),
            checks,
            error: first_error,
        };
        self.publish(&snapshot);
        snapshot
    }

    async fn run_probe<Fut>(&self, probe: Fut) -> Result<(), RawError>
    where
        Fut: Future<Output = Result<(), RawError>>,
    {
        match tokio::time::timeout(self.config.probe_timeout, probe).await {
            Ok(result) => result,
            Err(_) => Err(RawError::timeout(self.config.probe_timeout)),
        }
    }

    fn derive_status(&self, checks: &BTreeMap<String, bool>, latency: Duration) -> HealthStatus {
        let passed = |name: &str| checks.get(name).copied().unwrap_or(false);

        if !passed(checks::CONNECTIVITY) {
            HealthStatus::Down
        } else if passed(checks::CORE_TABLE)
            && passed(checks::DERIVED_VIEW)
            && latency < self.config.latency_threshold
        {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }
    }

    fn publish(&self, snapshot: &HealthSnapshot) {
        let previous = self.snapshots.send_replace(Some(snapshot.clone()));
        let previous_status = previous.map(|s| s.status);

        match previous_status {
            Some(prev) if prev == snapshot.status => {}
            Some(prev) if snapshot.status.rank() > prev.rank() => warn!(
                from = %prev,
                to = %snapshot.status,
                error = snapshot.error.as_deref().unwrap_or(""),
                "Backend health degraded"
            ),
            Some(prev) => info!(from = %prev, to = %snapshot.status, "Backend health recovered"),
            None => info!(status = %snapshot.status, "Initial backend health"),
        }

        let subscribers: Vec<HealthCallback> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in subscribers {
            // A panicking subscriber must not take the periodic loop down.
            if panic::catch_unwind(AssertUnwindSafe(|| callback(snapshot))).is_err() {
                warn!(status = %snapshot.status, "Health subscriber panicked");
            }
        }
    }
}
