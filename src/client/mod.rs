//! Resilient client: the single entry point for remote data access.
//!
//! Reads go cache → rate limiter → circuit breaker → retry executor.
//! Writes take the same path when online and are queued when offline. A
//! write to a resource that still has queued writes is queued behind them,
//! so writes to one resource land in the order they were issued.
//! Successful and queued writes invalidate every cache key under
//! `"{resource_key}:"`.

use crate::cache::{CacheLookup, CacheStore};
use crate::config::ClientConfig;
use crate::errors::{ConfigurationError, DataResult, RawError};
use crate::health::{
    BackendProbe, HealthMonitor, HealthSnapshot, HttpBackendProbe, LatencyStatistics,
    SubscriptionId,
};
use crate::observability::{
    log_classified_error, operation_span, record_error_code, record_outcome, ClientMetrics,
    MetricsSnapshot, Outcome,
};
use crate::offline::{ConnectivitySignal, FlushReport, OfflineQueue, OperationKind, QueuedReceipt};
use crate::resilience::{
    CircuitBreakerRegistry, CircuitState, RateLimiter, RetryExecutor, RetryPolicy,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument, Span};

/// Value returned by a read that may fall back to stale data
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome<T> {
    /// The value
    pub value: T,
    /// Whether the value is past its TTL because the refresh failed
    pub stale: bool,
}

/// Result of a write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome<T> {
    /// The backend applied the write
    Completed(T),
    /// The client is offline; the write was queued for replay
    Queued(QueuedReceipt),
}

impl<T> WriteOutcome<T> {
    /// Whether the write was queued
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued(_))
    }

    /// The backend result, if the write completed
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Queued(_) => None,
        }
    }
}

/// Builder for [`ResilientClient`]
pub struct ResilientClientBuilder {
    config: ClientConfig,
    probe: Option<Arc<dyn BackendProbe>>,
    connectivity: Option<ConnectivitySignal>,
    metrics: Option<Arc<ClientMetrics>>,
}

impl ResilientClientBuilder {
    /// Start from `config`
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            probe: None,
            connectivity: None,
            metrics: None,
        }
    }

    /// Use a custom health probe instead of the HTTP one
    pub fn probe(mut self, probe: Arc<dyn BackendProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Share a connectivity signal with the caller
    pub fn connectivity(mut self, signal: ConnectivitySignal) -> Self {
        self.connectivity = Some(signal);
        self
    }

    /// Share a metrics collector with the caller
    pub fn metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the client.
    ///
    /// Needs either a custom probe or a backend in the configuration.
    pub fn build(self) -> Result<ResilientClient, ConfigurationError> {
        let config = self.config;
        config.validate()?;

        let probe: Arc<dyn BackendProbe> = match (self.probe, &config.backend) {
            (Some(probe), _) => probe,
            (None, Some(backend)) => Arc::new(HttpBackendProbe::new(
                backend.clone(),
                config.health.probe_timeout,
            )?),
            (None, None) => {
                return Err(ConfigurationError::InvalidValue {
                    name: "backend",
                    message: "a backend URL or a custom health probe is required".to_string(),
                })
            }
        };

        let metrics = self.metrics.unwrap_or_default();
        let retry = RetryExecutor::new()
            .with_call_timeout(config.call_timeout)
            .with_metrics(metrics.clone());

        let inner = ClientInner {
            cache: CacheStore::with_config(config.cache.clone()),
            rate_limiter: RateLimiter::with_config(config.rate_limit),
            breakers: CircuitBreakerRegistry::new(config.circuit_breaker),
            retry,
            offline: OfflineQueue::new(),
            connectivity: self.connectivity.unwrap_or_default(),
            health: HealthMonitor::new(probe, config.health),
            flush_requested: Notify::new(),
            metrics,
            config,
        };

        Ok(ResilientClient {
            inner: Arc::new(inner),
            flush_watcher: Mutex::new(None),
        })
    }
}

struct ClientInner {
    config: ClientConfig,
    cache: CacheStore,
    rate_limiter: RateLimiter,
    breakers: CircuitBreakerRegistry,
    retry: RetryExecutor,
    offline: OfflineQueue,
    connectivity: ConnectivitySignal,
    health: HealthMonitor,
    flush_requested: Notify,
    metrics: Arc<ClientMetrics>,
}

impl ClientInner {
    /// Rate limiter, then circuit breaker, then retries.
    ///
    /// The breaker sees one outcome per retry sequence.
    async fn call<T, F, Fut>(
        &self,
        resource_key: &str,
        policy: &RetryPolicy,
        operation: F,
    ) -> DataResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RawError>>,
    {
        if let Err(error) = self.rate_limiter.try_acquire(resource_key) {
            self.metrics.record_rate_limited();
            return Err(error);
        }

        let breaker = self.breakers.breaker(resource_key);
        let permit = match breaker.try_acquire() {
            Ok(permit) => permit,
            Err(error) => {
                // The call never reaches the backend.
                self.rate_limiter.release(resource_key);
                self.metrics.record_circuit_rejection();
                return Err(error);
            }
        };

        let result = self.retry.execute(policy, operation).await;
        permit.record(&result);

        if let Err(error) = &result {
            self.metrics.record_failure();
            log_classified_error(resource_key, error);
        }
        result
    }

    fn invalidate_resource(&self, resource_key: &str) -> usize {
        self.cache.invalidate(&format!("{resource_key}:"))
    }

    /// Replay queued writes through the normal call path.
    ///
    /// A replay waits for its resource's rate limit window rather than
    /// failing on it.
    async fn flush_offline(&self) -> FlushReport {
        let policy = self.config.retry_policy;
        self.offline
            .flush_with(|operation| {
                let command = operation.command.clone();
                let resource_key = operation.resource_key.clone();
                async move {
                    if let Some(wait) = self.rate_limiter.retry_after(&resource_key) {
                        debug!(
                            resource_key = %resource_key,
                            wait_ms = wait.as_millis() as u64,
                            "Replay waiting for rate limit window"
                        );
                        tokio::time::sleep(wait).await;
                    }
                    self.call(&resource_key, &policy, move || command()).await?;
                    self.invalidate_resource(&resource_key);
                    self.metrics.record_replayed_write();
                    Ok(())
                }
            })
            .await
    }
}

struct BackgroundTask {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Resilient access to the hosted backend.
///
/// Create one per application with [`ResilientClient::builder`] and share it.
pub struct ResilientClient {
    inner: Arc<ClientInner>,
    flush_watcher: Mutex<Option<BackgroundTask>>,
}

impl ResilientClient {
    /// Create a builder from `config`
    pub fn builder(config: ClientConfig) -> ResilientClientBuilder {
        ResilientClientBuilder::new(config)
    }

    /// Read through the cache with the default retry policy.
    ///
    /// `ttl` of `None` uses the cache's default TTL.
    pub async fn execute_read<T, F, Fut>(
        &self,
        resource_key: &str,
        cache_key: &str,
        ttl: Option<Duration>,
        operation: F,
    ) -> DataResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RawError>>,
    {
        let policy = self.inner.config.retry_policy;
        self.execute_read_with_policy(resource_key, cache_key, ttl, &policy, operation)
            .await
    }

    /// Read through the cache with an explicit retry policy
    pub async fn execute_read_with_policy<T, F, Fut>(
        &self,
        resource_key: &str,
        cache_key: &str,
        ttl: Option<Duration>,
        policy: &RetryPolicy,
        operation: F,
    ) -> DataResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RawError>>,
    {
        let span = operation_span("read", resource_key);
        let inner = &self.inner;

        async move {
            inner.metrics.record_read();
            if let Some(value) = inner.cache.get::<T>(cache_key) {
                inner.metrics.record_cache_hit();
                record_outcome(&Span::current(), Outcome::CacheHit);
                debug!(cache_key, "Served from cache");
                return Ok(value);
            }
            inner.metrics.record_cache_miss();

            match inner.call(resource_key, policy, operation).await {
                Ok(value) => {
                    let ttl = ttl.unwrap_or_else(|| inner.cache.default_ttl());
                    inner.cache.set(cache_key, value.clone(), ttl);
                    record_outcome(&Span::current(), Outcome::Success);
                    Ok(value)
                }
                Err(error) => {
                    record_error_code(&Span::current(), error.code());
                    Err(error)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Read through the cache, serving an expired value if the refresh fails.
    ///
    /// A fresh hit returns immediately. On a miss or an expired entry the
    /// operation runs; if it fails and an expired value of the right type is
    /// still cached, that value is returned with `stale = true`.
    pub async fn execute_read_stale_on_error<T, F, Fut>(
        &self,
        resource_key: &str,
        cache_key: &str,
        ttl: Option<Duration>,
        operation: F,
    ) -> DataResult<ReadOutcome<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RawError>>,
    {
        let span = operation_span("read_stale_on_error", resource_key);
        let inner = &self.inner;
        let policy = inner.config.retry_policy;

        async move {
            inner.metrics.record_read();
            let fallback = match inner.cache.peek::<T>(cache_key) {
                CacheLookup::Fresh(value) => {
                    inner.metrics.record_cache_hit();
                    record_outcome(&Span::current(), Outcome::CacheHit);
                    return Ok(ReadOutcome {
                        value,
                        stale: false,
                    });
                }
                CacheLookup::Stale { value, .. } => Some(value),
                CacheLookup::Miss => None,
            };
            inner.metrics.record_cache_miss();

            match inner.call(resource_key, &policy, operation).await {
                Ok(value) => {
                    let ttl = ttl.unwrap_or_else(|| inner.cache.default_ttl());
                    inner.cache.set(cache_key, value.clone(), ttl);
                    record_outcome(&Span::current(), Outcome::Success);
                    Ok(ReadOutcome {
                        value,
                        stale: false,
                    })
                }
                Err(error) => match fallback {
                    Some(value) => {
                        warn!(cache_key, code = error.code(), "Serving stale value after failed refresh");
                        inner.metrics.record_stale_served();
                        record_outcome(&Span::current(), Outcome::Stale);
                        Ok(ReadOutcome { value, stale: true })
                    }
                    None => {
                        record_error_code(&Span::current(), error.code());
                        Err(error)
                    }
                },
            }
        }
        .instrument(span)
        .await
    }

    /// Write with the default retry policy, or queue it when offline
    pub async fn execute_write<T, F, Fut>(
        &self,
        resource_key: &str,
        kind: OperationKind,
        operation: F,
    ) -> DataResult<WriteOutcome<T>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RawError>> + Send + 'static,
    {
        let policy = self.inner.config.retry_policy;
        self.execute_write_with_policy(resource_key, kind, &policy, operation)
            .await
    }

    /// Write with an explicit retry policy, or queue it when offline.
    ///
    /// A write is also queued while earlier writes to the same resource are
    /// still waiting, and the flush watcher is asked to replay them. A queued
    /// write returns [`WriteOutcome::Queued`]; it is neither a success nor a
    /// failure until replayed.
    pub async fn execute_write_with_policy<T, F, Fut>(
        &self,
        resource_key: &str,
        kind: OperationKind,
        policy: &RetryPolicy,
        operation: F,
    ) -> DataResult<WriteOutcome<T>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, RawError>> + Send + 'static,
    {
        let span = operation_span("write", resource_key);
        let inner = &self.inner;

        async move {
            inner.metrics.record_write();

            let backlog = inner.offline.pending(resource_key);
            if backlog > 0 || !inner.connectivity.is_online() {
                let receipt = inner.offline.enqueue(resource_key, kind, move || {
                    let pending = operation();
                    async move { pending.await.map(|_| ()) }
                });
                inner.invalidate_resource(resource_key);
                inner.metrics.record_queued_write();
                record_outcome(&Span::current(), Outcome::Queued);

                // Connectivity may have returned while the write was queued.
                if inner.connectivity.is_online() {
                    debug!(backlog, "Write queued behind pending writes, requesting flush");
                    inner.flush_requested.notify_one();
                }
                return Ok(WriteOutcome::Queued(receipt));
            }

            match inner.call(resource_key, policy, operation).await {
                Ok(value) => {
                    let invalidated = inner.invalidate_resource(resource_key);
                    debug!(invalidated, "Write applied, cache invalidated");
                    record_outcome(&Span::current(), Outcome::Success);
                    Ok(WriteOutcome::Completed(value))
                }
                Err(error) => {
                    record_error_code(&Span::current(), error.code());
                    Err(error)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Remove every cache key starting with `prefix`
    pub fn invalidate(&self, prefix: &str) -> usize {
        self.inner.cache.invalidate(prefix)
    }

    /// Latest health snapshot, if a check has run
    pub fn health(&self) -> Option<HealthSnapshot> {
        self.inner.health.latest()
    }

    /// Run a health check now
    pub async fn check_health(&self) -> HealthSnapshot {
        self.inner.health.check_once().await
    }

    /// Call `callback` after every health check
    pub fn subscribe_health<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&HealthSnapshot) + Send + Sync + 'static,
    {
        self.inner.health.subscribe(callback)
    }

    /// Remove a health subscriber
    pub fn unsubscribe_health(&self, id: SubscriptionId) -> bool {
        self.inner.health.unsubscribe(id)
    }

    /// Receiver updated after every health check
    pub fn watch_health(&self) -> watch::Receiver<Option<HealthSnapshot>> {
        self.inner.health.watch()
    }

    /// Connectivity latency statistics
    pub fn latency_statistics(&self) -> LatencyStatistics {
        self.inner.health.latency_statistics()
    }

    /// Replay queued writes now
    pub async fn flush_offline_queue(&self) -> FlushReport {
        self.inner.flush_offline().await
    }

    /// Writes waiting for replay
    pub fn pending_writes(&self) -> usize {
        self.inner.offline.len()
    }

    /// Start periodic health checks and, when enabled, the flush watcher.
    ///
    /// The watcher flushes on reconnect and when a write is queued while
    /// online. While writes stay queued and the client is online it flushes
    /// again after `flush_retry_interval`, doubling the delay each time.
    ///
    /// Must be called inside a tokio runtime. Calling it twice is harmless.
    pub fn start(&self) {
        self.inner
            .health
            .start_periodic(self.inner.config.health.interval);

        if self.inner.config.auto_flush {
            let mut watcher = self.flush_watcher.lock();
            if watcher.is_none() {
                *watcher = Some(spawn_flush_watcher(self.inner.clone()));
            }
        }
        info!("Data client started");
    }

    /// Stop background tasks and wait for them to finish
    pub async fn shutdown(&self) {
        self.inner.health.stop().await;

        let watcher = self.flush_watcher.lock().take();
        if let Some(task) = watcher {
            let _ = task.shutdown_tx.send(()).await;
            let _ = task.handle.await;
        }
        info!("Data client shut down");
    }

    /// Counter snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Circuit state for a resource key
    pub fn circuit_state(&self, resource_key: &str) -> CircuitState {
        self.inner.breakers.state(resource_key)
    }

    /// Client configuration
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Connectivity signal driving offline behaviour
    pub fn connectivity(&self) -> &ConnectivitySignal {
        &self.inner.connectivity
    }

    /// Underlying cache
    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    /// Rate limiter, for per-resource overrides
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.rate_limiter
    }

    /// Circuit breakers, for per-resource overrides
    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.breakers
    }

    /// Offline queue
    pub fn offline_queue(&self) -> &OfflineQueue {
        &self.inner.offline
    }
}

impl Drop for ResilientClient {
    fn drop(&mut self) {
        if let Some(task) = self.flush_watcher.get_mut().take() {
            task.handle.abort();
        }
    }
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("config", &self.inner.config)
            .field("online", &self.inner.connectivity.is_online())
            .field("pending_writes", &self.inner.offline.len())
            .finish_non_exhaustive()
    }
}

/// Longest wait between flush retries while online
const MAX_FLUSH_RETRY_INTERVAL: Duration = Duration::from_secs(300);

fn spawn_flush_watcher(inner: Arc<ClientInner>) -> BackgroundTask {
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let mut connectivity = inner.connectivity.subscribe();
    let mut online = *connectivity.borrow_and_update();

    let handle = tokio::spawn(async move {
        let mut retries: u32 = 0;
        let mut retry_at: Option<Instant> = None;

        loop {
            let flush = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now_online = *connectivity.borrow_and_update();
                    let reconnected = now_online && !online;
                    online = now_online;
                    if reconnected {
                        retries = 0;
                    }
                    if !online {
                        retry_at = None;
                    }
                    reconnected
                }
                _ = inner.flush_requested.notified() => online,
                _ = wait_until(retry_at) => {
                    retry_at = None;
                    online
                }
            };
            if !flush || inner.offline.is_empty() {
                continue;
            }

            info!(pending = inner.offline.len(), "Flushing offline queue");
            let report = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                report = inner.flush_offline() => report,
            };

            // Rejected writes wait for a discard, not for a retry.
            let retryable = report.failed > report.blocked;
            if report.remaining > 0 && retryable && inner.connectivity.is_online() {
                let delay = inner
                    .config
                    .flush_retry_interval
                    .saturating_mul(1 << retries.min(16))
                    .min(MAX_FLUSH_RETRY_INTERVAL);
                retries = retries.saturating_add(1);
                retry_at = Some(Instant::now() + delay);
                warn!(
                    remaining = report.remaining,
                    retry_in_ms = delay.as_millis() as u64,
                    "Writes still queued, flushing again later"
                );
            } else {
                retries = 0;
                retry_at = None;
            }
        }
        debug!("Flush watcher stopped");
    });

    BackgroundTask {
        shutdown_tx,
        handle,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
