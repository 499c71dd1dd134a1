//! Counters for the data-access layer.

use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics collector for remote data access
#[derive(Debug, Default)]
pub struct ClientMetrics {
    reads: AtomicU64,
    writes: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    stale_served: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    rate_limited: AtomicU64,
    circuit_rejections: AtomicU64,
    queued_writes: AtomicU64,
    replayed_writes: AtomicU64,
}

impl ClientMetrics {
    /// Create a new collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a read request
    pub fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a write request
    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a fresh cache hit
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cache miss
    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stale value served after a failed refresh
    pub fn record_stale_served(&self) {
        self.stale_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retry
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed request
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rate-limited request
    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request rejected by an open circuit
    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a write deferred to the offline queue
    pub fn record_queued_write(&self) {
        self.queued_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a queued write replayed successfully
    pub fn record_replayed_write(&self) {
        self.replayed_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            stale_served: self.stale_served.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            queued_writes: self.queued_writes.load(Ordering::Relaxed),
            replayed_writes: self.replayed_writes.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.reads,
            &self.writes,
            &self.cache_hits,
            &self.cache_misses,
            &self.stale_served,
            &self.retries,
            &self.failures,
            &self.rate_limited,
            &self.circuit_rejections,
            &self.queued_writes,
            &self.replayed_writes,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of [`ClientMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Read requests
    pub reads: u64,
    /// Write requests
    pub writes: u64,
    /// Fresh cache hits
    pub cache_hits: u64,
    /// Cache misses
    pub cache_misses: u64,
    /// Stale values served after a failed refresh
    pub stale_served: u64,
    /// Retries performed
    pub retries: u64,
    /// Requests that ended in an error
    pub failures: u64,
    /// Requests rejected by the rate limiter
    pub rate_limited: u64,
    /// Requests rejected by an open circuit
    pub circuit_rejections: u64,
    /// Writes deferred while offline
    pub queued_writes: u64,
    /// Deferred writes replayed successfully
    pub replayed_writes: u64,
}

impl MetricsSnapshot {
    /// Fraction of reads served from cache
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}
