//! Bounded latency sample window.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Default number of samples kept
pub const DEFAULT_SAMPLE_WINDOW: usize = 100;

/// Summary of recent latencies, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStatistics {
    /// Samples in the window
    pub count: usize,
    /// Mean
    pub average_ms: f64,
    /// Median
    pub median_ms: f64,
    /// 95th percentile
    pub p95_ms: f64,
    /// 99th percentile
    pub p99_ms: f64,
}

/// Keeps the most recent `capacity` samples
#[derive(Debug)]
pub struct LatencyTracker {
    samples: Mutex<VecDeque<f64>>,
    capacity: usize,
}

impl LatencyTracker {
    /// Create a tracker holding at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Record one sample, dropping the oldest when full
    pub fn record(&self, latency: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(latency.as_secs_f64() * 1000.0);
    }

    /// Samples currently held
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    /// Whether no sample was recorded
    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    /// Drop all samples
    pub fn clear(&self) {
        self.samples.lock().clear();
    }

    /// Compute statistics over the window
    pub fn statistics(&self) -> LatencyStatistics {
        let mut sorted: Vec<f64> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return LatencyStatistics::default();
        }
        sorted.sort_by(f64::total_cmp);

        let count = sorted.len();
        let mid = count / 2;
        let median_ms = if count % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        LatencyStatistics {
            count,
            average_ms: sorted.iter().sum::<f64>() / count as f64,
            median_ms,
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
        }
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_WINDOW)
    }
}

/// Nearest-rank percentile of a sorted, non-empty slice
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
