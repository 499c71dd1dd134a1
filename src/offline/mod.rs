//! Offline write queue.
//!
//! Writes attempted while offline are stored as [`QueuedOperation`]s in one
//! FIFO list per resource key and replayed on reconnect. Delivery is
//! at-least-once: a failed replay stays at the head of its list with
//! `attempts` incremented, so commands must be safe to run more than once.

pub mod connectivity;

pub use connectivity::ConnectivitySignal;

use crate::errors::{DataResult, ErrorClassifier, RawError};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Future produced by a replay command
pub type ReplayFuture = BoxFuture<'static, Result<(), RawError>>;

/// Re-invocable write command
pub type ReplayCommand = Arc<dyn Fn() -> ReplayFuture + Send + Sync>;

/// Kind of write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Insert a row
    Create,
    /// Modify a row
    Update,
    /// Remove a row
    Delete,
}

impl OperationKind {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write waiting for connectivity
#[derive(Clone)]
pub struct QueuedOperation {
    /// Monotonic id, unique per queue
    pub id: u64,
    /// Resource the write targets
    pub resource_key: String,
    /// Kind of write
    pub kind: OperationKind,
    /// Command that performs the write
    pub command: ReplayCommand,
    /// When the write was queued
    pub enqueued_at: DateTime<Utc>,
    /// Failed replay attempts so far
    pub attempts: u32,
}

impl QueuedOperation {
    /// Metadata without the command
    pub fn info(&self) -> QueuedOperationInfo {
        QueuedOperationInfo {
            id: self.id,
            resource_key: self.resource_key.clone(),
            kind: self.kind,
            enqueued_at: self.enqueued_at,
            attempts: self.attempts,
        }
    }
}

impl fmt::Debug for QueuedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedOperation")
            .field("id", &self.id)
            .field("resource_key", &self.resource_key)
            .field("kind", &self.kind)
            .field("enqueued_at", &self.enqueued_at)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

/// Serializable view of a queued operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOperationInfo {
    /// Operation id
    pub id: u64,
    /// Resource key
    pub resource_key: String,
    /// Kind of write
    pub kind: OperationKind,
    /// When the write was queued
    pub enqueued_at: DateTime<Utc>,
    /// Failed replay attempts so far
    pub attempts: u32,
}

/// Returned to the caller in place of a result when a write is queued
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedReceipt {
    /// Operation id
    pub id: u64,
    /// Resource key
    pub resource_key: String,
    /// Kind of write
    pub kind: OperationKind,
    /// When the write was queued
    pub enqueued_at: DateTime<Utc>,
}

/// Result of one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Operations replayed successfully and removed
    pub replayed: usize,
    /// Replays that failed; each failed operation stays queued
    pub failed: usize,
    /// Operations still queued after the flush
    pub remaining: usize,
    /// Failed replays whose error is not retryable.
    ///
    /// Such an operation holds its resource's list until it is discarded
    /// with [`OfflineQueue::discard`].
    pub blocked: usize,
}

/// Per-resource FIFO queue of deferred writes
pub struct OfflineQueue {
    queues: Mutex<HashMap<String, VecDeque<QueuedOperation>>>,
    next_id: AtomicU64,
    flush_lock: tokio::sync::Mutex<()>,
    classifier: ErrorClassifier,
}

impl OfflineQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            flush_lock: tokio::sync::Mutex::new(()),
            classifier: ErrorClassifier::new(),
        }
    }

    /// Append a write to the end of its resource's list
    pub fn enqueue<F, Fut>(
        &self,
        resource_key: impl Into<String>,
        kind: OperationKind,
        command: F,
    ) -> QueuedReceipt
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), RawError>> + Send + 'static,
    {
        let command: ReplayCommand = Arc::new(move || command().boxed());
        self.enqueue_command(resource_key.into(), kind, command)
    }

    /// Append an already boxed command
    pub fn enqueue_command(
        &self,
        resource_key: String,
        kind: OperationKind,
        command: ReplayCommand,
    ) -> QueuedReceipt {
        let operation = QueuedOperation {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            resource_key,
            kind,
            command,
            enqueued_at: Utc::now(),
            attempts: 0,
        };
        let receipt = QueuedReceipt {
            id: operation.id,
            resource_key: operation.resource_key.clone(),
            kind,
            enqueued_at: operation.enqueued_at,
        };

        debug!(
            id = receipt.id,
            resource_key = %receipt.resource_key,
            kind = %kind,
            "Write queued while offline"
        );
        self.queues
            .lock()
            .entry(receipt.resource_key.clone())
            .or_default()
            .push_back(operation);
        receipt
    }

    /// Replay every queued command as-is
    pub async fn flush(&self) -> FlushReport {
        let classifier = self.classifier;
        self.flush_with(|operation| {
            let command = operation.command.clone();
            async move { command().await.map_err(|raw| classifier.classify(&raw)) }
        })
        .await
    }

    /// Replay queued operations through `replay`.
    ///
    /// Keys are processed in sorted order and each key's list strictly
    /// front to back. The first failure on a key stops that key for this
    /// flush. Only one flush runs at a time; a second caller waits.
    pub async fn flush_with<F, Fut>(&self, replay: F) -> FlushReport
    where
        F: Fn(&QueuedOperation) -> Fut,
        Fut: Future<Output = DataResult<()>>,
    {
        let _flushing = self.flush_lock.lock().await;
        let mut report = FlushReport::default();

        let mut keys: Vec<String> = self.queues.lock().keys().cloned().collect();
        keys.sort();

        for key in keys {
            // The head stays queued until its replay succeeds.
            while let Some(operation) = self.front(&key) {
                match replay(&operation).await {
                    Ok(()) => {
                        self.remove_front(&key, operation.id);
                        report.replayed += 1;
                        debug!(id = operation.id, resource_key = %key, "Queued write replayed");
                    }
                    Err(error) => {
                        let attempts = self.mark_failed(&key, operation.id);
                        report.failed += 1;
                        if error.is_retryable() {
                            warn!(
                                id = operation.id,
                                resource_key = %key,
                                attempts,
                                code = error.code(),
                                "Queued write replay failed, keeping it queued"
                            );
                        } else {
                            report.blocked += 1;
                            warn!(
                                id = operation.id,
                                resource_key = %key,
                                attempts,
                                code = error.code(),
                                category = %error.category(),
                                "Queued write rejected by the backend and blocks its resource until discarded"
                            );
                        }
                        break;
                    }
                }
            }
        }

        report.remaining = self.len();
        if report.replayed > 0 || report.failed > 0 {
            info!(
                replayed = report.replayed,
                failed = report.failed,
                remaining = report.remaining,
                "Offline queue flushed"
            );
        }
        report
    }

    fn front(&self, key: &str) -> Option<QueuedOperation> {
        self.queues.lock().get(key).and_then(|list| list.front().cloned())
    }

    fn remove_front(&self, key: &str, id: u64) {
        let mut queues = self.queues.lock();
        if let Some(list) = queues.get_mut(key) {
            if list.front().is_some_and(|op| op.id == id) {
                list.pop_front();
            }
            if list.is_empty() {
                queues.remove(key);
            }
        }
    }

    fn mark_failed(&self, key: &str, id: u64) -> u32 {
        let mut queues = self.queues.lock();
        match queues
            .get_mut(key)
            .and_then(|list| list.front_mut())
            .filter(|op| op.id == id)
        {
            Some(op) => {
                op.attempts += 1;
                op.attempts
            }
            None => 0,
        }
    }

    /// Total queued operations
    pub fn len(&self) -> usize {
        self.queues.lock().values().map(VecDeque::len).sum()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued operations for one resource key
    pub fn pending(&self, resource_key: &str) -> usize {
        self.queues.lock().get(resource_key).map_or(0, VecDeque::len)
    }

    /// Metadata of every queued operation, by key then queue order
    pub fn snapshot(&self) -> Vec<QueuedOperationInfo> {
        let queues = self.queues.lock();
        let mut keys: Vec<&String> = queues.keys().collect();
        keys.sort();
        keys.into_iter()
            .flat_map(|key| queues[key].iter().map(QueuedOperation::info))
            .collect()
    }

    /// Remove one queued operation by id
    pub fn discard(&self, id: u64) -> Option<QueuedOperationInfo> {
        let mut queues = self.queues.lock();
        let key = queues
            .iter()
            .find(|(_, list)| list.iter().any(|op| op.id == id))
            .map(|(key, _)| key.clone())?;

        let list = queues.get_mut(&key)?;
        let position = list.iter().position(|op| op.id == id)?;
        let removed = list.remove(position)?;
        if list.is_empty() {
            queues.remove(&key);
        }
        warn!(id, resource_key = %key, kind = %removed.kind, "Queued write discarded");
        Some(removed.info())
    }

    /// Drop every queued operation, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut queues = self.queues.lock();
        let dropped = queues.values().map(VecDeque::len).sum();
        queues.clear();
        if dropped > 0 {
            warn!(dropped, "Offline queue cleared");
        }
        dropped
    }
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
