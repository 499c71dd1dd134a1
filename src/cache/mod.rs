//! In-memory TTL cache for remote reads.
//!
//! Values are stored type-erased and handed back as clones of the original
//! type. Keys are namespaced by convention (`"tools:all"`, `"tools:42"`) so
//! that a write can drop every related read with one prefix invalidation.

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

type Payload = Arc<dyn Any + Send + Sync>;

/// Configuration for the cache store
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL used when a caller does not supply one
    pub default_ttl: Duration,
    /// Upper bound on stored entries; the oldest entry is evicted first
    pub max_entries: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            max_entries: Some(1_000),
        }
    }
}

impl CacheConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default TTL
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the entry limit (`None` for unbounded)
    pub fn max_entries(mut self, max: Option<usize>) -> Self {
        self.max_entries = max;
        self
    }
}

struct CacheEntry {
    value: Payload,
    stored_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        match self.stored_at.checked_add(self.ttl) {
            Some(expires_at) => now > expires_at,
            None => false,
        }
    }
}

/// Result of a non-evicting lookup
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    /// Entry exists and is within its TTL
    Fresh(T),
    /// Entry exists but its TTL has passed
    Stale {
        /// Cached value
        value: T,
        /// Time since the value was stored
        age: Duration,
    },
    /// No entry, or an entry of a different type
    Miss,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Fresh reads served
    pub hits: u64,
    /// Reads that found nothing usable
    pub misses: u64,
    /// Entries removed because their TTL passed
    pub expirations: u64,
    /// Entries removed by invalidation
    pub invalidations: u64,
    /// Entries removed to respect the size bound
    pub evictions: u64,
    /// Entries currently stored
    pub entries: usize,
}

impl CacheStats {
    /// Fraction of reads served from the cache
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Thread-safe TTL key/value store with prefix invalidation
pub struct CacheStore {
    config: CacheConfig,
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStore {
    /// Create a cache with default configuration
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Create a cache with custom configuration
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Default TTL from configuration
    pub fn default_ttl(&self) -> Duration {
        self.config.default_ttl
    }

    /// Get a fresh value.
    ///
    /// An expired entry is a miss and is evicted on the spot.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let now = Instant::now();
        let expired = {
            let entries = self.entries.read();
            match entries.get(key) {
                None => false,
                Some(entry) if entry.is_expired(now) => true,
                Some(entry) => {
                    if let Some(value) = entry.value.downcast_ref::<T>() {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        trace!(key, "cache hit");
                        return Some(value.clone());
                    }
                    false
                }
            }
        };

        if expired {
            let mut entries = self.entries.write();
            // Re-check under the write lock; a concurrent set may have refreshed it.
            if entries.get(key).is_some_and(|e| e.is_expired(now)) {
                entries.remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                debug!(key, "evicted expired cache entry");
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Look up a value without evicting it, reporting whether it is stale
    pub fn peek<T>(&self, key: &str) -> CacheLookup<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let now = Instant::now();
        let entries = self.entries.read();
        let Some(entry) = entries.get(key) else {
            return CacheLookup::Miss;
        };
        let Some(value) = entry.value.downcast_ref::<T>() else {
            return CacheLookup::Miss;
        };
        if entry.is_expired(now) {
            CacheLookup::Stale {
                value: value.clone(),
                age: now.saturating_duration_since(entry.stored_at),
            }
        } else {
            CacheLookup::Fresh(value.clone())
        }
    }

    /// Store a value under a key for `ttl`
    pub fn set<T>(&self, key: impl Into<String>, value: T, ttl: Duration)
    where
        T: Send + Sync + 'static,
    {
        let key = key.into();
        let now = Instant::now();
        let mut entries = self.entries.write();

        if let Some(max) = self.config.max_entries {
            if !entries.contains_key(&key) && entries.len() >= max {
                self.make_room(&mut entries, now, max);
            }
        }

        trace!(key = %key, ttl_ms = ttl.as_millis() as u64, "cache set");
        entries.insert(
            key,
            CacheEntry {
                value: Arc::new(value),
                stored_at: now,
                ttl,
            },
        );
    }

    fn make_room(&self, entries: &mut HashMap<String, CacheEntry>, now: Instant, max: usize) {
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let expired = (before - entries.len()) as u64;
        if expired > 0 {
            self.expirations.fetch_add(expired, Ordering::Relaxed);
        }

        while entries.len() >= max.max(1) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    entries.remove(&k);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    /// Remove the entry for an exact key and every entry whose key starts
    /// with `prefix`. Returns the number of removed entries.
    ///
    /// An empty prefix removes everything.
    pub fn invalidate(&self, prefix: &str) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        let removed = before - entries.len();
        drop(entries);

        if removed > 0 {
            self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(prefix, removed, "cache invalidated");
        }
        removed
    }

    /// Drop all expired entries
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        let removed = before - entries.len();
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Remove everything
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
