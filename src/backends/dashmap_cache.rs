//! `DashMap` Cache - Simple Concurrent `HashMap` Backend
//!
//! A lightweight in-process cache using `DashMap` for concurrent access.
//!
//! It implements both tier traits, so it serves as:
//! - the memory tier when the `moka` feature is disabled,
//! - an in-process persistent tier for tests and single-process embedders
//!   (entries outlive individual requests but not the process).

use anyhow::Result;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::BackendStats;

/// Cache entry with expiration tracking
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Some(Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() >= expires_at)
    }

    fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|expires_at| expires_at.saturating_duration_since(Instant::now()))
    }
}

/// Simple concurrent cache using `DashMap`
///
/// **Features**:
/// - Lock-free concurrent reads/writes
/// - Manual TTL tracking, expired entries dropped lazily on read
/// - Remaining-TTL introspection for promotion
/// - Fault injection (`set_failing`) so callers can exercise tier degradation
///
/// **Limitations**:
/// - No eviction policy and no size limit
/// - Call [`DashMapCache::cleanup_expired`] periodically in long-lived processes
///
/// **Example**:
/// ```rust
/// use scribe_cache::backends::DashMapCache;
/// use scribe_cache::traits::CacheBackend;
/// use std::time::Duration;
///
/// # async fn example() -> anyhow::Result<()> {
/// let cache = DashMapCache::new();
///
/// cache.set_with_ttl("page:public:p1", b"{}", Duration::from_secs(60)).await?;
/// assert_eq!(cache.get("page:public:p1").await, Some(b"{}".to_vec()));
/// # Ok(())
/// # }
/// ```
pub struct DashMapCache {
    /// Concurrent `HashMap`
    map: Arc<DashMap<String, CacheEntry>>,
    /// When set, every operation fails or misses
    failing: AtomicBool,
    /// Hit counter
    hits: Arc<AtomicU64>,
    /// Miss counter
    misses: Arc<AtomicU64>,
    /// Set counter
    sets: Arc<AtomicU64>,
}

impl DashMapCache {
    /// Create new `DashMap` cache
    #[must_use]
    pub fn new() -> Self {
        info!("Initializing DashMap Cache (concurrent HashMap)");

        Self {
            map: Arc::new(DashMap::new()),
            failing: AtomicBool::new(false),
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            sets: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Simulate the backing storage being unavailable
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn is_failing(&self) -> bool {
        self.failing.load(Ordering::SeqCst)
    }

    /// Cleanup expired entries (should be called periodically)
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = 0;
        self.map.retain(|_, entry| {
            if entry.is_expired() {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(count = removed, "[DashMap] Cleaned up expired entries");
        }
        removed
    }

    /// Get current cache size
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Snapshot of hit/miss/set counters
    #[must_use]
    pub fn stats(&self) -> BackendStats {
        BackendStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            size: self.map.len() as u64,
        }
    }

    fn live_entry(&self, key: &str) -> Option<CacheEntry> {
        if self.is_failing() {
            return None;
        }
        if let Some(entry) = self.map.get(key) {
            if entry.is_expired() {
                drop(entry); // Release read lock
                self.map.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }
}

impl Default for DashMapCache {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Trait Implementations =====

use crate::traits::{CacheBackend, PersistentCacheBackend};
use async_trait::async_trait;

#[async_trait]
impl CacheBackend for DashMapCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.live_entry(key).map(|entry| entry.value)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        if self.is_failing() {
            anyhow::bail!("DashMap cache is failing");
        }
        let entry = CacheEntry::new(value.to_vec(), ttl);
        self.map.insert(key.to_string(), entry);
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_ms = %ttl.as_millis(), "[DashMap] Cached key with TTL");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if self.is_failing() {
            anyhow::bail!("DashMap cache is failing");
        }
        self.map.remove(key);
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        if self.is_failing() {
            anyhow::bail!("DashMap cache is failing");
        }
        let before = self.map.len();
        self.map.retain(|key, _| !key.starts_with(prefix));
        let removed = before.saturating_sub(self.map.len());
        debug!(prefix = %prefix, count = removed, "[DashMap] Removed keys by prefix");
        Ok(removed)
    }

    async fn health_check(&self) -> bool {
        let test_key = "health_check_dashmap";
        let test_value = b"health_check_value";

        match self
            .set_with_ttl(test_key, test_value, Duration::from_secs(60))
            .await
        {
            Ok(()) => match self.get(test_key).await {
                Some(retrieved) => {
                    let _ = self.remove(test_key).await;
                    retrieved == test_value
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    fn name(&self) -> &'static str {
        "DashMap"
    }
}

#[async_trait]
impl PersistentCacheBackend for DashMapCache {
    async fn get_with_ttl(&self, key: &str) -> Option<(Vec<u8>, Option<Duration>)> {
        self.live_entry(key).map(|entry| {
            let remaining = entry.remaining();
            (entry.value, remaining)
        })
    }
}
