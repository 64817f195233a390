//! Moka Cache - Memory Tier Backend
//!
//! High-performance in-process cache using Moka for the fastest tier. Entries
//! live for the process lifetime at most.

use anyhow::Result;
use moka::future::Cache;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::BackendStats;
use crate::config::MemoryTierConfig;

/// Cache entry with TTL information
#[derive(Debug, Clone)]
struct CacheEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Moka in-memory cache with per-key TTL support
///
/// This is the default memory tier, providing:
/// - Fast in-memory access (< 1ms latency)
/// - Automatic eviction past `max_capacity`
/// - Per-key TTL support
/// - Statistics tracking
pub struct MokaCache {
    /// Moka cache instance
    cache: Cache<String, CacheEntry>,
    /// Hit counter
    hits: Arc<AtomicU64>,
    /// Miss counter
    misses: Arc<AtomicU64>,
    /// Set counter
    sets: Arc<AtomicU64>,
}

impl MokaCache {
    /// Create new Moka cache
    #[must_use]
    pub fn new(config: &MemoryTierConfig) -> Self {
        info!("Initializing Moka Cache");

        let cache = Cache::builder()
            .max_capacity(config.max_capacity)
            .time_to_live(config.time_to_live)
            .time_to_idle(config.time_to_idle)
            .build();

        info!(
            capacity = config.max_capacity,
            "Moka Cache initialized with per-key TTL support"
        );

        Self {
            cache,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            sets: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Snapshot of hit/miss/set counters
    #[must_use]
    pub fn stats(&self) -> BackendStats {
        BackendStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            size: self.cache.entry_count(),
        }
    }
}

impl Default for MokaCache {
    fn default() -> Self {
        Self::new(&MemoryTierConfig::default())
    }
}

// ===== Trait Implementations =====

use crate::traits::CacheBackend;
use async_trait::async_trait;

#[async_trait]
impl CacheBackend for MokaCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(entry) = self.cache.get(key).await {
            if entry.is_expired() {
                // Remove expired entry
                self.cache.remove(key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value)
            }
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let entry = CacheEntry::new(value.to_vec(), ttl);
        self.cache.insert(key.to_string(), entry).await;
        self.sets.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, ttl_ms = %ttl.as_millis(), "[Moka] Cached key with TTL");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.cache.remove(key).await;
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        let keys: Vec<Arc<String>> = self
            .cache
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key)
            .collect();

        for key in &keys {
            self.cache.remove(key.as_str()).await;
        }
        debug!(prefix = %prefix, count = keys.len(), "[Moka] Removed keys by prefix");
        Ok(keys.len())
    }

    async fn health_check(&self) -> bool {
        let test_key = "health_check_moka";
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
        "Moka"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let cache = MokaCache::default();
        cache
            .set_with_ttl("page:owner:p1", b"v", Duration::from_millis(30))
            .await
            .expect("Failed to set");
        assert_eq!(cache.get("page:owner:p1").await, Some(b"v".to_vec()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("page:owner:p1").await, None);
    }

    #[tokio::test]
    async fn remove_prefix_leaves_other_namespaces() {
        let cache = MokaCache::default();
        for key in ["page:list:a", "page:list:b", "page:public:p1"] {
            cache
                .set_with_ttl(key, b"x", Duration::from_secs(60))
                .await
                .expect("Failed to set");
        }
        cache.cache.run_pending_tasks().await;

        let removed = cache.remove_prefix("page:list:").await.expect("Failed to remove prefix");
        assert_eq!(removed, 2);
        assert!(cache.get("page:public:p1").await.is_some());
        assert!(cache.get("page:list:a").await.is_none());
    }
}
