//! Cache Manager - Tiered Read-Through Cache
//!
//! Manages operations across the memory tier (Moka) and the persistent tier
//! (Redis or any [`PersistentCacheBackend`]):
//!
//! ```text
//! get(key) → memory tier ──hit──→ return
//!               │ miss
//!               ↓
//!           persistent tier ──hit──→ promote to memory (capped TTL) → return
//!               │ miss
//!               ↓
//!             None (caller sources the value and calls `set`)
//! ```
//!
//! Tier failures never surface from reads: a failing tier is a miss.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::codecs::JsonCodec;
use crate::config::{LayerConfig, TtlConfig};
use crate::error::{LayerError, Result};
use crate::single_flight::KeyedLocks;
use crate::traits::{CacheBackend, CacheCodec, PersistentCacheBackend};

/// Cache strategies for different data categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStrategy {
    /// Rapidly changing values (live view counts, subscription snapshots)
    RealTime,
    /// List-query results; pagination cursors go stale quickly
    ListQuery,
    /// Denormalized counter values
    Counter,
    /// Singleton metadata documents
    Metadata,
    /// Content blobs, edited comparatively rarely
    Content,
    /// Custom TTL
    Custom(Duration),
}

impl CacheStrategy {
    /// Resolve strategy to a TTL under `ttl`
    #[must_use]
    pub fn to_duration(&self, ttl: &TtlConfig) -> Duration {
        match self {
            Self::RealTime => ttl.real_time,
            Self::ListQuery => ttl.list_query,
            Self::Counter => ttl.counter,
            Self::Metadata => ttl.metadata,
            Self::Content => ttl.content,
            Self::Custom(duration) => *duration,
        }
    }
}

/// Which class of caller a cached payload was shaped for
///
/// Owners see fields the public does not, so the two views are cached under
/// distinct keys and never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewScope {
    Owner,
    Public,
}

impl ViewScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Public => "public",
        }
    }
}

impl fmt::Display for ViewScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache key layout shared by every component
///
/// - entity views: `{kind}:{owner|public}:{id}`
/// - list queries: `{kind}:list:{filter signature}`
/// - counters: `counter:{entity id}:{counter kind}`
/// - last known counter values: `counter-last:{entity id}:{counter kind}`
pub struct CacheKey;

impl CacheKey {
    #[must_use]
    pub fn entity(kind: &str, id: &str, scope: ViewScope) -> String {
        format!("{kind}:{scope}:{id}")
    }

    #[must_use]
    pub fn list(kind: &str, signature: &str) -> String {
        format!("{kind}:list:{signature}")
    }

    /// Prefix covering every cached list query of `kind`
    #[must_use]
    pub fn list_prefix(kind: &str) -> String {
        format!("{kind}:list:")
    }

    #[must_use]
    pub fn counter(entity_id: &str, counter_kind: &str) -> String {
        format!("counter:{entity_id}:{counter_kind}")
    }

    /// Memory-only copy of a counter's last observed value, kept apart from
    /// [`CacheKey::counter`] so invalidation leaves it in place
    #[must_use]
    pub fn last_known_counter(entity_id: &str, counter_kind: &str) -> String {
        format!("counter-last:{entity_id}:{counter_kind}")
    }
}

/// Cache Manager - Unified operations across the memory and persistent tiers
pub struct CacheManager<C = JsonCodec> {
    /// Memory tier
    memory: Arc<dyn CacheBackend>,
    /// Persistent tier (absent when running memory-only)
    persistent: Option<Arc<dyn PersistentCacheBackend>>,
    /// Value codec shared by both tiers
    codec: C,
    /// TTL per strategy
    ttl: TtlConfig,
    /// Upper bound for the TTL of promoted entries
    promotion_ttl_cap: Duration,
    /// Statistics
    total_requests: AtomicU64,
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    tier_errors: AtomicU64,
    invalidations: AtomicU64,
    /// In-flight computations, to prevent cache stampedes
    in_flight: KeyedLocks,
}

impl CacheManager<JsonCodec> {
    /// Create new cache manager with the JSON codec
    #[must_use]
    pub fn new(
        memory: Arc<dyn CacheBackend>,
        persistent: Option<Arc<dyn PersistentCacheBackend>>,
        config: &LayerConfig,
    ) -> Self {
        Self::with_codec(memory, persistent, JsonCodec, config)
    }
}

impl<C: CacheCodec> CacheManager<C> {
    /// Create new cache manager with a custom codec
    #[must_use]
    pub fn with_codec(
        memory: Arc<dyn CacheBackend>,
        persistent: Option<Arc<dyn PersistentCacheBackend>>,
        codec: C,
        config: &LayerConfig,
    ) -> Self {
        tracing::info!(
            memory = memory.name(),
            persistent = persistent.as_ref().map_or("none", |p| p.name()),
            codec = codec.name(),
            "Initializing Cache Manager"
        );

        Self {
            memory,
            persistent,
            codec,
            ttl: config.ttl,
            promotion_ttl_cap: config.promotion_ttl_cap,
            total_requests: AtomicU64::new(0),
            memory_hits: AtomicU64::new(0),
            persistent_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            tier_errors: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            in_flight: KeyedLocks::new(),
        }
    }

    /// TTL used for `strategy`
    #[must_use]
    pub fn ttl_for(&self, strategy: CacheStrategy) -> Duration {
        strategy.to_duration(&self.ttl)
    }

    /// Get value from cache (memory first, then persistent with promotion)
    ///
    /// # Returns
    /// * `Some(value)` - Cache hit in either tier, within TTL
    /// * `None` - Miss in both tiers, or both tiers failing
    pub async fn get(&self, key: &str) -> Option<Value> {
        self.get_typed(key).await
    }

    /// Typed variant of [`CacheManager::get`]
    ///
    /// An entry that does not decode as `T` is dropped from the tier it was
    /// found in and treated as a miss.
    pub async fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        // Fast path: memory tier, no further I/O on hit
        if let Some(bytes) = self.memory.get(key).await {
            match self.codec.deserialize::<T>(&bytes) {
                Ok(value) => {
                    self.memory_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Undecodable memory tier entry, dropping");
                    self.remove_from_memory(key).await;
                }
            }
        }

        if let Some(persistent) = &self.persistent {
            if let Some((bytes, remaining)) = persistent.get_with_ttl(key).await {
                match self.codec.deserialize::<T>(&bytes) {
                    Ok(value) => {
                        self.persistent_hits.fetch_add(1, Ordering::Relaxed);
                        self.promote(key, &bytes, remaining).await;
                        return Some(value);
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Undecodable persistent tier entry, dropping");
                        if let Err(e) = persistent.remove(key).await {
                            self.record_tier_error("persistent", "remove", key, &e);
                        }
                    }
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "Cache miss in all tiers");
        None
    }

    /// Promote a persistent entry into memory
    ///
    /// The promoted TTL never exceeds the persistent entry's remaining
    /// lifetime nor `promotion_ttl_cap`, since the persistent copy may be old.
    async fn promote(&self, key: &str, bytes: &[u8], remaining: Option<Duration>) {
        let ttl = remaining.map_or(self.promotion_ttl_cap, |r| r.min(self.promotion_ttl_cap));
        if ttl.is_zero() {
            return;
        }
        match self.memory.set_with_ttl(key, bytes, ttl).await {
            Ok(()) => {
                self.promotions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, ttl_ms = %ttl.as_millis(), "Promoted from persistent tier to memory");
            }
            Err(e) => self.record_tier_error("memory", "promote", key, &e),
        }
    }

    /// Store `value` in both tiers
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::Codec`] if the value cannot be encoded and
    /// [`LayerError::Cache`] only when every tier failed.
    pub async fn set(&self, key: &str, value: &Value, strategy: CacheStrategy) -> Result<()> {
        self.set_typed(key, value, strategy).await
    }

    /// Typed variant of [`CacheManager::set`]
    ///
    /// # Errors
    ///
    /// See [`CacheManager::set`].
    pub async fn set_typed<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        strategy: CacheStrategy,
    ) -> Result<()> {
        let bytes = self.encode(value)?;
        let ttl = self.ttl_for(strategy);

        let memory_result = self.memory.set_with_ttl(key, &bytes, ttl).await;
        let persistent_result = match &self.persistent {
            Some(persistent) => Some(persistent.set_with_ttl(key, &bytes, ttl).await),
            None => None,
        };

        match (memory_result, persistent_result) {
            (Ok(()), Some(Ok(())) | None) => {
                debug!(key = %key, ttl_ms = %ttl.as_millis(), "Cached in all tiers");
                Ok(())
            }
            (Ok(()), Some(Err(e))) => {
                self.record_tier_error("persistent", "set", key, &e);
                Ok(())
            }
            (Err(e), Some(Ok(()))) => {
                self.record_tier_error("memory", "set", key, &e);
                Ok(())
            }
            (Err(e), _) => {
                self.record_tier_error("memory", "set", key, &e);
                Err(LayerError::Cache(format!("every tier failed to cache '{key}': {e}")))
            }
        }
    }

    /// Store `value` in the memory tier only
    ///
    /// For ephemeral, rapidly changing values that are not worth a persistent write.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the memory tier rejects the write.
    pub async fn set_memory_only<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        strategy: CacheStrategy,
    ) -> Result<()> {
        let bytes = self.encode(value)?;
        let ttl = self.ttl_for(strategy);
        self.memory.set_with_ttl(key, &bytes, ttl).await.map_err(|e| {
            self.record_tier_error("memory", "set", key, &e);
            LayerError::Cache(format!("memory tier failed to cache '{key}': {e}"))
        })
    }

    /// Remove `key` from both tiers
    pub async fn invalidate(&self, key: &str) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        self.remove_from_memory(key).await;
        if let Some(persistent) = &self.persistent {
            if let Err(e) = persistent.remove(key).await {
                self.record_tier_error("persistent", "remove", key, &e);
            }
        }
        debug!(key = %key, "Invalidated");
    }

    /// Remove every key starting with `prefix` from both tiers
    ///
    /// # Returns
    ///
    /// Number of entries removed across tiers.
    pub async fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        let mut removed = match self.memory.remove_prefix(prefix).await {
            Ok(n) => n,
            Err(e) => {
                self.record_tier_error("memory", "remove_prefix", prefix, &e);
                0
            }
        };
        if let Some(persistent) = &self.persistent {
            match persistent.remove_prefix(prefix).await {
                Ok(n) => removed += n,
                Err(e) => self.record_tier_error("persistent", "remove_prefix", prefix, &e),
            }
        }
        debug!(prefix = %prefix, removed, "Invalidated prefix");
        removed
    }

    /// Get or compute value with stampede protection
    ///
    /// Concurrent callers missing the same key are serialized: only the first
    /// runs `compute_fn`, the others read its cached result.
    ///
    /// # Errors
    ///
    /// Propagates the error of `compute_fn`. Failing to cache the computed
    /// value is logged, not returned.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        strategy: CacheStrategy,
        compute_fn: F,
    ) -> Result<Value>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Value>> + Send,
    {
        self.get_or_compute_typed(key, strategy, compute_fn).await
    }

    /// Typed variant of [`CacheManager::get_or_compute`]
    ///
    /// # Errors
    ///
    /// See [`CacheManager::get_or_compute`].
    pub async fn get_or_compute_typed<T, F, Fut>(
        &self,
        key: &str,
        strategy: CacheStrategy,
        compute_fn: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        if let Some(value) = self.get_typed::<T>(key).await {
            return Ok(value);
        }

        let _guard = self.in_flight.lock(key).await;

        // Double-check after acquiring the lock: another caller may have filled it
        if let Some(value) = self.get_typed::<T>(key).await {
            return Ok(value);
        }

        debug!(key = %key, "Computing fresh value (stampede protected)");
        let value = compute_fn().await?;
        if let Err(e) = self.set_typed(key, &value, strategy).await {
            warn!(key = %key, error = %e, "Failed to cache computed value");
        }
        Ok(value)
    }

    /// Health of each tier
    pub async fn health_check(&self) -> TierHealth {
        let memory = self.memory.health_check().await;
        let persistent = match &self.persistent {
            Some(persistent) => Some(persistent.health_check().await),
            None => None,
        };
        TierHealth { memory, persistent }
    }

    /// Get comprehensive cache statistics
    #[allow(clippy::cast_precision_loss)]
    pub fn get_stats(&self) -> CacheManagerStats {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let memory_hits = self.memory_hits.load(Ordering::Relaxed);
        let persistent_hits = self.persistent_hits.load(Ordering::Relaxed);

        let rate = |hits: u64| {
            if total_requests > 0 {
                (hits as f64 / total_requests as f64) * 100.0
            } else {
                0.0
            }
        };

        CacheManagerStats {
            total_requests,
            memory_hits,
            persistent_hits,
            misses: self.misses.load(Ordering::Relaxed),
            hit_rate: rate(memory_hits + persistent_hits),
            memory_hit_rate: rate(memory_hits),
            promotions: self.promotions.load(Ordering::Relaxed),
            tier_errors: self.tier_errors.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            in_flight_requests: self.in_flight.len(),
        }
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        self.codec
            .serialize(value)
            .map_err(|e| LayerError::Codec(e.to_string()))
    }

    async fn remove_from_memory(&self, key: &str) {
        if let Err(e) = self.memory.remove(key).await {
            self.record_tier_error("memory", "remove", key, &e);
        }
    }

    fn record_tier_error(&self, tier: &str, op: &str, key: &str, error: &anyhow::Error) {
        self.tier_errors.fetch_add(1, Ordering::Relaxed);
        warn!(tier = %tier, op = %op, key = %key, error = %error, "Cache tier error, degrading to miss");
    }
}

/// Health of the cache tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierHealth {
    pub memory: bool,
    /// `None` when no persistent tier is configured
    pub persistent: Option<bool>,
}

impl TierHealth {
    /// Memory is required; a failing persistent tier only degrades hit rate
    #[must_use]
    pub fn is_operational(&self) -> bool {
        self.memory
    }
}

/// Cache Manager statistics
#[derive(Debug, Clone)]
pub struct CacheManagerStats {
    pub total_requests: u64,
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub memory_hit_rate: f64,
    pub promotions: u64,
    pub tier_errors: u64,
    pub invalidations: u64,
    pub in_flight_requests: usize,
}
