//! Scribe Cache
//!
//! Tiered read-through cache and denormalized-counter consistency layer for
//! applications whose data lives in a remote document store:
//! - **Cache tiers**: in-memory (Moka) and persistent (Redis, or in-process),
//!   with promotion and per-category TTLs
//! - **Self-healing counters**: atomic increments, lazy scan-and-persist rebuilds
//! - **Write coalescing**: last-write-wins per path, one batched flush per window
//! - **Deduplicated subscriptions**: one store listener per key, throttled fan-out
//! - **Invalidation**: owner/public/list/counter namespaces removed on mutation
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use scribe_cache::{CounterKind, LayerBuilder};
//! use scribe_cache::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let layer = LayerBuilder::from_env()
//!         .with_store(Arc::new(MemoryStore::new()))
//!         .build()
//!         .await?;
//!
//!     // Rebuilt by scan on first read, cached afterwards
//!     let pages = layer.read_counter("u1", &CounterKind::PageCountPublic).await?;
//!     layer.increment_counter("u1", &CounterKind::FollowerCount, 1).await?;
//!
//!     // Coalesced with other writes of the next debounce window
//!     let ticket = layer.enqueue_write("pages/p1", serde_json::json!({"wordCount": 812}))?;
//!
//!     tracing::info!(pages, state = ?ticket.state(), "done");
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! read  → Memory (Moka) → Persistent (Redis) → Counter engine / store query
//!         ↓ hit            ↓ hit                 ↓ miss
//!         return           promote (capped TTL)  cache in both tiers
//!
//! write → Counter engine (atomic increment) ─┐
//!       → Write queue (debounced batch)     ─┴→ Invalidation broadcaster
//! ```

use std::sync::Arc;
use serde_json::Value;
use tracing::{info, warn};

pub mod backends;
pub mod batching;
pub mod builder;
pub mod cache_manager;
pub mod codecs;
pub mod config;
pub mod counters;
pub mod error;
pub mod invalidation;
mod single_flight;
pub mod store;
pub mod subscriptions;
pub mod traits;

pub use backends::DashMapCache;
#[cfg(feature = "moka")]
pub use backends::MokaCache;
#[cfg(feature = "redis")]
pub use backends::RedisCache;
pub use batching::{BatchStats, WriteQueue, WriteState, WriteTicket};
pub use builder::LayerBuilder;
pub use cache_manager::{
    CacheKey, CacheManager, CacheManagerStats, CacheStrategy, TierHealth, ViewScope,
};
pub use codecs::JsonCodec;
pub use config::{BatchConfig, LayerConfig, MemoryTierConfig, TtlConfig};
pub use counters::{
    CounterAdjustment, CounterDefinition, CounterEngine, CounterKind, CounterRecord, CounterStats,
    round_amount,
};
pub use error::{LayerError, Result, StoreError};
pub use invalidation::{
    CacheNamespace, FlushObserver, InvalidationBroadcaster, InvalidationMessage, InvalidationStats,
};
pub use store::{DocumentStore, Page, Query};
pub use subscriptions::{
    ActivityThrottle, FixedThrottle, SubscriptionHandle, SubscriptionManager, ThrottlePolicy,
};
pub use traits::{CacheBackend, CacheCodec, PersistentCacheBackend};

// Re-export async_trait for user convenience
pub use async_trait::async_trait;

/// Main entry point: every component of the layer, wired together
///
/// Built by [`LayerBuilder`]. Cloning is cheap and shares the components.
///
/// # Example
///
/// ```rust,no_run
/// use scribe_cache::{CacheStrategy, LayerBuilder};
/// use scribe_cache::store::MemoryStore;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let layer = LayerBuilder::new()
///         .with_store(Arc::new(MemoryStore::new()))
///         .build()
///         .await?;
///
///     let page = layer
///         .read_document("page:owner:p1", "pages/p1", CacheStrategy::Metadata)
///         .await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct ConsistencyLayer {
    /// Tiered cache (primary read interface)
    pub cache_manager: Arc<CacheManager>,
    /// Denormalized counters
    pub counters: Arc<CounterEngine>,
    /// Coalescing write queue
    pub write_queue: Arc<WriteQueue>,
    /// Deduplicated, throttled subscriptions
    pub subscriptions: Arc<SubscriptionManager>,
    /// Mutation → cache removal
    pub invalidation: Arc<InvalidationBroadcaster>,
    store: Arc<dyn DocumentStore>,
}

impl ConsistencyLayer {
    #[must_use]
    pub fn builder() -> LayerBuilder {
        LayerBuilder::new()
    }

    /// The authoritative store behind the layer
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Read-through of one document: memory → persistent → store
    ///
    /// A document found in the store is cached under `key`; a missing one
    /// is not cached.
    ///
    /// # Errors
    ///
    /// Propagates store errors on a cache miss.
    pub async fn read_document(
        &self,
        key: &str,
        path: &str,
        strategy: CacheStrategy,
    ) -> Result<Option<Value>> {
        if let Some(value) = self.cache_manager.get(key).await {
            return Ok(Some(value));
        }
        let Some(value) = self.store.get_document(path).await? else {
            return Ok(None);
        };
        if let Err(e) = self.cache_manager.set(key, &value, strategy).await {
            warn!(key = %key, error = %e, "Failed to cache document");
        }
        Ok(Some(value))
    }

    /// Read-through of one page of a list query, cached under
    /// [`CacheKey::list`] of `entity_kind`
    ///
    /// Concurrent identical queries run against the store once.
    ///
    /// # Errors
    ///
    /// Propagates store errors on a cache miss.
    pub async fn query_list(&self, entity_kind: &str, query: &Query) -> Result<Page> {
        let mut signature = query.signature();
        if let Some(cursor) = &query.cursor {
            signature.push_str("&after=");
            signature.push_str(cursor);
        }
        let key = CacheKey::list(entity_kind, &signature);
        self.cache_manager
            .get_or_compute_typed(&key, CacheStrategy::ListQuery, || async {
                self.store
                    .query_collection(query)
                    .await
                    .map_err(LayerError::from)
            })
            .await
    }

    /// See [`CounterEngine::read`]
    ///
    /// # Errors
    ///
    /// Returns an error only if a required rebuild failed.
    pub async fn read_counter(&self, entity_id: &str, kind: &CounterKind) -> Result<i64> {
        self.counters.read(entity_id, kind).await
    }

    /// See [`CounterEngine::increment`]
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn increment_counter(
        &self,
        entity_id: &str,
        kind: &CounterKind,
        delta: i64,
    ) -> Result<()> {
        self.counters.increment(entity_id, kind, delta).await
    }

    /// See [`CounterEngine::adjust_on_visibility_change`]
    ///
    /// # Errors
    ///
    /// Propagates the failure of the adjustment and of its fallback rebuild.
    pub async fn adjust_counter_on_visibility_change(
        &self,
        entity_id: &str,
        was_visible: bool,
        is_visible: bool,
    ) -> Result<()> {
        self.counters
            .adjust_on_visibility_change(entity_id, was_visible, is_visible)
            .await
    }

    /// See [`WriteQueue::enqueue`]
    ///
    /// # Errors
    ///
    /// Rejects non-object payloads and writes after shutdown.
    pub fn enqueue_write(&self, path: impl Into<String>, payload: Value) -> Result<WriteTicket> {
        self.write_queue.enqueue(path, payload)
    }

    /// Invalidate the cache after a direct mutation, see [`InvalidationBroadcaster::on_mutation`]
    pub async fn on_mutation(&self, entity_kind: &str, entity_id: &str, namespaces: &[CacheNamespace]) {
        self.invalidation
            .on_mutation(entity_kind, entity_id, namespaces)
            .await;
    }

    /// Perform health check on the cache tiers
    ///
    /// Returns `true` if at least the memory tier is operational; a failing
    /// persistent tier only costs hit rate.
    pub async fn health_check(&self) -> bool {
        let health = self.cache_manager.health_check().await;
        if health.persistent.unwrap_or(true) && health.memory {
            info!("Consistency layer health check passed");
        } else {
            warn!(
                memory = health.memory,
                persistent = ?health.persistent,
                "Consistency layer health check - partial failure"
            );
        }
        health.is_operational()
    }

    /// Flush pending writes and stop the write queue's timer
    ///
    /// # Errors
    ///
    /// Returns the failure of the final flush.
    pub async fn shutdown(&self) -> Result<usize> {
        self.write_queue.shutdown().await
    }
}
