//! Cache invalidation module
//!
//! Translates mutations into cache removals across both tiers. Every applied
//! [`InvalidationMessage`] is republished on an in-process broadcast channel so
//! other components can react to (or tests can observe) invalidations.

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache_manager::{CacheKey, CacheManager, CacheStrategy, ViewScope};
use crate::counters::CounterKind;
use crate::error::Result;

/// Capacity of the broadcast channel; slow receivers observe `Lagged`
const CHANNEL_CAPACITY: usize = 1024;

/// Invalidation message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InvalidationMessage {
    /// Remove a single key from both tiers
    Remove { key: String },

    /// Replace a key with a fresh value instead of removing it
    /// Avoids a miss on hot keys whose new value is already known
    Update {
        key: String,
        value: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        ttl_secs: Option<u64>,
    },

    /// Remove every key starting with `prefix` (e.g. `"page:list:"`)
    RemovePrefix { prefix: String },

    /// Bulk remove multiple keys at once
    RemoveBulk { keys: Vec<String> },
}

impl InvalidationMessage {
    /// Create a Remove message
    pub fn remove(key: impl Into<String>) -> Self {
        Self::Remove { key: key.into() }
    }

    /// Create an Update message
    pub fn update(key: impl Into<String>, value: serde_json::Value, ttl: Option<Duration>) -> Self {
        Self::Update {
            key: key.into(),
            value,
            ttl_secs: ttl.map(|d| d.as_secs()),
        }
    }

    /// Create a `RemovePrefix` message
    pub fn remove_prefix(prefix: impl Into<String>) -> Self {
        Self::RemovePrefix {
            prefix: prefix.into(),
        }
    }

    /// Create a `RemoveBulk` message
    #[must_use]
    pub fn remove_bulk(keys: Vec<String>) -> Self {
        Self::RemoveBulk { keys }
    }

    /// Serialize to JSON
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::Codec`](crate::LayerError::Codec) if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::Codec`](crate::LayerError::Codec) for malformed input.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Get TTL as Duration if present
    #[must_use]
    pub fn ttl(&self) -> Option<Duration> {
        match self {
            Self::Update { ttl_secs, .. } => ttl_secs.map(Duration::from_secs),
            _ => None,
        }
    }
}

/// Cache namespace affected by a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheNamespace {
    /// Owner and public views of the entity
    Entity,
    /// Every cached list query of the entity kind (coarse prefix deletion)
    List,
    /// The cached counter plus both entity views that display it
    Counter(CounterKind),
    /// Arbitrary key prefix
    Custom(String),
}

impl CacheNamespace {
    /// Message removing this namespace for `entity_kind`/`entity_id`
    #[must_use]
    pub fn message(&self, entity_kind: &str, entity_id: &str) -> InvalidationMessage {
        let views = || {
            vec![
                CacheKey::entity(entity_kind, entity_id, ViewScope::Owner),
                CacheKey::entity(entity_kind, entity_id, ViewScope::Public),
            ]
        };
        match self {
            Self::Entity => InvalidationMessage::remove_bulk(views()),
            Self::List => InvalidationMessage::remove_prefix(CacheKey::list_prefix(entity_kind)),
            Self::Counter(kind) => {
                let mut keys = vec![CacheKey::counter(entity_id, kind.as_str())];
                keys.extend(views());
                InvalidationMessage::remove_bulk(keys)
            }
            Self::Custom(prefix) => InvalidationMessage::remove_prefix(prefix.clone()),
        }
    }
}

/// Statistics for invalidation operations
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InvalidationStats {
    /// Number of `on_mutation` calls
    pub mutations: u64,

    /// Number of messages applied
    pub messages_applied: u64,

    /// Number of messages republished to at least one receiver
    pub messages_sent: u64,

    /// Number of Remove operations performed
    pub removes: u64,

    /// Number of Update operations performed
    pub updates: u64,

    /// Number of `RemovePrefix` operations performed
    pub prefixes: u64,

    /// Number of `RemoveBulk` operations performed
    pub bulk_removes: u64,

    /// Number of failed Update attempts (fell back to removal)
    pub processing_errors: u64,
}

/// Thread-safe statistics for invalidation operations
#[derive(Debug, Default)]
pub struct AtomicInvalidationStats {
    pub mutations: AtomicU64,
    pub messages_applied: AtomicU64,
    pub messages_sent: AtomicU64,
    pub removes: AtomicU64,
    pub updates: AtomicU64,
    pub prefixes: AtomicU64,
    pub bulk_removes: AtomicU64,
    pub processing_errors: AtomicU64,
}

impl AtomicInvalidationStats {
    pub fn snapshot(&self) -> InvalidationStats {
        InvalidationStats {
            mutations: self.mutations.load(Ordering::Relaxed),
            messages_applied: self.messages_applied.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            prefixes: self.prefixes.load(Ordering::Relaxed),
            bulk_removes: self.bulk_removes.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
        }
    }
}

/// Receives the document paths of every successful batch flush
#[async_trait]
pub trait FlushObserver: Send + Sync {
    async fn on_flushed(&self, paths: &[String]);
}

/// Where writes to one collection land in the cache
#[derive(Debug, Clone)]
struct CollectionRoute {
    entity_kind: String,
    namespaces: Vec<CacheNamespace>,
}

/// Cache Invalidation Broadcaster
///
/// Runs inline with the mutation that triggers it, so the staleness window
/// after a successful write is bounded by the caller's own await.
pub struct InvalidationBroadcaster {
    cache: Arc<CacheManager>,
    sender: broadcast::Sender<InvalidationMessage>,
    /// Collection name -> cache namespaces, used for flushed batch paths
    routes: RwLock<HashMap<String, CollectionRoute>>,
    stats: AtomicInvalidationStats,
}

impl InvalidationBroadcaster {
    #[must_use]
    pub fn new(cache: Arc<CacheManager>) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            cache,
            sender,
            routes: RwLock::new(HashMap::new()),
            stats: AtomicInvalidationStats::default(),
        }
    }

    /// Observe every applied invalidation
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationMessage> {
        self.sender.subscribe()
    }

    /// Get a snapshot of current statistics
    pub fn stats(&self) -> InvalidationStats {
        self.stats.snapshot()
    }

    /// Map documents of `collection` to `entity_kind` cache entries
    ///
    /// Batched writes flushed to `collection/{id}` then invalidate
    /// `namespaces` for entity `{id}`.
    pub fn route_collection(
        &self,
        collection: impl Into<String>,
        entity_kind: impl Into<String>,
        namespaces: Vec<CacheNamespace>,
    ) {
        self.routes.write().insert(
            collection.into(),
            CollectionRoute {
                entity_kind: entity_kind.into(),
                namespaces,
            },
        );
    }

    /// Remove every cache entry affected by a mutation of `entity_kind`/`entity_id`
    pub async fn on_mutation(
        &self,
        entity_kind: &str,
        entity_id: &str,
        namespaces: &[CacheNamespace],
    ) {
        self.stats.mutations.fetch_add(1, Ordering::Relaxed);
        debug!(
            entity_kind = %entity_kind,
            entity_id = %entity_id,
            namespaces = namespaces.len(),
            "Invalidating after mutation"
        );
        for namespace in namespaces {
            self.apply(namespace.message(entity_kind, entity_id)).await;
        }
    }

    /// Apply one message to both tiers, then republish it
    pub async fn apply(&self, message: InvalidationMessage) {
        match &message {
            InvalidationMessage::Remove { key } => {
                self.stats.removes.fetch_add(1, Ordering::Relaxed);
                self.cache.invalidate(key).await;
            }
            InvalidationMessage::Update { key, value, .. } => {
                self.stats.updates.fetch_add(1, Ordering::Relaxed);
                let strategy = message
                    .ttl()
                    .map_or(CacheStrategy::Metadata, CacheStrategy::Custom);
                if let Err(e) = self.cache.set(key, value, strategy).await {
                    // A failed refresh must not leave the old value behind
                    warn!(key = %key, error = %e, "Cache update failed, removing instead");
                    self.stats.processing_errors.fetch_add(1, Ordering::Relaxed);
                    self.cache.invalidate(key).await;
                }
            }
            InvalidationMessage::RemovePrefix { prefix } => {
                self.stats.prefixes.fetch_add(1, Ordering::Relaxed);
                self.cache.invalidate_prefix(prefix).await;
            }
            InvalidationMessage::RemoveBulk { keys } => {
                self.stats.bulk_removes.fetch_add(1, Ordering::Relaxed);
                join_all(keys.iter().map(|key| self.cache.invalidate(key))).await;
            }
        }

        self.stats.messages_applied.fetch_add(1, Ordering::Relaxed);
        // No receivers is the common case
        if self.sender.send(message).is_ok() {
            self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl FlushObserver for InvalidationBroadcaster {
    async fn on_flushed(&self, paths: &[String]) {
        for path in paths {
            let routed = path.rsplit_once('/').and_then(|(collection, id)| {
                self.routes
                    .read()
                    .get(collection)
                    .map(|route| (route.clone(), id.to_string()))
            });
            match routed {
                Some((route, id)) => {
                    self.on_mutation(&route.entity_kind, &id, &route.namespaces)
                        .await;
                }
                None => self.apply(InvalidationMessage::remove(path.clone())).await,
            }
        }
    }
}
