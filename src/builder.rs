//! Consistency Layer Builder
//!
//! Wires explicitly constructed components together; nothing in this crate
//! is a process-wide singleton.
//!
//! # Example: In-Process Layer
//!
//! ```rust,no_run
//! use scribe_cache::LayerBuilder;
//! use scribe_cache::store::MemoryStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let layer = LayerBuilder::new()
//!         .with_store(Arc::new(MemoryStore::new()))
//!         .build()
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: Custom Persistent Tier
//!
//! ```rust,ignore
//! use scribe_cache::LayerBuilder;
//! use std::sync::Arc;
//!
//! let layer = LayerBuilder::from_env()
//!     .with_store(firestore_adapter)
//!     .with_persistent_tier(Arc::new(MySessionStorage::new()))
//!     .build()
//!     .await?;
//! ```

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::backends::DashMapCache;
use crate::batching::WriteQueue;
use crate::cache_manager::CacheManager;
use crate::config::LayerConfig;
use crate::counters::{CounterDefinition, CounterEngine};
use crate::invalidation::{CacheNamespace, FlushObserver, InvalidationBroadcaster};
use crate::store::DocumentStore;
use crate::subscriptions::SubscriptionManager;
use crate::traits::{CacheBackend, PersistentCacheBackend};
use crate::ConsistencyLayer;

/// Builder for constructing a [`ConsistencyLayer`]
///
/// # Default Behavior
///
/// - **Memory tier**: Moka (`DashMap` without the `moka` feature)
/// - **Persistent tier**: Redis when `persistent_tier_url` is configured,
///   otherwise an in-process `DashMap` tier
/// - **Counters**: the built-in [`CounterDefinition::defaults`]
///
/// The authoritative store has no default and must be supplied.
pub struct LayerBuilder {
    config: LayerConfig,
    store: Option<Arc<dyn DocumentStore>>,
    memory: Option<Arc<dyn CacheBackend>>,
    persistent: Option<Arc<dyn PersistentCacheBackend>>,
    memory_only: bool,
    definitions: Vec<CounterDefinition>,
    routes: Vec<(String, String, Vec<CacheNamespace>)>,
}

impl LayerBuilder {
    /// Create a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(LayerConfig::default())
    }

    /// Create a new builder configured from `SCRIBE_*` environment variables
    #[must_use]
    pub fn from_env() -> Self {
        Self::with_config(LayerConfig::from_env())
    }

    #[must_use]
    pub fn with_config(config: LayerConfig) -> Self {
        Self {
            config,
            store: None,
            memory: None,
            persistent: None,
            memory_only: false,
            definitions: Vec::new(),
            routes: Vec::new(),
        }
    }

    /// Authoritative document store (required)
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Configure a custom memory tier backend
    #[must_use]
    pub fn with_memory_tier(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.memory = Some(backend);
        self
    }

    /// Configure a custom persistent tier backend
    #[must_use]
    pub fn with_persistent_tier(mut self, backend: Arc<dyn PersistentCacheBackend>) -> Self {
        self.persistent = Some(backend);
        self.memory_only = false;
        self
    }

    /// Run with the memory tier alone
    #[must_use]
    pub fn without_persistent_tier(mut self) -> Self {
        self.persistent = None;
        self.memory_only = true;
        self
    }

    /// Register an additional (or replacement) counter definition
    #[must_use]
    pub fn with_counter(mut self, definition: CounterDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Invalidate `namespaces` of `entity_kind` when batched writes to
    /// `collection/{id}` are flushed
    #[must_use]
    pub fn route_collection(
        mut self,
        collection: impl Into<String>,
        entity_kind: impl Into<String>,
        namespaces: Vec<CacheNamespace>,
    ) -> Self {
        self.routes
            .push((collection.into(), entity_kind.into(), namespaces));
        self
    }

    /// Build the layer with configured or default backends
    ///
    /// Must be awaited inside a tokio runtime (the write queue spawns its timer).
    ///
    /// # Errors
    ///
    /// Returns an error if no store was supplied or the Redis persistent tier
    /// cannot be reached.
    pub async fn build(self) -> Result<ConsistencyLayer> {
        info!("Building consistency layer");

        let Some(store) = self.store else {
            anyhow::bail!("a DocumentStore is required to build the consistency layer");
        };

        let memory: Arc<dyn CacheBackend> = match self.memory {
            Some(backend) => {
                info!(backend = backend.name(), "Using custom memory tier");
                backend
            }
            None => default_memory_tier(&self.config),
        };

        let persistent = match self.persistent {
            Some(backend) => {
                info!(backend = backend.name(), "Using custom persistent tier");
                Some(backend)
            }
            None if self.memory_only => None,
            None => Some(default_persistent_tier(&self.config).await?),
        };

        let cache_manager = Arc::new(CacheManager::new(memory, persistent, &self.config));

        let invalidation = Arc::new(InvalidationBroadcaster::new(Arc::clone(&cache_manager)));
        for (collection, entity_kind, namespaces) in self.routes {
            invalidation.route_collection(collection, entity_kind, namespaces);
        }

        let counters = self.definitions.into_iter().fold(
            CounterEngine::new(
                Arc::clone(&store),
                Arc::clone(&cache_manager),
                Arc::clone(&invalidation),
                self.config.scan_page_size,
            ),
            CounterEngine::with_definition,
        );

        let observer: Arc<dyn FlushObserver> = invalidation.clone();
        let write_queue = WriteQueue::new(Arc::clone(&store), self.config.batch, Some(observer));
        let subscriptions = SubscriptionManager::new(Arc::clone(&cache_manager));

        info!(store = store.name(), "Consistency layer built successfully");

        Ok(ConsistencyLayer {
            cache_manager,
            counters: Arc::new(counters),
            write_queue: Arc::new(write_queue),
            subscriptions: Arc::new(subscriptions),
            invalidation,
            store,
        })
    }
}

impl Default for LayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "moka")]
fn default_memory_tier(config: &LayerConfig) -> Arc<dyn CacheBackend> {
    info!("Using default memory tier (Moka)");
    Arc::new(crate::backends::MokaCache::new(&config.memory))
}

#[cfg(not(feature = "moka"))]
fn default_memory_tier(_config: &LayerConfig) -> Arc<dyn CacheBackend> {
    info!("Using default memory tier (DashMap)");
    Arc::new(DashMapCache::new())
}

async fn default_persistent_tier(config: &LayerConfig) -> Result<Arc<dyn PersistentCacheBackend>> {
    match &config.persistent_tier_url {
        #[cfg(feature = "redis")]
        Some(url) => {
            info!("Using Redis persistent tier");
            let redis =
                crate::backends::RedisCache::with_url(url, config.persistent_namespace.clone())
                    .await?;
            Ok(Arc::new(redis))
        }
        #[cfg(not(feature = "redis"))]
        Some(_) => {
            tracing::warn!("Persistent tier URL configured but the `redis` feature is disabled, using DashMap");
            Ok(Arc::new(DashMapCache::new()))
        }
        None => {
            info!("No persistent tier URL configured, using in-process DashMap tier");
            Ok(Arc::new(DashMapCache::new()))
        }
    }
}
