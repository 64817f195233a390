//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - Layer setup over an in-process store and persistent tier
//! - Fixture generators (pages, follows, notifications)
//! - Polling helpers

#![allow(dead_code)]

use scribe_cache::backends::DashMapCache;
use scribe_cache::config::{BatchConfig, LayerConfig, init_tracing};
use scribe_cache::store::MemoryStore;
use scribe_cache::{ConsistencyLayer, LayerBuilder};
use std::sync::Arc;
use std::time::Duration;

/// Layer plus direct handles on its in-process collaborators
pub struct TestLayer {
    pub layer: ConsistencyLayer,
    pub store: Arc<MemoryStore>,
    pub persistent: Arc<DashMapCache>,
}

/// Configuration with timings short enough for tests
pub fn test_config() -> LayerConfig {
    LayerConfig {
        batch: BatchConfig {
            debounce: Duration::from_millis(30),
            max_delay: Duration::from_millis(300),
        },
        scan_page_size: 2,
        ..LayerConfig::default()
    }
}

/// Initialize a layer over a fresh `MemoryStore` with the default config for tests
pub async fn setup_layer() -> TestLayer {
    setup_layer_with(test_config()).await
}

pub async fn setup_layer_with(config: LayerConfig) -> TestLayer {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let persistent = Arc::new(DashMapCache::new());
    let layer = LayerBuilder::with_config(config)
        .with_store(store.clone())
        .with_persistent_tier(persistent.clone())
        .build()
        .await
        .expect("Failed to build layer");

    TestLayer {
        layer,
        store,
        persistent,
    }
}

/// Create a test key with unique suffix
pub fn test_key(name: &str) -> String {
    format!("test_{}_{}", name, rand::random::<u32>())
}

/// Fixture documents, seeded directly into the store (no notifications)
pub mod fixtures {
    use scribe_cache::store::MemoryStore;
    use serde_json::json;

    /// `public` visible and `private` restricted pages owned by `user_id`
    pub fn seed_pages(store: &MemoryStore, user_id: &str, public: usize, private: usize) {
        for i in 0..public {
            store.insert(
                format!("pages/{user_id}-pub-{i}"),
                json!({"userId": user_id, "isPublic": true, "title": format!("Public {i}")}),
            );
        }
        for i in 0..private {
            store.insert(
                format!("pages/{user_id}-priv-{i}"),
                json!({"userId": user_id, "isPublic": false, "title": format!("Draft {i}")}),
            );
        }
    }

    pub fn seed_followers(store: &MemoryStore, user_id: &str, count: usize) {
        for i in 0..count {
            store.insert(
                format!("follows/f{i}-{user_id}"),
                json!({"followerId": format!("f{i}"), "followingId": user_id}),
            );
        }
    }

    pub fn seed_notifications(store: &MemoryStore, user_id: &str, unread: usize, read: usize) {
        for i in 0..unread + read {
            store.insert(
                format!("notifications/{user_id}-n{i}"),
                json!({"userId": user_id, "read": i >= unread}),
            );
        }
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F>(mut condition: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> bool,
{
    use tokio::time::{Duration, sleep};

    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }

    condition()
}

/// Assert that cache stats meet expectations
#[macro_export]
macro_rules! assert_cache_stats {
    ($layer:expr, $field:ident > $value:expr) => {
        let stats = $layer.cache_manager.get_stats();
        assert!(
            stats.$field > $value,
            "Expected {} > {}, got {}",
            stringify!($field),
            $value,
            stats.$field
        );
    };
    ($layer:expr, $field:ident == $value:expr) => {
        let stats = $layer.cache_manager.get_stats();
        assert_eq!(
            stats.$field,
            $value,
            "Expected {} == {}, got {}",
            stringify!($field),
            $value,
            stats.$field
        );
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let key1 = test_key("user");
        let key2 = test_key("user");
        assert_ne!(key1, key2, "Keys should be unique");
        assert!(key1.starts_with("test_user_"));
    }
}
