//! Integration tests for the tiered read-through cache

mod common;

use common::*;
use scribe_cache::store::Filter;
use scribe_cache::{CacheBackend, CacheKey, CacheStrategy, Query, ViewScope};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;

/// Test basic set and get operations
#[tokio::test]
async fn test_set_then_get() {
    let t = setup_layer().await;
    let key = test_key("set_get");
    let value = json!({"title": "Chapter One", "wordCount": 1200});

    t.layer
        .cache_manager
        .set(&key, &value, CacheStrategy::Metadata)
        .await
        .expect("Failed to set value");

    let cached = t.layer.cache_manager.get(&key).await;
    assert_eq!(cached, Some(value));
    assert_cache_stats!(t.layer, memory_hits == 1);
}

/// Entries vanish from both tiers once their TTL has elapsed
#[tokio::test]
async fn test_ttl_expiration() {
    let t = setup_layer().await;
    let key = test_key("ttl");
    let value = json!({"status": "draft"});

    t.layer
        .cache_manager
        .set(&key, &value, CacheStrategy::Custom(Duration::from_millis(200)))
        .await
        .expect("Failed to set value");
    assert_eq!(t.layer.cache_manager.get(&key).await, Some(value));

    sleep(Duration::from_millis(400)).await;

    assert_eq!(t.layer.cache_manager.get(&key).await, None);
    assert!(t.persistent.get(&key).await.is_none());
}

/// Persistent hits are promoted into the memory tier
#[tokio::test]
async fn test_persistent_hit_is_promoted() {
    let t = setup_layer().await;
    let key = test_key("promote");
    let value = json!({"name": "Ada"});
    let bytes = serde_json::to_vec(&value).expect("Failed to serialize");

    // Written behind the manager's back, so only the persistent tier has it
    t.persistent
        .set_with_ttl(&key, &bytes, Duration::from_secs(30))
        .await
        .expect("Failed to seed persistent tier");

    assert_eq!(t.layer.cache_manager.get(&key).await, Some(value.clone()));
    assert_cache_stats!(t.layer, persistent_hits == 1);
    assert_cache_stats!(t.layer, promotions == 1);

    assert_eq!(t.layer.cache_manager.get(&key).await, Some(value));
    assert_cache_stats!(t.layer, memory_hits == 1);
}

#[tokio::test]
async fn test_read_document_through_cache() {
    let t = setup_layer().await;
    t.store.insert("pages/p1", json!({"title": "Prologue"}));
    let key = CacheKey::entity("page", "p1", ViewScope::Owner);

    let first = t
        .layer
        .read_document(&key, "pages/p1", CacheStrategy::Metadata)
        .await
        .expect("read failed");
    let second = t
        .layer
        .read_document(&key, "pages/p1", CacheStrategy::Metadata)
        .await
        .expect("read failed");

    assert_eq!(first, Some(json!({"title": "Prologue"})));
    assert_eq!(first, second);
    assert_eq!(t.store.stats().reads, 1, "second read must be served from cache");
}

#[tokio::test]
async fn test_missing_document_is_not_cached() {
    let t = setup_layer().await;
    let key = CacheKey::entity("page", "ghost", ViewScope::Public);

    for _ in 0..2 {
        let doc = t
            .layer
            .read_document(&key, "pages/ghost", CacheStrategy::Metadata)
            .await
            .expect("read failed");
        assert!(doc.is_none());
    }
    assert_eq!(t.store.stats().reads, 2);
}

#[tokio::test]
async fn test_query_list_is_cached_until_list_invalidation() {
    let t = setup_layer().await;
    fixtures::seed_pages(&t.store, "u1", 2, 1);
    let query = Query::collection("pages").filter(Filter::eq("userId", "u1"));

    let first = t
        .layer
        .query_list("page", &query)
        .await
        .expect("query failed");
    let second = t
        .layer
        .query_list("page", &query)
        .await
        .expect("query failed");
    assert_eq!(first.documents.len(), 3);
    assert_eq!(first, second);
    assert_eq!(t.store.stats().queries, 1);

    t.store.insert("pages/u1-new", json!({"userId": "u1", "isPublic": true}));
    t.layer
        .on_mutation("page", "u1-new", &[scribe_cache::CacheNamespace::List])
        .await;

    let third = t
        .layer
        .query_list("page", &query)
        .await
        .expect("query failed");
    assert_eq!(third.documents.len(), 4);
    assert_eq!(t.store.stats().queries, 2);
}

#[tokio::test]
async fn test_query_list_pages_are_cached_separately() {
    let t = setup_layer().await;
    fixtures::seed_pages(&t.store, "u2", 3, 0);
    let first_page = Query::collection("pages")
        .filter(Filter::eq("userId", "u2"))
        .limit(2);

    let page = t
        .layer
        .query_list("page", &first_page)
        .await
        .expect("query failed");
    assert_eq!(page.documents.len(), 2);

    let rest = t
        .layer
        .query_list("page", &first_page.clone().start_after(page.next_cursor.clone()))
        .await
        .expect("query failed");
    assert_eq!(rest.documents.len(), 1);
    assert!(rest.next_cursor.is_none());
    assert_eq!(t.store.stats().queries, 2);
}

/// Concurrent identical queries reach the store once
#[tokio::test]
async fn test_concurrent_list_queries_coalesce() {
    let t = setup_layer().await;
    fixtures::seed_pages(&t.store, "u3", 4, 0);
    t.store.set_query_latency(Some(Duration::from_millis(50)));
    let layer = Arc::new(t.layer.clone());

    let mut tasks = JoinSet::new();
    for _ in 0..20 {
        let layer = Arc::clone(&layer);
        tasks.spawn(async move {
            let query = Query::collection("pages").filter(Filter::eq("userId", "u3"));
            layer.query_list("page", &query).await
        });
    }

    while let Some(result) = tasks.join_next().await {
        let page = result
            .expect("task panicked")
            .expect("query failed");
        assert_eq!(page.documents.len(), 4);
    }
    assert_eq!(t.store.stats().queries, 1);
}

/// A failing persistent tier costs hit rate, never availability
#[tokio::test]
async fn test_failing_persistent_tier_is_tolerated() {
    let t = setup_layer().await;
    t.persistent.set_failing(true);
    let key = test_key("degraded");

    t.layer
        .cache_manager
        .set(&key, &json!(7), CacheStrategy::Counter)
        .await
        .expect("memory tier alone should accept the write");
    assert_eq!(t.layer.cache_manager.get(&key).await, Some(json!(7)));

    assert!(t.layer.health_check().await);
    let health = t.layer.cache_manager.health_check().await;
    assert_eq!(health.persistent, Some(false));
}
