//! Integration tests for the coalescing write queue

mod common;

use common::*;
use scribe_cache::{CacheKey, CacheNamespace, CacheStrategy, ViewScope, WriteState};
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;

/// Rapid writes to one path collapse into a single store write of the last payload
#[tokio::test]
async fn test_rapid_writes_coalesce() {
    let t = setup_layer().await;

    let mut tickets = Vec::new();
    for i in 0..5 {
        let ticket = t
            .layer
            .enqueue_write("drafts/d1", json!({"body": format!("revision {i}")}))
            .expect("enqueue failed");
        tickets.push(ticket);
    }
    let last = tickets.pop().expect("no tickets");

    assert_eq!(last.settled().await, WriteState::Acknowledged);
    for ticket in tickets {
        assert_eq!(ticket.state(), WriteState::Superseded);
    }

    assert_eq!(t.store.stats().batch_writes, 1);
    assert_eq!(
        t.store.document("drafts/d1"),
        Some(json!({"body": "revision 4"}))
    );

    let stats = t.layer.write_queue.stats();
    assert_eq!(stats.enqueued, 5);
    assert_eq!(stats.coalesced, 4);
    assert_eq!(stats.writes_flushed, 1);
}

/// Writes to distinct paths in one window share one batch
#[tokio::test]
async fn test_distinct_paths_share_one_batch() {
    let t = setup_layer().await;

    let tickets: Vec<_> = (0..3)
        .map(|i| {
            t.layer
                .enqueue_write(format!("drafts/d{i}"), json!({"n": i}))
                .expect("enqueue failed")
        })
        .collect();
    for ticket in tickets {
        assert_eq!(ticket.settled().await, WriteState::Acknowledged);
    }

    assert_eq!(t.store.stats().batch_writes, 1);
    assert_eq!(t.store.len(), 3);
}

/// Batched writes merge into existing documents
#[tokio::test]
async fn test_flush_merges_into_existing_document() {
    let t = setup_layer().await;
    t.store
        .insert("pages/p1", json!({"title": "Draft", "wordCount": 10}));

    let ticket = t
        .layer
        .enqueue_write("pages/p1", json!({"wordCount": 250}))
        .expect("enqueue failed");
    assert_eq!(ticket.settled().await, WriteState::Acknowledged);

    assert_eq!(
        t.store.document("pages/p1"),
        Some(json!({"title": "Draft", "wordCount": 250}))
    );
}

/// The debounce window holds writes back until it elapses
#[tokio::test]
async fn test_writes_wait_for_debounce() {
    let t = setup_layer().await;

    let ticket = t
        .layer
        .enqueue_write("drafts/slow", json!({"body": "x"}))
        .expect("enqueue failed");
    assert_eq!(ticket.state(), WriteState::Queued);
    assert!(t.store.document("drafts/slow").is_none());

    assert!(wait_for(|| t.store.document("drafts/slow").is_some(), 1000).await);
}

/// A rejected batch fails every write in it and leaves the store untouched
#[tokio::test]
async fn test_rejected_batch_fails_all_writes() {
    let t = setup_layer().await;
    t.store.reject_batches(true);

    let a = t
        .layer
        .enqueue_write("drafts/a", json!({"v": 1}))
        .expect("enqueue failed");
    let b = t
        .layer
        .enqueue_write("drafts/b", json!({"v": 2}))
        .expect("enqueue failed");

    assert!(matches!(a.settled().await, WriteState::Failed(_)));
    assert!(matches!(b.settled().await, WriteState::Failed(_)));
    assert!(t.store.is_empty());
    assert_eq!(t.layer.write_queue.stats().failed_batches, 1);
    assert_eq!(t.layer.write_queue.pending_len(), 0);
}

/// Flushed writes to a routed collection invalidate the entity's views
#[tokio::test]
async fn test_flush_invalidates_routed_views() {
    let t = setup_layer().await;
    t.layer
        .invalidation
        .route_collection("pages", "page", vec![CacheNamespace::Entity, CacheNamespace::List]);

    let owner_view = CacheKey::entity("page", "p9", ViewScope::Owner);
    let list = CacheKey::list("page", "userId==u1");
    for key in [&owner_view, &list] {
        t.layer
            .cache_manager
            .set(key, &json!({"stale": true}), CacheStrategy::Metadata)
            .await
            .expect("set failed");
    }

    let ticket = t
        .layer
        .enqueue_write("pages/p9", json!({"title": "Renamed"}))
        .expect("enqueue failed");
    assert_eq!(ticket.settled().await, WriteState::Acknowledged);

    // Observer runs right after acknowledgement
    sleep(Duration::from_millis(20)).await;
    assert!(t.layer.cache_manager.get(&owner_view).await.is_none());
    assert!(t.layer.cache_manager.get(&list).await.is_none());
}

#[tokio::test]
async fn test_shutdown_flushes_pending_writes() {
    let t = setup_layer().await;

    let ticket = t
        .layer
        .enqueue_write("drafts/final", json!({"body": "last words"}))
        .expect("enqueue failed");
    let flushed = t
        .layer
        .shutdown()
        .await
        .expect("shutdown flush failed");

    assert_eq!(flushed, 1);
    assert_eq!(ticket.state(), WriteState::Acknowledged);
    assert!(
        t.layer
            .enqueue_write("drafts/late", json!({"body": "too late"}))
            .is_err()
    );
}
