//! Integration tests for deduplicated, throttled subscriptions

mod common;

use common::*;
use futures_util::future::join_all;
use parking_lot::Mutex;
use scribe_cache::store::{Filter, MemoryStore};
use scribe_cache::{DocumentStore, FixedThrottle, Query, SubscriptionHandle, ThrottlePolicy};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type Received = Arc<Mutex<Vec<Value>>>;

/// Subscribe to `pages/{id}` under a shared key, recording what the callback sees
async fn subscribe_page(
    t: &TestLayer,
    page_id: &str,
    factory_calls: &Arc<AtomicUsize>,
    policy: Arc<dyn ThrottlePolicy>,
) -> (SubscriptionHandle, Received) {
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let store: Arc<MemoryStore> = Arc::clone(&t.store);
    let calls = Arc::clone(factory_calls);
    let path = format!("pages/{page_id}");

    let handle = t
        .layer
        .subscriptions
        .subscribe(
            &format!("page:{page_id}"),
            move |on_change| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                store.subscribe_document(&path, on_change).await
            },
            move |value| sink.lock().push(value.clone()),
            policy,
        )
        .await
        .expect("subscribe failed");
    (handle, received)
}

fn unthrottled() -> Arc<dyn ThrottlePolicy> {
    Arc::new(FixedThrottle(Duration::ZERO))
}

/// K concurrent subscribers share one underlying store subscription
#[tokio::test]
async fn test_concurrent_subscribers_share_one_listener() {
    let t = setup_layer().await;
    let factory_calls = Arc::new(AtomicUsize::new(0));

    let subscriptions = join_all(
        (0..5).map(|_| subscribe_page(&t, "p1", &factory_calls, unthrottled())),
    )
    .await;

    assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
    assert_eq!(t.store.active_subscriptions(), 1);
    assert_eq!(t.layer.subscriptions.active_subscriptions(), 1);
    assert_eq!(t.layer.subscriptions.subscriber_count("page:p1"), 5);

    t.store
        .set_document("pages/p1", json!({"title": "Live"}), false)
        .await
        .expect("write failed");

    for (_, received) in &subscriptions {
        assert_eq!(*received.lock(), vec![json!({"title": "Live"})]);
    }
    let stats = t.layer.subscriptions.stats();
    assert_eq!(stats.underlying_created, 1);
    assert_eq!(stats.events_received, 1);
    assert_eq!(stats.deliveries, 5);
}

/// The last unsubscribe tears the listener down, exactly once
#[tokio::test]
async fn test_last_unsubscribe_tears_down_listener() {
    let t = setup_layer().await;
    let factory_calls = Arc::new(AtomicUsize::new(0));

    let mut subscriptions = Vec::new();
    for _ in 0..3 {
        subscriptions.push(subscribe_page(&t, "p2", &factory_calls, unthrottled()).await);
    }

    let (mut first, _) = subscriptions.remove(0);
    first.unsubscribe();
    first.unsubscribe();
    assert_eq!(t.store.active_subscriptions(), 1);
    assert_eq!(t.layer.subscriptions.subscriber_count("page:p2"), 2);

    drop(subscriptions);

    assert_eq!(t.store.active_subscriptions(), 0);
    assert_eq!(t.store.stats().subscriptions_closed, 1);
    assert_eq!(t.layer.subscriptions.active_subscriptions(), 0);
    assert_eq!(t.layer.subscriptions.stats().underlying_torn_down, 1);

    // A new subscriber opens a fresh listener
    let _again = subscribe_page(&t, "p2", &factory_calls, unthrottled()).await;
    assert_eq!(factory_calls.load(Ordering::SeqCst), 2);
    assert_eq!(t.store.active_subscriptions(), 1);
}

/// Late subscribers are seeded with the latest known value
#[tokio::test]
async fn test_late_subscriber_is_seeded() {
    let t = setup_layer().await;
    let factory_calls = Arc::new(AtomicUsize::new(0));

    let (_early, _) = subscribe_page(&t, "p3", &factory_calls, unthrottled()).await;
    t.store
        .set_document("pages/p3", json!({"rev": 7}), false)
        .await
        .expect("write failed");

    let (_late, received) = subscribe_page(&t, "p3", &factory_calls, unthrottled()).await;
    assert_eq!(*received.lock(), vec![json!({"rev": 7})]);
    assert_eq!(factory_calls.load(Ordering::SeqCst), 1);
}

/// Deletions reach subscribers as null
#[tokio::test]
async fn test_deletion_is_delivered_as_null() {
    let t = setup_layer().await;
    t.store.insert("pages/p4", json!({"title": "Doomed"}));
    let factory_calls = Arc::new(AtomicUsize::new(0));

    let (_handle, received) = subscribe_page(&t, "p4", &factory_calls, unthrottled()).await;
    t.store
        .delete_document("pages/p4")
        .await
        .expect("delete failed");

    assert_eq!(received.lock().last(), Some(&Value::Null));
}

/// Each subscriber is throttled by its own policy
#[tokio::test]
async fn test_throttle_is_per_subscriber() {
    let t = setup_layer().await;
    let factory_calls = Arc::new(AtomicUsize::new(0));

    let (_fast, fast) = subscribe_page(&t, "p5", &factory_calls, unthrottled()).await;
    let (_slow, slow) = subscribe_page(
        &t,
        "p5",
        &factory_calls,
        Arc::new(FixedThrottle(Duration::from_secs(3600))),
    )
    .await;

    for rev in 0..3 {
        t.store
            .set_document("pages/p5", json!({"rev": rev}), false)
            .await
            .expect("write failed");
    }

    assert_eq!(fast.lock().len(), 3);
    assert_eq!(*slow.lock(), vec![json!({"rev": 0})]);
    assert_eq!(t.layer.subscriptions.stats().throttled, 2);
}

/// A factory error registers nothing
#[tokio::test]
async fn test_failed_factory_registers_nothing() {
    let t = setup_layer().await;
    t.store.set_available(false);
    let store: Arc<MemoryStore> = Arc::clone(&t.store);

    let result = t
        .layer
        .subscriptions
        .subscribe(
            "page:p6",
            move |on_change| async move { store.subscribe_document("pages/p6", on_change).await },
            |_| {},
            unthrottled(),
        )
        .await;

    assert!(result.is_err());
    assert_eq!(t.layer.subscriptions.active_subscriptions(), 0);
}

/// Collection listeners receive the matching documents on every change
#[tokio::test]
async fn test_collection_subscription_receives_matches() {
    let t = setup_layer().await;
    fixtures::seed_pages(&t.store, "u1", 1, 1);
    let received: Received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let store: Arc<MemoryStore> = Arc::clone(&t.store);
    let query = Query::collection("pages").filter(Filter::eq("userId", "u1"));

    let _handle = t
        .layer
        .subscriptions
        .subscribe(
            "page:list:u1",
            move |on_change| async move { store.subscribe_collection(&query, on_change).await },
            move |value| sink.lock().push(value.clone()),
            unthrottled(),
        )
        .await
        .expect("subscribe failed");

    t.store
        .set_document("pages/u1-new", json!({"userId": "u1", "isPublic": true}), false)
        .await
        .expect("write failed");

    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(
        received.first().and_then(Value::as_array).map(Vec::len),
        Some(3)
    );
}
