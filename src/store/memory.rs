//! In-process `DocumentStore`
//!
//! Keeps documents in a `BTreeMap` keyed by slash-separated path
//! (`"pages/p1"`, `"users/u1/notifications/n7"`). A document's collection is
//! its path minus the last segment.
//!
//! Besides the store contract it offers fault injection (`set_available`,
//! `reject_batches`), artificial query latency and operation counters so tests
//! can assert how many round trips the layer made.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

use super::{
    ChangeSink, Delta, DocumentStore, Document, Direction, Page, Query, StoreResult,
    StoreSubscription, WriteOp, compare_values, lookup_field, merge_into,
};
use crate::error::StoreError;

enum WatchTarget {
    Document(String),
    Collection(Query),
}

struct Watcher {
    target: WatchTarget,
    sink: ChangeSink,
}

type WatcherMap = Mutex<HashMap<u64, Watcher>>;

/// Operation counters of a [`MemoryStore`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    pub reads: u64,
    pub writes: u64,
    pub increments: u64,
    pub queries: u64,
    pub batch_writes: u64,
    pub deletes: u64,
    pub subscriptions_opened: u64,
    pub subscriptions_closed: u64,
}

#[derive(Default)]
struct AtomicStoreStats {
    reads: AtomicU64,
    writes: AtomicU64,
    increments: AtomicU64,
    queries: AtomicU64,
    batch_writes: AtomicU64,
    deletes: AtomicU64,
    subscriptions_opened: AtomicU64,
    subscriptions_closed: Arc<AtomicU64>,
}

/// In-memory document store with real atomic increments and live subscriptions
pub struct MemoryStore {
    documents: RwLock<BTreeMap<String, Value>>,
    watchers: Arc<WatcherMap>,
    next_watch_id: AtomicU64,
    available: AtomicBool,
    reject_batches: AtomicBool,
    query_latency: Mutex<Option<Duration>>,
    stats: AtomicStoreStats,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(BTreeMap::new()),
            watchers: Arc::new(Mutex::new(HashMap::new())),
            next_watch_id: AtomicU64::new(1),
            available: AtomicBool::new(true),
            reject_batches: AtomicBool::new(false),
            query_latency: Mutex::new(None),
            stats: AtomicStoreStats::default(),
        }
    }

    /// Seed a document without counting it as a write or notifying watchers
    pub fn insert(&self, path: impl Into<String>, value: Value) {
        self.documents.write().insert(path.into(), value);
    }

    /// Read a document without counting it as a read
    #[must_use]
    pub fn document(&self, path: &str) -> Option<Value> {
        self.documents.read().get(path).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    /// Simulate an outage: every operation fails with `StoreError::Unavailable`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make `batch_write` fail with `StoreError::Rejected`
    pub fn reject_batches(&self, reject: bool) {
        self.reject_batches.store(reject, Ordering::SeqCst);
    }

    /// Delay every `query_collection` by `latency`
    pub fn set_query_latency(&self, latency: Option<Duration>) {
        *self.query_latency.lock() = latency;
    }

    /// Number of subscriptions currently open
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.watchers.lock().len()
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            reads: self.stats.reads.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            increments: self.stats.increments.load(Ordering::Relaxed),
            queries: self.stats.queries.load(Ordering::Relaxed),
            batch_writes: self.stats.batch_writes.load(Ordering::Relaxed),
            deletes: self.stats.deletes.load(Ordering::Relaxed),
            subscriptions_opened: self.stats.subscriptions_opened.load(Ordering::Relaxed),
            subscriptions_closed: self.stats.subscriptions_closed.load(Ordering::Relaxed),
        }
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }

    fn register(&self, target: WatchTarget, sink: ChangeSink) -> Box<dyn StoreSubscription> {
        let id = self.next_watch_id.fetch_add(1, Ordering::Relaxed);
        self.watchers.lock().insert(id, Watcher { target, sink });
        self.stats.subscriptions_opened.fetch_add(1, Ordering::Relaxed);
        Box::new(MemorySubscription {
            id,
            watchers: Arc::downgrade(&self.watchers),
            closed: Arc::clone(&self.stats.subscriptions_closed),
            active: true,
        })
    }

    /// Deliver current state to every watcher affected by `changed` paths
    fn notify(&self, changed: &[String]) {
        let deliveries: Vec<(ChangeSink, Option<Value>)> = {
            let watchers = self.watchers.lock();
            if watchers.is_empty() {
                return;
            }
            let documents = self.documents.read();
            watchers
                .values()
                .filter_map(|watcher| match &watcher.target {
                    WatchTarget::Document(path) if changed.contains(path) => {
                        Some((Arc::clone(&watcher.sink), documents.get(path).cloned()))
                    }
                    WatchTarget::Collection(query)
                        if changed
                            .iter()
                            .any(|p| parent_collection(p) == Some(query.collection.as_str())) =>
                    {
                        let page = run_query(&documents, &Query { cursor: None, ..query.clone() });
                        let items = page.documents.into_iter().map(|d| d.data).collect();
                        Some((Arc::clone(&watcher.sink), Some(Value::Array(items))))
                    }
                    _ => None,
                })
                .collect()
        };

        for (sink, payload) in deliveries {
            sink(payload);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct MemorySubscription {
    id: u64,
    watchers: Weak<WatcherMap>,
    closed: Arc<AtomicU64>,
    active: bool,
}

impl StoreSubscription for MemorySubscription {
    fn cancel(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(watchers) = self.watchers.upgrade() {
            watchers.lock().remove(&self.id);
        }
        self.closed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn parent_collection(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

fn run_query(documents: &BTreeMap<String, Value>, query: &Query) -> Page {
    let mut matched: Vec<Document> = documents
        .iter()
        .filter(|(path, _)| parent_collection(path) == Some(query.collection.as_str()))
        .filter(|(_, data)| query.matches(data))
        .map(|(path, data)| Document {
            path: path.clone(),
            data: data.clone(),
        })
        .collect();

    if let Some(order) = &query.order_by {
        matched.sort_by(|a, b| {
            let ord = match (lookup_field(&a.data, &order.field), lookup_field(&b.data, &order.field)) {
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(CmpOrdering::Equal),
                (Some(_), None) => CmpOrdering::Less,
                (None, Some(_)) => CmpOrdering::Greater,
                (None, None) => CmpOrdering::Equal,
            };
            let ord = match order.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            ord.then_with(|| a.path.cmp(&b.path))
        });
    }

    let start = match &query.cursor {
        Some(cursor) => match matched.iter().position(|d| &d.path == cursor) {
            Some(index) => index + 1,
            None if query.order_by.is_none() => matched
                .iter()
                .position(|d| d.path.as_str() > cursor.as_str())
                .unwrap_or(matched.len()),
            None => matched.len(),
        },
        None => 0,
    };

    let limit = query.limit.unwrap_or(usize::MAX);
    let mut remaining = matched.into_iter().skip(start);
    let documents: Vec<Document> = remaining.by_ref().take(limit).collect();
    let next_cursor = if remaining.next().is_some() {
        documents.last().map(|d| d.path.clone())
    } else {
        None
    };

    Page {
        documents,
        next_cursor,
    }
}

fn apply_op(documents: &mut BTreeMap<String, Value>, op: WriteOp) -> StoreResult<()> {
    match op {
        WriteOp::Set { path, value, merge } => {
            match documents.get_mut(&path) {
                Some(existing) if merge => merge_into(existing, value),
                _ => {
                    documents.insert(path, value);
                }
            }
            Ok(())
        }
        WriteOp::Delete { path } => {
            documents.remove(&path);
            Ok(())
        }
        WriteOp::Increment { path, field, delta } => {
            let doc = documents.entry(path.clone()).or_insert_with(|| json!({}));
            let Some(fields) = doc.as_object_mut() else {
                return Err(StoreError::Rejected(format!(
                    "cannot increment field '{field}' of non-object document {path}"
                )));
            };
            let current = fields.get(&field).cloned().unwrap_or(Value::from(0));
            let next = match delta {
                Delta::Int(d) => match current.as_i64() {
                    Some(n) => Value::from(n.saturating_add(d)),
                    #[allow(clippy::cast_precision_loss)]
                    None => json!(current.as_f64().unwrap_or(0.0) + d as f64),
                },
                Delta::Amount(d) => json!(current.as_f64().unwrap_or(0.0) + d),
            };
            fields.insert(field, next);
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_document(&self, path: &str) -> StoreResult<Option<Value>> {
        self.check_available()?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.documents.read().get(path).cloned())
    }

    async fn set_document(&self, path: &str, value: Value, merge: bool) -> StoreResult<()> {
        self.check_available()?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        apply_op(
            &mut self.documents.write(),
            WriteOp::Set {
                path: path.to_string(),
                value,
                merge,
            },
        )?;
        self.notify(&[path.to_string()]);
        Ok(())
    }

    async fn atomic_increment(&self, path: &str, field: &str, delta: Delta) -> StoreResult<()> {
        self.check_available()?;
        self.stats.increments.fetch_add(1, Ordering::Relaxed);
        apply_op(
            &mut self.documents.write(),
            WriteOp::Increment {
                path: path.to_string(),
                field: field.to_string(),
                delta,
            },
        )?;
        debug!(path = %path, field = %field, ?delta, "[MemoryStore] Atomic increment");
        self.notify(&[path.to_string()]);
        Ok(())
    }

    async fn query_collection(&self, query: &Query) -> StoreResult<Page> {
        let latency = *self.query_latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.check_available()?;
        self.stats.queries.fetch_add(1, Ordering::Relaxed);
        Ok(run_query(&self.documents.read(), query))
    }

    async fn subscribe_document(
        &self,
        path: &str,
        on_change: ChangeSink,
    ) -> StoreResult<Box<dyn StoreSubscription>> {
        self.check_available()?;
        Ok(self.register(WatchTarget::Document(path.to_string()), on_change))
    }

    async fn subscribe_collection(
        &self,
        query: &Query,
        on_change: ChangeSink,
    ) -> StoreResult<Box<dyn StoreSubscription>> {
        self.check_available()?;
        Ok(self.register(WatchTarget::Collection(query.clone()), on_change))
    }

    async fn delete_document(&self, path: &str) -> StoreResult<()> {
        self.check_available()?;
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        self.documents.write().remove(path);
        self.notify(&[path.to_string()]);
        Ok(())
    }

    async fn batch_write(&self, operations: Vec<WriteOp>) -> StoreResult<()> {
        self.check_available()?;
        if self.reject_batches.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("batch rejected".to_string()));
        }
        self.stats.batch_writes.fetch_add(1, Ordering::Relaxed);

        let changed: Vec<String> = operations.iter().map(|op| op.path().to_string()).collect();
        {
            let mut documents = self.documents.write();
            let mut staged = documents.clone();
            for op in operations {
                apply_op(&mut staged, op)?;
            }
            *documents = staged;
        }
        self.notify(&changed);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MemoryStore"
    }
}
