//! Counter Reconciliation Engine
//!
//! Denormalized aggregates (page counts, follower counts, unread
//! notifications, ...) are stored as one counter record per
//! `(entity, kind)` at `counters/{entity}_{kind}`:
//!
//! ```json
//! { "entityId": "u1", "kind": "pageCountPublic", "value": 4, "lastUpdated": 1760000000000 }
//! ```
//!
//! Reads go cache → persisted record → full scan of the matching records
//! (scan-and-persist). Writes are delegated to the store's atomic increment
//! and never read-modify-write.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::cache_manager::{CacheKey, CacheManager, CacheStrategy};
use crate::error::{LayerError, Result, StoreError};
use crate::invalidation::{CacheNamespace, InvalidationBroadcaster};
use crate::single_flight::KeyedLocks;
use crate::store::{Delta, DocumentStore, Filter, FilterOp, Query};

/// Collection holding counter records
pub const COUNTER_COLLECTION: &str = "counters";

/// Named category of denormalized aggregate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterKind {
    PageCountTotal,
    PageCountPublic,
    FollowerCount,
    ViewCount,
    ContributorCount,
    UnreadNotifications,
    /// Application-defined kind; needs a registered [`CounterDefinition`] to rebuild
    Custom(String),
}

impl CounterKind {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::PageCountTotal => "pageCountTotal",
            Self::PageCountPublic => "pageCountPublic",
            Self::FollowerCount => "followerCount",
            Self::ViewCount => "viewCount",
            Self::ContributorCount => "contributorCount",
            Self::UnreadNotifications => "unreadNotifications",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted counter value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterRecord {
    pub entity_id: String,
    pub kind: String,
    pub value: i64,
    /// Milliseconds since the epoch of the last rebuild; increments leave it untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<u64>,
}

/// Defining predicate of a counter kind
///
/// A counter's true value is the number of documents in `collection` whose
/// `entity_field` relates to the entity id through `entity_op` and that also
/// match every filter in `filters`.
#[derive(Debug, Clone)]
pub struct CounterDefinition {
    pub kind: CounterKind,
    pub collection: String,
    pub entity_field: String,
    pub entity_op: FilterOp,
    pub filters: Vec<Filter>,
    /// Counter adjusted instead of this one on visibility transitions
    pub public_variant: Option<CounterKind>,
    /// Entity kind whose owner/public views display this counter
    pub entity_kind: String,
}

impl CounterDefinition {
    pub fn new(
        kind: CounterKind,
        entity_kind: impl Into<String>,
        collection: impl Into<String>,
        entity_field: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            collection: collection.into(),
            entity_field: entity_field.into(),
            entity_op: FilterOp::Eq,
            filters: Vec::new(),
            public_variant: None,
            entity_kind: entity_kind.into(),
        }
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn entity_op(mut self, op: FilterOp) -> Self {
        self.entity_op = op;
        self
    }

    #[must_use]
    pub fn public_variant(mut self, kind: CounterKind) -> Self {
        self.public_variant = Some(kind);
        self
    }

    /// Query selecting every record counted for `entity_id`
    #[must_use]
    pub fn query(&self, entity_id: &str) -> Query {
        Query::collection(&self.collection)
            .filter(Filter::new(&self.entity_field, self.entity_op, entity_id))
            .filters(self.filters.iter().cloned())
    }

    /// Definitions of the built-in kinds
    #[must_use]
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new(CounterKind::PageCountTotal, "user", "pages", "userId")
                .public_variant(CounterKind::PageCountPublic),
            Self::new(CounterKind::PageCountPublic, "user", "pages", "userId")
                .filter(Filter::eq("isPublic", true)),
            Self::new(CounterKind::FollowerCount, "user", "follows", "followingId"),
            Self::new(CounterKind::ViewCount, "page", "pageViews", "pageId"),
            Self::new(CounterKind::ContributorCount, "page", "pages", "contributors")
                .entity_op(FilterOp::ArrayContains),
            Self::new(CounterKind::UnreadNotifications, "user", "notifications", "userId")
                .filter(Filter::eq("read", false)),
        ]
    }
}

/// One signed adjustment of a domain event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterAdjustment {
    pub kind: CounterKind,
    pub delta: i64,
}

impl CounterAdjustment {
    #[must_use]
    pub fn new(kind: CounterKind, delta: i64) -> Self {
        Self { kind, delta }
    }

    /// A page was created for its owner
    #[must_use]
    pub fn page_created(is_public: bool) -> Vec<Self> {
        Self::page_delta(is_public, 1)
    }

    /// A page was deleted; a visible page also leaves the public count
    #[must_use]
    pub fn page_deleted(was_public: bool) -> Vec<Self> {
        Self::page_delta(was_public, -1)
    }

    fn page_delta(public: bool, delta: i64) -> Vec<Self> {
        let mut adjustments = vec![Self::new(CounterKind::PageCountTotal, delta)];
        if public {
            adjustments.push(Self::new(CounterKind::PageCountPublic, delta));
        }
        adjustments
    }
}

/// Round a monetary amount to two decimal places
///
/// Applied to every amount before it reaches an increment so that many small
/// deltas cannot accumulate floating-point drift.
#[must_use]
pub fn round_amount(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

/// Counter engine statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterStats {
    pub reads: u64,
    pub rebuilds: u64,
    pub increments: u64,
    pub degraded_reads: u64,
    pub races_recovered: u64,
}

/// Counter Reconciliation Engine
///
/// The only writer of counter deltas. Sibling counters are independently
/// atomic, never transactional with each other.
pub struct CounterEngine {
    store: Arc<dyn DocumentStore>,
    cache: Arc<CacheManager>,
    broadcaster: Arc<InvalidationBroadcaster>,
    definitions: HashMap<CounterKind, CounterDefinition>,
    scan_page_size: usize,
    /// Per-counter guard serializing rebuilds and increments, keyed like the
    /// counter cache entry
    guards: KeyedLocks,
    reads: AtomicU64,
    rebuild_count: AtomicU64,
    increments: AtomicU64,
    degraded_reads: AtomicU64,
    races_recovered: AtomicU64,
}

impl CounterEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<CacheManager>,
        broadcaster: Arc<InvalidationBroadcaster>,
        scan_page_size: usize,
    ) -> Self {
        let definitions = CounterDefinition::defaults()
            .into_iter()
            .map(|def| (def.kind.clone(), def))
            .collect();
        Self {
            store,
            cache,
            broadcaster,
            definitions,
            scan_page_size: scan_page_size.max(1),
            guards: KeyedLocks::new(),
            reads: AtomicU64::new(0),
            rebuild_count: AtomicU64::new(0),
            increments: AtomicU64::new(0),
            degraded_reads: AtomicU64::new(0),
            races_recovered: AtomicU64::new(0),
        }
    }

    /// Register (or replace) the definition of a counter kind
    #[must_use]
    pub fn with_definition(mut self, definition: CounterDefinition) -> Self {
        self.definitions.insert(definition.kind.clone(), definition);
        self
    }

    #[must_use]
    pub fn definition(&self, kind: &CounterKind) -> Option<&CounterDefinition> {
        self.definitions.get(kind)
    }

    /// Document path of the counter record
    #[must_use]
    pub fn record_path(entity_id: &str, kind: &CounterKind) -> String {
        format!("{COUNTER_COLLECTION}/{entity_id}_{kind}")
    }

    /// Current value of a counter, never negative
    ///
    /// # Errors
    ///
    /// Returns an error only when a scan-and-persist rebuild was required and
    /// failed. An unreachable store otherwise degrades to the last known
    /// value, or zero.
    pub async fn read(&self, entity_id: &str, kind: &CounterKind) -> Result<i64> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let key = CacheKey::counter(entity_id, kind.as_str());

        if let Some(value) = self.cache.get_typed::<i64>(&key).await {
            return Ok(value);
        }

        match self.persisted(entity_id, kind).await {
            Ok(Some(record)) => {
                let value = record.value.max(0);
                self.remember(entity_id, kind, value).await;
                Ok(value)
            }
            Ok(None) => self.rebuild_inner(entity_id, kind, true).await,
            Err(StoreError::Unavailable(reason)) => {
                self.degraded_reads.fetch_add(1, Ordering::Relaxed);
                let fallback = self
                    .cache
                    .get_typed::<i64>(&CacheKey::last_known_counter(entity_id, kind.as_str()))
                    .await
                    .unwrap_or(0);
                warn!(
                    entity_id = %entity_id,
                    kind = %kind,
                    fallback,
                    reason = %reason,
                    "Store unavailable, serving last known counter value"
                );
                Ok(fallback)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persisted counter record, if any
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn record(&self, entity_id: &str, kind: &CounterKind) -> Result<Option<CounterRecord>> {
        Ok(self.persisted(entity_id, kind).await?)
    }

    async fn persisted(
        &self,
        entity_id: &str,
        kind: &CounterKind,
    ) -> std::result::Result<Option<CounterRecord>, StoreError> {
        let doc = self
            .store
            .get_document(&Self::record_path(entity_id, kind))
            .await?;
        // A record without a numeric value is as good as absent
        Ok(doc.and_then(|doc| {
            let value = doc.get("value").and_then(Value::as_i64)?;
            Some(CounterRecord {
                entity_id: entity_id.to_string(),
                kind: kind.as_str().to_string(),
                value,
                last_updated: doc.get("lastUpdated").and_then(Value::as_u64),
            })
        }))
    }

    /// Recompute a counter by scanning every matching record, then persist and cache it
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::NotFound`] for a kind without definition and
    /// propagates scan or persist failures.
    pub async fn rebuild(&self, entity_id: &str, kind: &CounterKind) -> Result<i64> {
        self.rebuild_inner(entity_id, kind, false).await
    }

    /// `reuse_cached`: a concurrent rebuild that finished while we waited is good enough
    async fn rebuild_inner(&self, entity_id: &str, kind: &CounterKind, reuse_cached: bool) -> Result<i64> {
        let definition = self.definitions.get(kind).ok_or_else(|| {
            LayerError::NotFound(format!("no counter definition for kind '{kind}'"))
        })?;
        let key = CacheKey::counter(entity_id, kind.as_str());
        let _guard = self.guards.lock(&key).await;

        if reuse_cached {
            if let Some(value) = self.cache.get_typed::<i64>(&key).await {
                debug!(entity_id = %entity_id, kind = %kind, "Reusing concurrent rebuild result");
                return Ok(value);
            }
        }

        self.scan_and_persist(definition, entity_id, kind).await
    }

    /// Caller holds the counter's guard
    async fn scan_and_persist(
        &self,
        definition: &CounterDefinition,
        entity_id: &str,
        kind: &CounterKind,
    ) -> Result<i64> {
        let count = self.scan(definition, entity_id).await?;
        let record = CounterRecord {
            entity_id: entity_id.to_string(),
            kind: kind.as_str().to_string(),
            value: count,
            last_updated: Some(now_millis()),
        };
        self.store
            .set_document(
                &Self::record_path(entity_id, kind),
                serde_json::to_value(&record)?,
                false,
            )
            .await?;
        self.rebuild_count.fetch_add(1, Ordering::Relaxed);
        info!(entity_id = %entity_id, kind = %kind, value = count, "Counter rebuilt from scan");

        // Views embedding the old value are stale now
        self.broadcaster
            .on_mutation(
                &definition.entity_kind,
                entity_id,
                &[CacheNamespace::Counter(kind.clone())],
            )
            .await;
        self.remember(entity_id, kind, count).await;
        Ok(count)
    }

    async fn scan(&self, definition: &CounterDefinition, entity_id: &str) -> Result<i64> {
        let base = definition.query(entity_id).limit(self.scan_page_size);
        let mut cursor = None;
        let mut count: i64 = 0;
        let mut pages = 0_u32;
        loop {
            let page = self
                .store
                .query_collection(&base.clone().start_after(cursor))
                .await?;
            pages += 1;
            count += i64::try_from(page.documents.len()).unwrap_or(i64::MAX);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        debug!(
            collection = %definition.collection,
            entity_id = %entity_id,
            count,
            pages,
            "Scanned matching records"
        );
        Ok(count)
    }

    async fn remember(&self, entity_id: &str, kind: &CounterKind, value: i64) {
        let key = CacheKey::counter(entity_id, kind.as_str());
        if let Err(e) = self.cache.set_typed(&key, &value, CacheStrategy::Counter).await {
            warn!(key = %key, error = %e, "Failed to cache counter");
        }
        // Outlives the counter entry; the memory tier's capacity bounds it
        let last_known = CacheKey::last_known_counter(entity_id, kind.as_str());
        if let Err(e) = self
            .cache
            .set_memory_only(&last_known, &value, CacheStrategy::Content)
            .await
        {
            debug!(key = %last_known, error = %e, "Failed to remember counter value");
        }
    }

    /// Atomically add `delta` to a counter and invalidate the views showing it
    ///
    /// A missing record is created with `delta` as its value. Waits for a
    /// rebuild of the same counter in progress, so the scan result it
    /// persists cannot overwrite this delta.
    ///
    /// # Errors
    ///
    /// Returns [`LayerError::ConcurrentModificationRace`] when the record
    /// vanished twice in a row, and propagates other store errors.
    pub async fn increment(&self, entity_id: &str, kind: &CounterKind, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let _guard = self
            .guards
            .lock(&CacheKey::counter(entity_id, kind.as_str()))
            .await;
        self.increment_guarded(entity_id, kind, delta).await
    }

    /// Caller holds the counter's guard
    async fn increment_guarded(&self, entity_id: &str, kind: &CounterKind, delta: i64) -> Result<()> {
        let path = Self::record_path(entity_id, kind);

        match self.store.atomic_increment(&path, "value", Delta::Int(delta)).await {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => {
                // Record deleted mid-flight: recreate its identity, then retry once
                self.races_recovered.fetch_add(1, Ordering::Relaxed);
                debug!(entity_id = %entity_id, kind = %kind, "Counter record vanished, recreating");
                let identity = json!({"entityId": entity_id, "kind": kind.as_str()});
                self.store.set_document(&path, identity, true).await?;
                match self.store.atomic_increment(&path, "value", Delta::Int(delta)).await {
                    Ok(()) => {}
                    Err(StoreError::NotFound(_)) => {
                        return Err(LayerError::ConcurrentModificationRace(path));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }

        self.increments.fetch_add(1, Ordering::Relaxed);
        debug!(entity_id = %entity_id, kind = %kind, delta, "Counter incremented");
        self.invalidate(entity_id, kind).await;
        Ok(())
    }

    async fn invalidate(&self, entity_id: &str, kind: &CounterKind) {
        let entity_kind = self
            .definitions
            .get(kind)
            .map_or("entity", |def| def.entity_kind.as_str());
        self.broadcaster
            .on_mutation(entity_kind, entity_id, &[CacheNamespace::Counter(kind.clone())])
            .await;
    }

    /// Page visibility changed: adjust the public page counter only
    ///
    /// # Errors
    ///
    /// See [`CounterEngine::adjust_visibility_of`].
    pub async fn adjust_on_visibility_change(
        &self,
        entity_id: &str,
        was_visible: bool,
        is_visible: bool,
    ) -> Result<()> {
        self.adjust_visibility_of(entity_id, &CounterKind::PageCountTotal, was_visible, is_visible)
            .await
    }

    /// Adjust the public variant of `total_kind` on a visibility transition
    ///
    /// The total itself is untouched. A public counter without a persisted
    /// record is rebuilt by scan instead of being seeded with ±1, so the
    /// caller must write the new visibility before calling this.
    ///
    /// # Errors
    ///
    /// Propagates the failure of the increment or of the fallback rebuild.
    pub async fn adjust_visibility_of(
        &self,
        entity_id: &str,
        total_kind: &CounterKind,
        was_visible: bool,
        is_visible: bool,
    ) -> Result<()> {
        if was_visible == is_visible {
            return Ok(());
        }
        let public_kind = self
            .definitions
            .get(total_kind)
            .and_then(|def| def.public_variant.clone())
            .unwrap_or(CounterKind::PageCountPublic);
        let delta = if is_visible { 1 } else { -1 };
        let Some(definition) = self.definitions.get(&public_kind) else {
            return self.increment(entity_id, &public_kind, delta).await;
        };

        let _guard = self
            .guards
            .lock(&CacheKey::counter(entity_id, public_kind.as_str()))
            .await;
        let adjusted = match self.persisted(entity_id, &public_kind).await? {
            Some(_) => self.increment_guarded(entity_id, &public_kind, delta).await,
            None => Err(LayerError::NotFound(Self::record_path(entity_id, &public_kind))),
        };
        match adjusted {
            Err(LayerError::NotFound(_) | LayerError::ConcurrentModificationRace(_)) => {
                warn!(
                    entity_id = %entity_id,
                    kind = %public_kind,
                    "Public counter missing during visibility change, rebuilding"
                );
                self.scan_and_persist(definition, entity_id, &public_kind)
                    .await
                    .map(|_| ())
            }
            other => other,
        }
    }

    /// Apply every adjustment of one domain event
    ///
    /// Each adjustment is attempted even if an earlier one failed.
    ///
    /// # Errors
    ///
    /// Returns the first failure.
    pub async fn apply(&self, entity_id: &str, adjustments: &[CounterAdjustment]) -> Result<()> {
        let mut first_error = None;
        for adjustment in adjustments {
            if let Err(e) = self.increment(entity_id, &adjustment.kind, adjustment.delta).await {
                warn!(
                    entity_id = %entity_id,
                    kind = %adjustment.kind,
                    error = %e,
                    "Counter adjustment failed"
                );
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Delete a counter record; the next read rebuilds it
    ///
    /// # Errors
    ///
    /// Propagates store errors other than not-found.
    pub async fn reset(&self, entity_id: &str, kind: &CounterKind) -> Result<()> {
        let _guard = self
            .guards
            .lock(&CacheKey::counter(entity_id, kind.as_str()))
            .await;
        match self.store.delete_document(&Self::record_path(entity_id, kind)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.cache
            .invalidate(&CacheKey::last_known_counter(entity_id, kind.as_str()))
            .await;
        self.invalidate(entity_id, kind).await;
        info!(entity_id = %entity_id, kind = %kind, "Counter reset");
        Ok(())
    }

    /// Atomically add a monetary amount to `field`, rounded to cents
    ///
    /// # Returns
    ///
    /// The rounded amount actually applied.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn increment_amount(&self, path: &str, field: &str, amount: f64) -> Result<f64> {
        let rounded = round_amount(amount);
        self.store
            .atomic_increment(path, field, Delta::Amount(rounded))
            .await?;
        self.increments.fetch_add(1, Ordering::Relaxed);
        debug!(path = %path, field = %field, amount = rounded, "Amount incremented");
        Ok(rounded)
    }

    #[must_use]
    pub fn stats(&self) -> CounterStats {
        CounterStats {
            reads: self.reads.load(Ordering::Relaxed),
            rebuilds: self.rebuild_count.load(Ordering::Relaxed),
            increments: self.increments.load(Ordering::Relaxed),
            degraded_reads: self.degraded_reads.load(Ordering::Relaxed),
            races_recovered: self.races_recovered.load(Ordering::Relaxed),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
