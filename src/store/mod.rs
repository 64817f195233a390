//! Store Adapter - Authoritative Document Store Boundary
//!
//! The authoritative document database is an external collaborator. This module
//! defines the narrow surface the consistency layer consumes from it:
//!
//! - point reads and writes (`get_document`, `set_document`, `delete_document`)
//! - server-side atomic increments (`atomic_increment`)
//! - filtered, paged collection queries (`query_collection`)
//! - change subscriptions (`subscribe_document`, `subscribe_collection`)
//! - all-or-nothing batched writes (`batch_write`)
//!
//! [`MemoryStore`] is a complete in-process implementation used by the test
//! suite and by embedders that want the layer without a remote database.

pub mod memory;

pub use memory::{MemoryStore, MemoryStoreStats};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::StoreError;

/// Result type returned by store adapters
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Callback invoked by the store whenever a watched target changes
///
/// Document subscriptions deliver `Some(data)` or `None` when the document is
/// deleted. Collection subscriptions deliver `Some(Value::Array(..))` holding
/// the matching documents' data.
pub type ChangeSink = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// A live subscription held open against the store
pub trait StoreSubscription: Send {
    /// Stop delivering changes. Must be idempotent.
    fn cancel(&mut self);
}

/// Comparison operator of a query filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Field value is one of the values in the filter's array
    In,
    /// Field is an array containing the filter value
    ArrayContains,
}

/// Single `field op value` predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn array_contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::ArrayContains, value)
    }

    /// Evaluate this predicate against a document body
    #[must_use]
    pub fn matches(&self, doc: &Value) -> bool {
        let Some(actual) = lookup_field(doc, &self.field) else {
            return matches!(self.op, FilterOp::Ne);
        };
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Ne => actual != &self.value,
            FilterOp::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            FilterOp::Lte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOp::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            FilterOp::Gte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOp::In => self
                .value
                .as_array()
                .is_some_and(|candidates| candidates.contains(actual)),
            FilterOp::ArrayContains => actual
                .as_array()
                .is_some_and(|items| items.contains(&self.value)),
        }
    }

    /// Stable textual form, used to build list-query cache keys
    #[must_use]
    pub fn signature(&self) -> String {
        format!("{}{:?}{}", self.field, self.op, self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Filtered, ordered, paged query over one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    /// Path of the last document of the previous page
    pub cursor: Option<String>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
            cursor: None,
        }
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn filters(mut self, filters: impl IntoIterator<Item = Filter>) -> Self {
        self.filters.extend(filters);
        self
    }

    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn start_after(mut self, cursor: Option<String>) -> Self {
        self.cursor = cursor;
        self
    }

    /// `true` when every filter matches `doc`
    #[must_use]
    pub fn matches(&self, doc: &Value) -> bool {
        self.filters.iter().all(|f| f.matches(doc))
    }

    /// Filter signature independent of paging, used for list cache keys
    #[must_use]
    pub fn signature(&self) -> String {
        let mut parts: Vec<String> = self.filters.iter().map(Filter::signature).collect();
        parts.sort();
        if let Some(order) = &self.order_by {
            parts.push(format!("order={}:{:?}", order.field, order.direction));
        }
        if let Some(limit) = self.limit {
            parts.push(format!("limit={limit}"));
        }
        parts.join("&")
    }
}

/// A stored document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub path: String,
    pub data: Value,
}

/// One page of query results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub documents: Vec<Document>,
    /// Present when more results may follow
    pub next_cursor: Option<String>,
}

/// Signed amount applied by an atomic increment
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Delta {
    Int(i64),
    Amount(f64),
}

/// One operation inside an all-or-nothing batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    Set {
        path: String,
        value: Value,
        merge: bool,
    },
    Delete {
        path: String,
    },
    Increment {
        path: String,
        field: String,
        delta: Delta,
    },
}

impl WriteOp {
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Set { path, .. } | Self::Delete { path } | Self::Increment { path, .. } => path,
        }
    }
}

/// Authoritative document store consumed by the layer
///
/// Implementations must provide a true server-side atomic increment: two
/// concurrent `atomic_increment` calls on the same field must both apply.
/// Incrementing a missing document or field creates it, starting from zero.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(&self, path: &str) -> StoreResult<Option<Value>>;

    /// Write a document. With `merge`, top-level object fields are merged into
    /// the existing document instead of replacing it.
    async fn set_document(&self, path: &str, value: Value, merge: bool) -> StoreResult<()>;

    async fn atomic_increment(&self, path: &str, field: &str, delta: Delta) -> StoreResult<()>;

    async fn query_collection(&self, query: &Query) -> StoreResult<Page>;

    async fn subscribe_document(
        &self,
        path: &str,
        on_change: ChangeSink,
    ) -> StoreResult<Box<dyn StoreSubscription>>;

    async fn subscribe_collection(
        &self,
        query: &Query,
        on_change: ChangeSink,
    ) -> StoreResult<Box<dyn StoreSubscription>>;

    async fn delete_document(&self, path: &str) -> StoreResult<()>;

    /// Apply every operation or none of them
    async fn batch_write(&self, operations: Vec<WriteOp>) -> StoreResult<()>;

    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Resolve a dotted field path (`"stats.views"`) inside a document
pub(crate) fn lookup_field<'a>(doc: &'a Value, field: &str) -> Option<&'a Value> {
    field
        .split('.')
        .try_fold(doc, |current, segment| current.get(segment))
}

/// Order two JSON scalars of the same kind
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Merge-patch `patch` into `target`, top-level fields only
pub(crate) fn merge_into(target: &mut Value, patch: Value) {
    match patch {
        Value::Object(fields) if target.is_object() => {
            if let Some(existing) = target.as_object_mut() {
                existing.extend(fields);
            }
        }
        other => *target = other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filters_match_nested_fields_and_operators() {
        let doc = json!({"userId": "u1", "stats": {"views": 12}, "tags": ["draft", "poetry"]});

        assert!(Filter::eq("userId", "u1").matches(&doc));
        assert!(!Filter::eq("userId", "u2").matches(&doc));
        assert!(Filter::new("stats.views", FilterOp::Gte, 12).matches(&doc));
        assert!(!Filter::new("stats.views", FilterOp::Gt, 12).matches(&doc));
        assert!(Filter::array_contains("tags", "poetry").matches(&doc));
        assert!(Filter::new("userId", FilterOp::In, json!(["u0", "u1"])).matches(&doc));
        assert!(Filter::new("missing", FilterOp::Ne, 1).matches(&doc));
    }

    #[test]
    fn query_signature_ignores_filter_order_and_cursor() {
        let a = Query::collection("pages")
            .filter(Filter::eq("userId", "u1"))
            .filter(Filter::eq("isPublic", true))
            .start_after(Some("pages/p9".into()));
        let b = Query::collection("pages")
            .filter(Filter::eq("isPublic", true))
            .filter(Filter::eq("userId", "u1"));

        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn merge_into_replaces_top_level_fields_only() {
        let mut doc = json!({"title": "Draft", "meta": {"words": 10}});
        merge_into(&mut doc, json!({"meta": {"chars": 50}, "isPublic": true}));
        assert_eq!(
            doc,
            json!({"title": "Draft", "meta": {"chars": 50}, "isPublic": true})
        );
    }
}
