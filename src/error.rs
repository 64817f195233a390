//! Error taxonomy
//!
//! Two layers of errors exist:
//! - [`StoreError`] is what a [`DocumentStore`](crate::store::DocumentStore) adapter reports.
//! - [`LayerError`] is what this crate surfaces to application code, and only when
//!   no safe default (cached value, zero, miss) exists.

use thiserror::Error;

/// Errors reported by the authoritative store adapter
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The addressed document does not exist
    #[error("document not found: {0}")]
    NotFound(String),

    /// Network, backend or timeout failure
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the operation (invalid path, precondition, quota)
    #[error("store rejected operation: {0}")]
    Rejected(String),
}

impl StoreError {
    /// `true` for the not-found class of errors
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Errors surfaced by the consistency layer
#[derive(Debug, Error)]
pub enum LayerError {
    /// Counter or cache entry absent where a fallback was impossible
    #[error("not found: {0}")]
    NotFound(String),

    /// The authoritative store could not be reached
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A coalesced batch write failed and was dropped
    #[error("batch write of {paths} path(s) failed: {reason}")]
    BatchFailure { paths: usize, reason: String },

    /// An increment raced a deletion of its counter record and could not be recreated
    #[error("counter {0} was deleted while being modified")]
    ConcurrentModificationRace(String),

    /// The store rejected a write or query
    #[error("store rejected operation: {0}")]
    Rejected(String),

    /// Value could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),

    /// Every cache tier failed the same operation
    #[error("cache tiers failed: {0}")]
    Cache(String),
}

impl From<StoreError> for LayerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(path) => Self::NotFound(path),
            StoreError::Unavailable(msg) => Self::StoreUnavailable(msg),
            StoreError::Rejected(msg) => Self::Rejected(msg),
        }
    }
}

impl From<serde_json::Error> for LayerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, LayerError>;
