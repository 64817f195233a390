//! Cache Backend Traits
//!
//! Trait abstractions for the two cache tiers and the value codec.
//!
//! # Architecture
//!
//! - `CacheCodec`: Trait for pluggable serialization backends
//! - `CacheBackend`: Core trait for both tiers (memory and persistent)
//! - `PersistentCacheBackend`: Extended trait for the persistent tier with TTL introspection
//!
//! # Example: Custom Persistent Tier
//!
//! ```rust,ignore
//! use scribe_cache::{CacheBackend, PersistentCacheBackend, async_trait};
//! use std::time::Duration;
//! use anyhow::Result;
//!
//! struct SessionStorage {
//!     // Your implementation
//! }
//!
//! #[async_trait]
//! impl CacheBackend for SessionStorage {
//!     async fn get(&self, key: &str) -> Option<Vec<u8>> { todo!() }
//!     async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> { todo!() }
//!     async fn remove(&self, key: &str) -> Result<()> { todo!() }
//!     async fn remove_prefix(&self, prefix: &str) -> Result<usize> { todo!() }
//!     async fn health_check(&self) -> bool { todo!() }
//! }
//!
//! #[async_trait]
//! impl PersistentCacheBackend for SessionStorage {
//!     async fn get_with_ttl(&self, key: &str) -> Option<(Vec<u8>, Option<Duration>)> { todo!() }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::time::Duration;

/// Trait for cache value serialization/deserialization
///
/// Cache tiers store opaque bytes; the codec is the boundary between those
/// bytes and `serde` types.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync + Debug` to support concurrent access across async tasks.
pub trait CacheCodec: Send + Sync + Debug {
    /// Serialize a value to bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented by this codec.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize bytes to a value
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not a valid encoding of `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    /// Get the name of the codec, used for logging
    fn name(&self) -> &'static str;
}

/// Core cache backend trait for both tiers
///
/// # Required Operations
///
/// - `get`: Retrieve a value by key, `None` when absent or expired
/// - `set_with_ttl`: Store a value with a time-to-live
/// - `remove`: Delete a value by key
/// - `remove_prefix`: Delete every key starting with a prefix
/// - `health_check`: Verify the backend is operational
///
/// # Failure Semantics
///
/// Errors returned here never reach application code: the
/// [`CacheManager`](crate::CacheManager) logs them and treats the tier as a miss.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get value from cache by key
    ///
    /// # Returns
    ///
    /// * `Some(value)` - Value found in cache (as bytes)
    /// * `None` - Key not found or expired
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Set value in cache with time-to-live
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not store the value.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Remove value from cache (succeeds when the key didn't exist)
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be reached.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Remove every key that starts with `prefix`
    ///
    /// # Returns
    ///
    /// Number of keys removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend could not be reached.
    async fn remove_prefix(&self, prefix: &str) -> Result<usize>;

    /// Check if cache backend is healthy
    async fn health_check(&self) -> bool;

    /// Get the name of this cache backend (e.g., "Moka", "Redis", "`DashMap`")
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Extended trait for the persistent tier with TTL introspection
///
/// Promotion into the memory tier needs the remaining lifetime of the
/// persistent entry: a promoted value must never outlive its source.
#[async_trait]
pub trait PersistentCacheBackend: CacheBackend {
    /// Get value with its remaining TTL
    ///
    /// # Returns
    ///
    /// * `Some((value, Some(ttl)))` - Value found with remaining TTL
    /// * `Some((value, None))` - Value found but no expiration set
    /// * `None` - Key not found or expired
    async fn get_with_ttl(&self, key: &str) -> Option<(Vec<u8>, Option<Duration>)>;
}
