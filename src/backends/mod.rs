//! Cache Backend Implementations
//!
//! # Available Backends
//!
//! ## Memory Tier
//! - **Moka** - High-performance concurrent cache with automatic eviction (default, feature `moka`)
//! - **`DashMap`** - Simple concurrent HashMap-based cache
//!
//! ## Persistent Tier
//! - **Redis** - Survives process restarts, longer TTLs (default, feature `redis`)
//! - **`DashMap`** - In-process stand-in for tests and single-process embedders
//!
//! # Usage
//!
//! ```rust,no_run
//! use scribe_cache::backends::{DashMapCache, MokaCache, RedisCache};
//! use scribe_cache::config::MemoryTierConfig;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let memory = MokaCache::new(&MemoryTierConfig::default());
//! let persistent = RedisCache::with_url("redis://127.0.0.1:6379", "scribe:").await?;
//! let in_process = DashMapCache::new();
//! # Ok(())
//! # }
//! ```

pub mod dashmap_cache;
#[cfg(feature = "moka")]
pub mod moka_cache;
#[cfg(feature = "redis")]
pub mod redis_cache;

pub use dashmap_cache::DashMapCache;
#[cfg(feature = "moka")]
pub use moka_cache::MokaCache;
#[cfg(feature = "redis")]
pub use redis_cache::RedisCache;

/// Per-backend statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub size: u64,
}
