//! Layer configuration
//!
//! Every knob has a sensible default; [`LayerConfig::from_env`] overlays
//! environment variables on top of those defaults:
//!
//! | Variable | Field |
//! |---|---|
//! | `SCRIBE_REDIS_URL` (fallback `REDIS_URL`) | `persistent_tier_url` |
//! | `SCRIBE_MEMORY_CAPACITY` | `memory.max_capacity` |
//! | `SCRIBE_BATCH_DEBOUNCE_MS` | `batch.debounce` |
//! | `SCRIBE_BATCH_MAX_DELAY_MS` | `batch.max_delay` |
//! | `SCRIBE_PROMOTION_TTL_CAP_MS` | `promotion_ttl_cap` |

use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Memory tier sizing
#[derive(Debug, Clone, Copy)]
pub struct MemoryTierConfig {
    /// Max number of entries
    pub max_capacity: u64,
    /// Hard upper bound on any entry's lifetime
    pub time_to_live: Duration,
    /// Entries untouched for this long are evicted
    pub time_to_idle: Duration,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            time_to_live: Duration::from_secs(3600),
            time_to_idle: Duration::from_secs(900),
        }
    }
}

/// TTL per cache category
///
/// List results go stale fastest (pagination cursors), content blobs change
/// rarely.
#[derive(Debug, Clone, Copy)]
pub struct TtlConfig {
    pub real_time: Duration,
    pub list_query: Duration,
    pub counter: Duration,
    pub metadata: Duration,
    pub content: Duration,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            real_time: Duration::from_secs(10),
            list_query: Duration::from_secs(120),
            counter: Duration::from_secs(300),
            metadata: Duration::from_secs(600),
            content: Duration::from_secs(3600),
        }
    }
}

/// Write coalescing queue timing
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    /// Quiet period after the last enqueue before a flush
    pub debounce: Duration,
    /// Oldest pending write never waits longer than this
    pub max_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Configuration of the whole consistency layer
#[derive(Debug, Clone)]
pub struct LayerConfig {
    pub memory: MemoryTierConfig,
    pub ttl: TtlConfig,
    /// Upper bound on the TTL of a value promoted from the persistent tier
    pub promotion_ttl_cap: Duration,
    pub batch: BatchConfig,
    /// Redis URL of the persistent tier; `None` keeps the tier in-process
    pub persistent_tier_url: Option<String>,
    /// Key prefix for entries in a shared persistent tier
    pub persistent_namespace: String,
    /// Documents fetched per page during a counter rebuild scan
    pub scan_page_size: usize,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            memory: MemoryTierConfig::default(),
            ttl: TtlConfig::default(),
            promotion_ttl_cap: Duration::from_secs(60),
            batch: BatchConfig::default(),
            persistent_tier_url: None,
            persistent_namespace: "scribe:".to_string(),
            scan_page_size: 500,
        }
    }
}

impl LayerConfig {
    /// Defaults overlaid with `SCRIBE_*` environment variables
    ///
    /// Malformed values are logged and ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self {
            persistent_tier_url: std::env::var("SCRIBE_REDIS_URL")
                .or_else(|_| std::env::var("REDIS_URL"))
                .ok()
                .filter(|url| !url.trim().is_empty()),
            ..Self::default()
        };

        if let Some(capacity) = env_parse::<u64>("SCRIBE_MEMORY_CAPACITY") {
            config.memory.max_capacity = capacity;
        }
        if let Some(ms) = env_parse::<u64>("SCRIBE_BATCH_DEBOUNCE_MS") {
            config.batch.debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("SCRIBE_BATCH_MAX_DELAY_MS") {
            config.batch.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("SCRIBE_PROMOTION_TTL_CAP_MS") {
            config.promotion_ttl_cap = Duration::from_millis(ms);
        }

        config
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = %name, value = %raw, "Ignoring malformed configuration value");
            None
        }
    }
}

/// Install a `tracing` subscriber honouring `RUST_LOG`
///
/// Defaults to `scribe_cache=info`. Safe to call more than once; later calls
/// are no-ops.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("scribe_cache=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_results_expire_before_content() {
        let ttl = TtlConfig::default();
        assert!(ttl.real_time < ttl.list_query);
        assert!(ttl.list_query < ttl.metadata);
        assert!(ttl.metadata < ttl.content);
    }

    #[test]
    fn promotion_cap_is_shorter_than_persistent_ttls() {
        let config = LayerConfig::default();
        assert!(config.promotion_ttl_cap < config.ttl.list_query);
    }
}
