//! Subscription Throttle & Dedup Manager
//!
//! At most one live store subscription exists per dedup key, however many
//! callers listen. Each change is fanned out to every subscriber whose own
//! throttle interval has elapsed since its last delivery; other subscribers
//! drop the event (the next one carries current state anyway, so this suits
//! state replication, not append-only event streams).
//!
//! ```text
//! subscribe(key) ──first──→ factory(sink) → store subscription
//!        │ later                              │ change
//!        ↓                                    ↓
//!  register callback              fan out (per-subscriber throttle)
//!                                             │
//!                                             ↓
//!                               memory tier (RealTime) for seeding
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache_manager::{CacheManager, CacheStrategy};
use crate::error::Result;
use crate::single_flight::KeyedLocks;
use crate::store::{ChangeSink, StoreResult, StoreSubscription};

/// Callback receiving delivered values; a deleted document arrives as `Value::Null`
pub type SubscriberCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Minimum interval between two deliveries to one subscriber
///
/// Evaluated on every delivery, so the interval can follow caller context
/// (the entity being edited right now gets short intervals, background tabs
/// long ones).
pub trait ThrottlePolicy: Send + Sync {
    fn interval(&self) -> Duration;
}

impl<F> ThrottlePolicy for F
where
    F: Fn() -> Duration + Send + Sync,
{
    fn interval(&self) -> Duration {
        self()
    }
}

/// Constant interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedThrottle(pub Duration);

impl ThrottlePolicy for FixedThrottle {
    fn interval(&self) -> Duration {
        self.0
    }
}

/// Interval driven by user focus and recent activity
///
/// - focused on the observed entity: `focused`
/// - active within `active_window`: `active`
/// - otherwise: `idle`
#[derive(Debug)]
pub struct ActivityThrottle {
    pub focused: Duration,
    pub active: Duration,
    pub idle: Duration,
    pub active_window: Duration,
    is_focused: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl ActivityThrottle {
    #[must_use]
    pub fn new(focused: Duration, active: Duration, idle: Duration, active_window: Duration) -> Self {
        Self {
            focused,
            active,
            idle,
            active_window,
            is_focused: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Record user activity (keystroke, scroll, click)
    pub fn mark_active(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn set_focused(&self, focused: bool) {
        self.is_focused.store(focused, Ordering::Relaxed);
        if focused {
            self.mark_active();
        }
    }
}

impl Default for ActivityThrottle {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(250),
            Duration::from_secs(2),
            Duration::from_secs(30),
            Duration::from_secs(60),
        )
    }
}

impl ThrottlePolicy for ActivityThrottle {
    fn interval(&self) -> Duration {
        if self.is_focused.load(Ordering::Relaxed) {
            self.focused
        } else if self.last_activity.lock().elapsed() <= self.active_window {
            self.active
        } else {
            self.idle
        }
    }
}

struct Subscriber {
    callback: SubscriberCallback,
    policy: Arc<dyn ThrottlePolicy>,
    last_delivered: Option<Instant>,
}

/// All subscribers sharing one underlying store subscription
struct Registration {
    key: String,
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,
    latest: Mutex<Option<Value>>,
    underlying: Mutex<Option<Box<dyn StoreSubscription>>>,
}

impl Registration {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            subscribers: Mutex::new(HashMap::new()),
            latest: Mutex::new(None),
            underlying: Mutex::new(None),
        }
    }

    /// Fan a change out; returns how many subscribers received it
    fn deliver(&self, value: &Value) -> usize {
        *self.latest.lock() = Some(value.clone());

        let now = Instant::now();
        let due: Vec<SubscriberCallback> = {
            let mut subscribers = self.subscribers.lock();
            subscribers
                .values_mut()
                .filter(|s| {
                    s.last_delivered
                        .is_none_or(|last| now.duration_since(last) >= s.policy.interval())
                })
                .map(|s| {
                    s.last_delivered = Some(now);
                    Arc::clone(&s.callback)
                })
                .collect()
        };
        // Outside the lock: callbacks may unsubscribe
        for callback in &due {
            callback(value);
        }
        due.len()
    }

    fn teardown(&self) {
        if let Some(mut underlying) = self.underlying.lock().take() {
            underlying.cancel();
        }
    }
}

/// Subscription manager statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub underlying_created: u64,
    pub underlying_torn_down: u64,
    pub events_received: u64,
    pub deliveries: u64,
    pub throttled: u64,
}

#[derive(Default)]
struct AtomicSubscriptionStats {
    underlying_created: AtomicU64,
    underlying_torn_down: AtomicU64,
    events_received: AtomicU64,
    deliveries: AtomicU64,
    throttled: AtomicU64,
}

struct ManagerInner {
    registry: DashMap<String, Arc<Registration>>,
    /// Serializes creation of the underlying subscription per key
    creating: KeyedLocks,
    cache: Arc<CacheManager>,
    stats: AtomicSubscriptionStats,
}

impl ManagerInner {
    fn unsubscribe(&self, key: &str, id: Uuid) {
        // remove_if holds the shard lock, so no subscriber can attach in between
        let removed = self.registry.remove_if(key, |_, registration| {
            let mut subscribers = registration.subscribers.lock();
            subscribers.remove(&id);
            subscribers.is_empty()
        });
        if let Some((_, registration)) = removed {
            registration.teardown();
            self.stats
                .underlying_torn_down
                .fetch_add(1, Ordering::Relaxed);
            debug!(dedup_key = %key, "Last subscriber left, underlying subscription torn down");
        }
    }
}

/// Subscription Throttle & Dedup Manager
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
}

impl SubscriptionManager {
    #[must_use]
    pub fn new(cache: Arc<CacheManager>) -> Self {
        info!("Initializing subscription manager");
        Self {
            inner: Arc::new(ManagerInner {
                registry: DashMap::new(),
                creating: KeyedLocks::new(),
                cache,
                stats: AtomicSubscriptionStats::default(),
            }),
        }
    }

    /// Listen to changes under `dedup_key`
    ///
    /// The first subscriber's `factory` opens the underlying store
    /// subscription; later subscribers share it and their factories are never
    /// called. The callback is seeded right away with the latest known value
    /// (last event, else the cached entry under `dedup_key`).
    ///
    /// # Errors
    ///
    /// Propagates the factory's store error; nothing is registered then.
    pub async fn subscribe<F, Fut>(
        &self,
        dedup_key: &str,
        factory: F,
        callback: impl Fn(&Value) + Send + Sync + 'static,
        policy: Arc<dyn ThrottlePolicy>,
    ) -> Result<SubscriptionHandle>
    where
        F: FnOnce(ChangeSink) -> Fut + Send,
        Fut: Future<Output = StoreResult<Box<dyn StoreSubscription>>> + Send,
    {
        let id = Uuid::new_v4();
        let subscriber = Subscriber {
            callback: Arc::new(callback),
            policy,
            last_delivered: None,
        };

        let registration = {
            let _guard = self.inner.creating.lock(dedup_key).await;

            match self.attach(dedup_key, id, subscriber) {
                Ok(registration) => registration,
                Err(subscriber) => self.open(dedup_key, id, subscriber, factory).await?,
            }
        };

        self.seed(&registration, id).await;
        debug!(
            dedup_key = %dedup_key,
            subscribers = registration.subscribers.lock().len(),
            "Subscriber registered"
        );

        Ok(SubscriptionHandle {
            manager: Arc::downgrade(&self.inner),
            key: dedup_key.to_string(),
            id,
            active: true,
        })
    }

    /// Join an existing registration; hands the subscriber back if there is none
    ///
    /// Holding the registry shard while inserting keeps this atomic with the
    /// last unsubscribe removing the registration.
    fn attach(
        &self,
        dedup_key: &str,
        id: Uuid,
        subscriber: Subscriber,
    ) -> std::result::Result<Arc<Registration>, Subscriber> {
        match self.inner.registry.get(dedup_key) {
            Some(registration) => {
                registration.subscribers.lock().insert(id, subscriber);
                Ok(Arc::clone(&registration))
            }
            None => Err(subscriber),
        }
    }

    /// Create the registration and its single underlying subscription
    async fn open<F, Fut>(
        &self,
        dedup_key: &str,
        id: Uuid,
        subscriber: Subscriber,
        factory: F,
    ) -> Result<Arc<Registration>>
    where
        F: FnOnce(ChangeSink) -> Fut + Send,
        Fut: Future<Output = StoreResult<Box<dyn StoreSubscription>>> + Send,
    {
        let registration = Arc::new(Registration::new(dedup_key));
        registration.subscribers.lock().insert(id, subscriber);
        let sink = self.sink(Arc::downgrade(&registration));
        let underlying = factory(sink).await?;
        *registration.underlying.lock() = Some(underlying);
        self.inner
            .stats
            .underlying_created
            .fetch_add(1, Ordering::Relaxed);

        self.inner
            .registry
            .insert(dedup_key.to_string(), Arc::clone(&registration));
        info!(dedup_key = %dedup_key, "Opened underlying subscription");
        Ok(registration)
    }

    fn sink(&self, registration: Weak<Registration>) -> ChangeSink {
        let manager = Arc::downgrade(&self.inner);
        Arc::new(move |change: Option<Value>| {
            let (Some(registration), Some(manager)) = (registration.upgrade(), manager.upgrade())
            else {
                return;
            };
            let value = change.unwrap_or(Value::Null);
            manager.stats.events_received.fetch_add(1, Ordering::Relaxed);

            let subscribers = registration.subscribers.lock().len();
            let delivered = registration.deliver(&value);
            manager
                .stats
                .deliveries
                .fetch_add(delivered as u64, Ordering::Relaxed);
            manager
                .stats
                .throttled
                .fetch_add(subscribers.saturating_sub(delivered) as u64, Ordering::Relaxed);

            // Keep the latest value around for seeding later subscribers
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let cache = Arc::clone(&manager.cache);
                let key = registration.key.clone();
                handle.spawn(async move {
                    if let Err(e) = cache.set_memory_only(&key, &value, CacheStrategy::RealTime).await {
                        warn!(dedup_key = %key, error = %e, "Failed to cache subscription value");
                    }
                });
            }
        })
    }

    async fn seed(&self, registration: &Registration, id: Uuid) {
        let latest = registration.latest.lock().clone();
        let value = match latest {
            Some(value) => Some(value),
            None => self.inner.cache.get(&registration.key).await,
        };
        let Some(value) = value else {
            return;
        };

        // Skip callers that already received a live event
        let callback = registration
            .subscribers
            .lock()
            .get(&id)
            .filter(|s| s.last_delivered.is_none())
            .map(|s| Arc::clone(&s.callback));
        if let Some(callback) = callback {
            callback(&value);
        }
    }

    /// Number of live underlying subscriptions
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.inner.registry.len()
    }

    /// Number of callbacks registered under `dedup_key`
    #[must_use]
    pub fn subscriber_count(&self, dedup_key: &str) -> usize {
        self.inner
            .registry
            .get(dedup_key)
            .map_or(0, |registration| registration.subscribers.lock().len())
    }

    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        let stats = &self.inner.stats;
        SubscriptionStats {
            underlying_created: stats.underlying_created.load(Ordering::Relaxed),
            underlying_torn_down: stats.underlying_torn_down.load(Ordering::Relaxed),
            events_received: stats.events_received.load(Ordering::Relaxed),
            deliveries: stats.deliveries.load(Ordering::Relaxed),
            throttled: stats.throttled.load(Ordering::Relaxed),
        }
    }
}

/// Registration of one callback; unsubscribes on drop
pub struct SubscriptionHandle {
    manager: Weak<ManagerInner>,
    key: String,
    id: Uuid,
    active: bool,
}

impl SubscriptionHandle {
    #[must_use]
    pub fn dedup_key(&self) -> &str {
        &self.key
    }

    /// Remove this callback; the last one out tears the store subscription down
    /// before returning
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(manager) = self.manager.upgrade() {
            manager.unsubscribe(&self.key, self.id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_throttle_tracks_focus() {
        let throttle = ActivityThrottle::default();
        assert_eq!(throttle.interval(), throttle.active);

        throttle.set_focused(true);
        assert_eq!(throttle.interval(), throttle.focused);

        let idle = ActivityThrottle::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
            Duration::from_secs(5),
            Duration::ZERO,
        );
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(idle.interval(), Duration::from_secs(5));
    }

    #[test]
    fn closures_are_throttle_policies() {
        let policy: Arc<dyn ThrottlePolicy> = Arc::new(|| Duration::from_millis(42));
        assert_eq!(policy.interval(), Duration::from_millis(42));
    }

    #[test]
    fn per_subscriber_throttle_drops_early_events() {
        let registration = Registration::new("page:public:p1");
        let received = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&received);
        registration.subscribers.lock().insert(
            Uuid::new_v4(),
            Subscriber {
                callback: Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
                policy: Arc::new(FixedThrottle(Duration::from_secs(60))),
                last_delivered: None,
            },
        );

        assert_eq!(registration.deliver(&Value::from(1)), 1);
        assert_eq!(registration.deliver(&Value::from(2)), 0);
        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert_eq!(*registration.latest.lock(), Some(Value::from(2)));
    }
}
