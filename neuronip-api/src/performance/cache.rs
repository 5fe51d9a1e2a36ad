//! In-memory TTL cache with LRU eviction and pattern invalidation.
//!
//! Entries expire `ttl` after insertion. Expired entries are reported as
//! missing by [`TtlCache::get`] but are only removed by the sweep pass, which
//! runs in the background once [`TtlCache::start`] is called. When the cache
//! is full, inserting a new key evicts the least recently accessed entry.
//!
//! # Examples
//!
//! ```no_run
//! use neuronip_api::performance::cache::{CacheConfig, TtlCache};
//! use neuronip_core::Context;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CacheConfig::builder()
//!         .default_ttl(Duration::from_secs(300))
//!         .max_size(1000)
//!         .build()
//!         .unwrap();
//!
//!     let cache = TtlCache::<String>::new(config);
//!     cache.start(&Context::background());
//!
//!     cache.set("catalog:datasets", "cached".to_string()).await.unwrap();
//!     assert!(cache.get("catalog:datasets").await.is_some());
//!
//!     cache.stop().await;
//! }
//! ```

use metrics::counter;
use neuronip_core::{matches_affix, system_clock, Context, ContextError, PeriodicTask, SharedClock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Upper bound applied to every TTL.
const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Errors that can occur during cache operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Invalid cache configuration: {0}")]
    ConfigurationError(String),

    #[error("Cache warm-up interrupted: {0}")]
    Canceled(#[from] ContextError),
}

/// Configuration for the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied when the caller does not supply one.
    pub default_ttl: Duration,

    /// Maximum number of entries held at once.
    pub max_size: usize,

    /// Sweep period; defaults to half the default TTL.
    pub cleanup_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300), // 5 minutes
            max_size: 1000,
            cleanup_interval: None,
        }
    }
}

impl CacheConfig {
    /// Creates a new CacheConfigBuilder.
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::new()
    }

    /// Period of the background expiry sweep.
    pub fn sweep_interval(&self) -> Duration {
        self.cleanup_interval.unwrap_or(self.default_ttl / 2)
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.max_size == 0 {
            return Err(CacheError::ConfigurationError(
                "max_size must be greater than 0".to_string(),
            ));
        }
        if self.default_ttl.is_zero() {
            return Err(CacheError::ConfigurationError(
                "default_ttl must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for creating CacheConfig instances.
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    default_ttl: Option<Duration>,
    max_size: Option<usize>,
    cleanup_interval: Option<Duration>,
}

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn max_size(mut self, max: usize) -> Self {
        self.max_size = Some(max);
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Builds the CacheConfig.
    pub fn build(self) -> Result<CacheConfig, CacheError> {
        let default = CacheConfig::default();
        let config = CacheConfig {
            default_ttl: self.default_ttl.unwrap_or(default.default_ttl),
            max_size: self.max_size.unwrap_or(default.max_size),
            cleanup_interval: self.cleanup_interval,
        };
        config.validate()?;
        Ok(config)
    }
}

/// A cached value with metadata.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    expires_at: Instant,
    last_accessed: Instant,
    access_count: u64,
    /// Monotonic touch order, breaks ties between equal `last_accessed`.
    touched: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

#[derive(Debug)]
struct Store<V> {
    entries: HashMap<String, CacheEntry<V>>,
    touches: u64,
}

impl<V> Store<V> {
    fn next_touch(&mut self) -> u64 {
        self.touches += 1;
        self.touches
    }

    fn lru_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| (entry.last_accessed, entry.touched))
            .map(|(key, _)| key.clone())
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_items: usize,
    pub expired_items: usize,
    pub active_items: usize,
    pub max_size: usize,
    pub usage_percent: f64,
    pub total_accesses: u64,
    /// Entries removed to make room for new keys.
    pub evictions: u64,
    /// Entries removed by the sweep pass.
    pub expirations: u64,
}

/// Result of [`cached`], reporting whether the value came from the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResult<T> {
    pub value: T,
    pub was_cached: bool,
}

/// TTL + LRU cache keyed by string.
pub struct TtlCache<V> {
    config: CacheConfig,
    clock: SharedClock,
    store: Arc<RwLock<Store<V>>>,
    evictions: Arc<AtomicU64>,
    expirations: Arc<AtomicU64>,
    sweeper: parking_lot::Mutex<Option<PeriodicTask>>,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache on the system clock.
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Creates a cache reading time from `clock`.
    pub fn with_clock(config: CacheConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            store: Arc::new(RwLock::new(Store {
                entries: HashMap::new(),
                touches: 0,
            })),
            evictions: Arc::new(AtomicU64::new(0)),
            expirations: Arc::new(AtomicU64::new(0)),
            sweeper: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Start the background expiry sweep. No-op if it is already running.
    pub fn start(&self, ctx: &Context) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_some_and(PeriodicTask::is_running) {
            return;
        }

        let store = self.store.clone();
        let clock = self.clock.clone();
        let expirations = self.expirations.clone();

        *sweeper = Some(PeriodicTask::spawn(
            ctx,
            "cache-sweep",
            self.config.sweep_interval(),
            move || {
                let store = store.clone();
                let clock = clock.clone();
                let expirations = expirations.clone();
                async move {
                    let removed = sweep(&store, clock.now(), &expirations).await;
                    if removed > 0 {
                        debug!(removed, "cache sweep removed expired entries");
                    }
                }
            },
        ));
    }

    /// Stop the background sweep and wait for it to exit.
    pub async fn stop(&self) {
        let task = self.sweeper.lock().take();
        if let Some(mut task) = task {
            task.stop().await;
            info!("cache sweep stopped");
        }
    }

    /// Look up a live entry, recording the access.
    ///
    /// Expired entries report `None` but stay in place until the next sweep.
    pub async fn get(&self, key: &str) -> Option<V> {
        let mut store = self.store.write().await;
        let touch = store.next_touch();
        let now = self.clock.now();

        let entry = store.entries.get_mut(key)?;
        if entry.is_expired(now) {
            return None;
        }

        entry.access_count += 1;
        entry.last_accessed = now;
        entry.touched = touch;
        Some(entry.value.clone())
    }

    /// Insert with the default TTL.
    pub async fn set(&self, key: impl Into<String>, value: V) -> Result<(), CacheError> {
        self.set_with_ttl(key, value, self.config.default_ttl).await
    }

    /// Insert with an explicit TTL. A zero TTL falls back to the default.
    pub async fn set_with_ttl(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = key.into();
        if key.is_empty() {
            return Err(CacheError::InvalidKey("key must not be empty".to_string()));
        }

        let ttl = if ttl.is_zero() { self.config.default_ttl } else { ttl };
        let ttl = ttl.min(MAX_TTL);

        let mut store = self.store.write().await;
        if store.entries.len() >= self.config.max_size && !store.entries.contains_key(&key) {
            if let Some(victim) = store.lru_key() {
                store.entries.remove(&victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                counter!("cache_evictions_total").increment(1);
                debug!(key = %victim, "evicted least recently used cache entry");
            }
        }

        let now = self.clock.now();
        let touched = store.next_touch();
        store.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                expires_at: now + ttl,
                last_accessed: now,
                access_count: 0,
                touched,
            },
        );
        Ok(())
    }

    /// Remove a key. Returns the value if it was present.
    pub async fn delete(&self, key: &str) -> Option<V> {
        self.store.write().await.entries.remove(key).map(|entry| entry.value)
    }

    /// Remove every entry.
    pub async fn clear(&self) {
        self.store.write().await.entries.clear();
    }

    /// Remove every key that equals `pattern`, starts with it, or ends with
    /// it. A pattern occurring only in the middle of a key does not match.
    /// Returns the number of keys removed.
    pub async fn invalidate_by_pattern(&self, pattern: &str) -> usize {
        let mut store = self.store.write().await;
        let before = store.entries.len();
        store.entries.retain(|key, _| !matches_affix(key, pattern));
        let removed = before - store.entries.len();

        debug!(pattern, removed, "invalidated cache entries by pattern");
        removed
    }

    /// Insert every item with `ttl`, stopping at the first error or as soon
    /// as `ctx` ends.
    pub async fn warm_cache<I, K>(&self, ctx: &Context, items: I, ttl: Duration) -> Result<(), CacheError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
    {
        let mut warmed = 0usize;
        for (key, value) in items {
            if let Some(err) = ctx.err() {
                return Err(CacheError::Canceled(err));
            }
            self.set_with_ttl(key, value, ttl).await?;
            warmed += 1;
        }

        info!(warmed, "cache warmed");
        Ok(())
    }

    /// Run one expiry sweep now. Returns the number of entries removed.
    pub async fn sweep_expired(&self) -> usize {
        sweep(&self.store, self.clock.now(), &self.expirations).await
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        let store = self.store.read().await;
        let now = self.clock.now();

        let total_items = store.entries.len();
        let expired_items = store
            .entries
            .values()
            .filter(|entry| entry.is_expired(now))
            .count();
        let total_accesses = store.entries.values().map(|entry| entry.access_count).sum();

        CacheStats {
            total_items,
            expired_items,
            active_items: total_items - expired_items,
            max_size: self.config.max_size,
            usage_percent: total_items as f64 / self.config.max_size as f64 * 100.0,
            total_accesses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Age of a live entry, if present.
    pub async fn age(&self, key: &str) -> Option<Duration> {
        let store = self.store.read().await;
        let now = self.clock.now();
        store
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| now.duration_since(entry.created_at))
    }
}

async fn sweep<V>(store: &RwLock<Store<V>>, now: Instant, expirations: &AtomicU64) -> usize {
    let mut store = store.write().await;
    let before = store.entries.len();
    store.entries.retain(|_, entry| entry.expires_at > now);
    let removed = before - store.entries.len();

    if removed > 0 {
        expirations.fetch_add(removed as u64, Ordering::Relaxed);
        counter!("cache_expirations_total").increment(removed as u64);
    }
    removed
}

/// Return the cached value for `key`, or compute it with `fetch` and cache
/// it with the default TTL.
pub async fn cached<V, F, Fut, E>(cache: &TtlCache<V>, key: &str, fetch: F) -> Result<CachedResult<V>, E>
where
    V: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>>,
    E: From<CacheError>,
{
    if let Some(value) = cache.get(key).await {
        return Ok(CachedResult {
            value,
            was_cached: true,
        });
    }

    let value = fetch().await?;
    cache.set(key, value.clone()).await?;

    Ok(CachedResult {
        value,
        was_cached: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use neuronip_core::ManualClock;
    use pretty_assertions::assert_eq;
    use tokio::time::sleep;

    fn manual_cache(max_size: usize, ttl: Duration) -> (TtlCache<i32>, Arc<ManualClock>) {
        let clock = ManualClock::shared();
        let config = CacheConfig::builder()
            .default_ttl(ttl)
            .max_size(max_size)
            .build()
            .unwrap();
        (TtlCache::with_clock(config, clock.clone()), clock)
    }

    #[test]
    fn test_cache_config_default() {
        let config = CacheConfig::default();
        assert_eq!(config.default_ttl, Duration::from_secs(300));
        assert_eq!(config.max_size, 1000);
        assert_eq!(config.sweep_interval(), Duration::from_secs(150));
    }

    #[test]
    fn test_cache_config_builder_validation() {
        assert!(CacheConfig::builder().max_size(0).build().is_err());
        assert!(CacheConfig::builder().default_ttl(Duration::ZERO).build().is_err());

        let config = CacheConfig::builder()
            .cleanup_interval(Duration::from_secs(5))
            .build()
            .unwrap();
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (cache, _clock) = manual_cache(10, Duration::from_secs(60));

        cache.set("key1", 1).await.unwrap();
        assert_eq!(cache.get("key1").await, Some(1));
        assert_eq!(cache.get("missing").await, None);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_accessed() {
        let (cache, clock) = manual_cache(2, Duration::from_secs(60));

        cache.set("a", 1).await.unwrap();
        clock.advance(Duration::from_millis(1));
        cache.set("b", 2).await.unwrap();
        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get("a").await, Some(1));
        clock.advance(Duration::from_millis(1));
        cache.set("c", 3).await.unwrap();

        assert_eq!(cache.get("b").await, None);
        assert_eq!(cache.get("a").await, Some(1));
        assert_eq!(cache.get("c").await, Some(3));
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_lru_ties_fall_back_to_touch_order() {
        // Clock never moves, so every timestamp is equal.
        let (cache, _clock) = manual_cache(2, Duration::from_secs(60));

        cache.set("a", 1).await.unwrap();
        cache.set("b", 2).await.unwrap();
        cache.get("a").await;
        cache.set("c", 3).await.unwrap();

        assert_eq!(cache.get("b").await, None);
        assert_eq!(cache.get("a").await, Some(1));
    }

    #[tokio::test]
    async fn test_overwrite_at_capacity_does_not_evict() {
        let (cache, _clock) = manual_cache(2, Duration::from_secs(60));

        cache.set("a", 1).await.unwrap();
        cache.set("b", 2).await.unwrap();
        cache.set("a", 10).await.unwrap();

        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get("a").await, Some(10));
        assert_eq!(cache.get("b").await, Some(2));
    }

    #[tokio::test]
    async fn test_expired_entries_hidden_until_swept() {
        let (cache, clock) = manual_cache(10, Duration::from_secs(60));

        cache.set_with_ttl("k", 7, Duration::from_millis(10)).await.unwrap();
        assert_eq!(cache.get("k").await, Some(7));

        clock.advance(Duration::from_millis(11));
        assert_eq!(cache.get("k").await, None);

        let stats = cache.stats().await;
        assert_eq!(stats.total_items, 1);
        assert_eq!(stats.expired_items, 1);
        assert_eq!(stats.active_items, 0);

        assert_eq!(cache.sweep_expired().await, 1);
        assert!(cache.is_empty().await);
        assert_eq!(cache.stats().await.expirations, 1);
    }

    #[tokio::test]
    async fn test_background_sweep_removes_expired_entries() {
        let config = CacheConfig::builder()
            .default_ttl(Duration::from_millis(20))
            .build()
            .unwrap();
        let cache = TtlCache::new(config);
        cache.start(&Context::background());

        cache.set_with_ttl("k", "v".to_string(), Duration::from_millis(10)).await.unwrap();
        assert_eq!(cache.get("k").await, Some("v".to_string()));

        sleep(Duration::from_millis(60)).await;

        assert_eq!(cache.get("k").await, None);
        assert_eq!(cache.len().await, 0);

        cache.stop().await;
        cache.stop().await;
    }

    #[tokio::test]
    async fn test_zero_ttl_uses_default() {
        let (cache, clock) = manual_cache(10, Duration::from_secs(60));

        cache.set_with_ttl("k", 1, Duration::ZERO).await.unwrap();
        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.get("k").await, Some(1));
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let (cache, _clock) = manual_cache(10, Duration::from_secs(60));
        assert!(matches!(cache.set("", 1).await, Err(CacheError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_invalidate_by_pattern_prefix_suffix_exact() {
        let (cache, _clock) = manual_cache(10, Duration::from_secs(60));

        cache.set("user:1", 1).await.unwrap();
        cache.set("1:session", 2).await.unwrap();
        cache.set("order:1:x", 3).await.unwrap();
        cache.set("1", 4).await.unwrap();

        // "user:1" (suffix), "1:session" (prefix) and "1" (exact) go;
        // "order:1:x" only contains the pattern in the middle and stays.
        assert_eq!(cache.invalidate_by_pattern("1").await, 3);
        assert_eq!(cache.get("order:1:x").await, Some(3));
        assert_eq!(cache.get("user:1").await, None);
        assert_eq!(cache.get("1:session").await, None);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let (cache, _clock) = manual_cache(10, Duration::from_secs(60));

        cache.set("a", 1).await.unwrap();
        cache.set("b", 2).await.unwrap();

        assert_eq!(cache.delete("a").await, Some(1));
        assert_eq!(cache.delete("a").await, None);

        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_warm_cache_inserts_all_items() {
        let (cache, _clock) = manual_cache(10, Duration::from_secs(60));

        cache
            .warm_cache(
                &Context::background(),
                vec![("a", 1), ("b", 2), ("c", 3)],
                Duration::from_secs(30),
            )
            .await
            .unwrap();

        assert_eq!(cache.len().await, 3);
    }

    #[tokio::test]
    async fn test_warm_cache_aborts_on_cancel() {
        let (cache, _clock) = manual_cache(10, Duration::from_secs(60));
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();

        let result = cache
            .warm_cache(&ctx, vec![("a", 1), ("b", 2)], Duration::from_secs(30))
            .await;

        assert_eq!(result, Err(CacheError::Canceled(ContextError::Canceled)));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_warm_cache_aborts_on_first_set_error() {
        let (cache, _clock) = manual_cache(10, Duration::from_secs(60));

        let result = cache
            .warm_cache(
                &Context::background(),
                vec![("a", 1), ("", 2), ("c", 3)],
                Duration::from_secs(30),
            )
            .await;

        assert!(matches!(result, Err(CacheError::InvalidKey(_))));
        assert_eq!(cache.get("a").await, Some(1));
        assert_eq!(cache.get("c").await, None);
    }

    #[tokio::test]
    async fn test_stats_track_accesses_and_usage() {
        let (cache, _clock) = manual_cache(4, Duration::from_secs(60));

        cache.set("a", 1).await.unwrap();
        cache.set("b", 2).await.unwrap();
        cache.get("a").await;
        cache.get("a").await;
        cache.get("b").await;
        cache.get("missing").await;

        let stats = cache.stats().await;
        assert_eq!(stats.total_items, 2);
        assert_eq!(stats.active_items, 2);
        assert_eq!(stats.total_accesses, 3);
        assert_eq!(stats.max_size, 4);
        assert!((stats.usage_percent - 50.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_cached_fetches_once() {
        let (cache, _clock) = manual_cache(10, Duration::from_secs(60));
        let fetches = AtomicU64::new(0);

        let first = cached(&cache, "answer", || async {
            fetches.fetch_add(1, Ordering::Relaxed);
            Ok::<_, CacheError>(42)
        })
        .await
        .unwrap();
        assert!(!first.was_cached);

        let second = cached(&cache, "answer", || async {
            fetches.fetch_add(1, Ordering::Relaxed);
            Ok::<_, CacheError>(0)
        })
        .await
        .unwrap();

        assert!(second.was_cached);
        assert_eq!(second.value, 42);
        assert_eq!(fetches.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_age_reports_time_since_insert() {
        let (cache, clock) = manual_cache(10, Duration::from_secs(60));

        cache.set("a", 1).await.unwrap();
        clock.advance(Duration::from_secs(3));

        assert_eq!(cache.age("a").await, Some(Duration::from_secs(3)));
        assert_eq!(cache.age("missing").await, None);
    }
}
