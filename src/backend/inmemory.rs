//! In-memory cache-and-queue backend (default, thread-safe, async).
//!
//! Uses DashMap for concurrent access with per-key sharding.
//! Expired entries are removed lazily when they are next read; there is no
//! background sweep.

use super::memqueue::{QueueRegistry, QueueSettings, StreamState};
use super::CacheBackend;
use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::key::KeyBuilder;
use crate::lock::LockOptions;
use crate::message::Message;
use crate::observability::{CacheMetrics, NoOpMetrics};
use crate::signal::ShutdownSignal;
use crate::value::CacheValue;
use dashmap::DashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Environment variable overriding [`MemoryConfig::pool_num`].
pub const POOL_NUM_ENV: &str = "CACHE_QUEUE_POOL_NUM";
/// Environment variable overriding [`MemoryConfig::max_deliveries`].
pub const MAX_DELIVERIES_ENV: &str = "CACHE_QUEUE_MAX_DELIVERIES";

/// Stored value with optional expiration.
///
/// Entries are immutable once stored; updates swap in a new `Arc`, which lets
/// eviction compare against the exact entry it found to be stale.
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    /// A TTL too large to represent as an `Instant` never expires.
    fn new(value: String, ttl: Option<Duration>) -> Self {
        let expires_at = ttl.and_then(|d| Instant::now().checked_add(d));
        Entry { value, expires_at }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }
}

/// Configuration for the in-memory backend's queues.
#[derive(Clone, Debug, Default)]
pub struct MemoryConfig {
    /// Per-stream channel capacity. `0` means unbounded.
    pub pool_num: usize,
    /// Deliveries attempted before a failing message is dropped.
    /// `None` redelivers forever.
    pub max_deliveries: Option<u32>,
}

impl MemoryConfig {
    /// Build from `CACHE_QUEUE_POOL_NUM` and `CACHE_QUEUE_MAX_DELIVERIES`,
    /// falling back to defaults for unset variables.
    ///
    /// # Errors
    /// Returns `Error::ConfigError` if a variable is set but not a number.
    pub fn from_env() -> Result<Self> {
        let mut config = MemoryConfig::default();

        if let Ok(raw) = std::env::var(POOL_NUM_ENV) {
            config.pool_num = raw
                .trim()
                .parse()
                .map_err(|e| Error::ConfigError(format!("{}={}: {}", POOL_NUM_ENV, raw, e)))?;
        }
        if let Ok(raw) = std::env::var(MAX_DELIVERIES_ENV) {
            let max: u32 = raw.trim().parse().map_err(|e| {
                Error::ConfigError(format!("{}={}: {}", MAX_DELIVERIES_ENV, raw, e))
            })?;
            config.max_deliveries = Some(max);
        }

        Ok(config)
    }

    pub fn with_pool_num(mut self, pool_num: usize) -> Self {
        self.pool_num = pool_num;
        self
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = Some(max);
        self
    }
}

/// Thread-safe async in-memory backend.
///
/// Holds the item store and the stream registry. Clones share both; each
/// clone keeps its own key prefix.
///
/// # Example
///
/// ```no_run
/// use cache_queue::backend::{CacheBackend, InMemoryBackend};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let backend = InMemoryBackend::new();
///
///     backend.set("ctr", 10, 60).await?;
///     backend.increase("ctr").await?;
///     assert_eq!(backend.get("ctr").await?, "11");
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct InMemoryBackend {
    items: Arc<DashMap<String, Arc<Entry>>>,
    queues: QueueRegistry,
    prefix: String,
    signal: ShutdownSignal,
    metrics: Arc<dyn CacheMetrics>,
}

impl InMemoryBackend {
    /// Create a backend with unbounded streams and unlimited redelivery.
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    pub fn with_config(config: MemoryConfig) -> Self {
        InMemoryBackend {
            items: Arc::new(DashMap::new()),
            queues: QueueRegistry::new(QueueSettings {
                capacity: config.pool_num,
                max_deliveries: config.max_deliveries,
            }),
            prefix: String::new(),
            signal: ShutdownSignal::new(),
            metrics: Arc::new(NoOpMetrics),
        }
    }

    /// Use an externally owned shutdown signal.
    pub fn with_signal(mut self, signal: ShutdownSignal) -> Self {
        self.signal = signal;
        self
    }

    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// The signal `run` waits on.
    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }

    /// State of a stream, or `None` if it was never used.
    pub fn stream_state(&self, stream: &str) -> Option<StreamState> {
        self.queues.state(stream)
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Get memory statistics.
    pub fn stats(&self) -> CacheStats {
        let total_bytes: usize = self.items.iter().map(|entry| entry.value.len()).sum();
        let expired_count = self.items.iter().filter(|entry| entry.is_expired()).count();

        CacheStats {
            total_entries: self.items.len(),
            expired_entries: expired_count,
            total_bytes,
        }
    }

    /// Print cache statistics to debug log.
    pub fn log_stats(&self) {
        let stats = self.stats();
        debug!(
            "Cache Stats: {} entries ({} expired), {} bytes",
            stats.total_entries, stats.expired_entries, stats.total_bytes
        );
    }

    fn key(&self, key: &str) -> String {
        KeyBuilder::namespaced(&self.prefix, key)
    }

    /// Remove `key` only if it still maps to `stale`.
    ///
    /// A `set` that lands between the expiry check and this call replaces the
    /// `Arc`, so the pointer comparison fails and the new entry survives.
    fn evict(&self, key: &str, stale: &Arc<Entry>) {
        if self
            .items
            .remove_if(key, |_, current| Arc::ptr_eq(current, stale))
            .is_some()
        {
            debug!("✓ InMemory EVICT {} (expired)", key);
        }
    }

    fn read(&self, key: &str) -> Result<String> {
        let start = Instant::now();
        // Clone the Arc so the shard lock is released before any eviction.
        let entry = self.items.get(key).map(|e| Arc::clone(e.value()));

        match entry {
            Some(entry) if !entry.is_expired() => {
                debug!("✓ InMemory GET {} -> HIT", key);
                self.metrics.record_hit(key, start.elapsed());
                Ok(entry.value.clone())
            }
            Some(stale) => {
                self.evict(key, &stale);
                debug!("✓ InMemory GET {} -> MISS (expired)", key);
                self.metrics.record_miss(key, start.elapsed());
                Err(Error::NotFound(key.to_string()))
            }
            None => {
                debug!("✓ InMemory GET {} -> MISS", key);
                self.metrics.record_miss(key, start.elapsed());
                Err(Error::NotFound(key.to_string()))
            }
        }
    }

    fn remove(&self, key: &str) {
        let start = Instant::now();
        self.items.remove(key);
        debug!("✓ InMemory DELETE {}", key);
        self.metrics.record_delete(key, start.elapsed());
    }

    /// Replace a live entry under its shard's write lock.
    ///
    /// The lock is held across read, compute and write, so concurrent updates
    /// of the same key are serialized and none is lost.
    fn update<F>(&self, key: &str, f: F) -> Result<()>
    where
        F: FnOnce(&Entry) -> Result<Entry>,
    {
        let stale = match self.items.get_mut(key) {
            None => return Err(Error::NotExist(key.to_string())),
            Some(mut slot) => {
                if !slot.is_expired() {
                    let next = f(&**slot)?;
                    *slot = Arc::new(next);
                    return Ok(());
                }
                Arc::clone(&*slot)
            }
        };

        self.evict(key, &stale);
        Err(Error::NotExist(key.to_string()))
    }

    fn calculate(&self, key: &str, delta: i64) -> Result<()> {
        let key = self.key(key);
        let result = self.update(&key, |entry| {
            let current: i64 = entry.value.trim().parse().map_err(|_| {
                Error::TypeError(format!("value of {} is not an integer", key))
            })?;
            let next = current.checked_add(delta).ok_or_else(|| {
                Error::TypeError(format!("value of {} would overflow", key))
            })?;
            Ok(Entry {
                value: next.to_string(),
                expires_at: entry.expires_at,
            })
        });

        match &result {
            Ok(()) => debug!("✓ InMemory INCRBY {} {}", key, delta),
            Err(e) => self.metrics.record_error(&key, &e.to_string()),
        }
        result
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheBackend for InMemoryBackend {
    type Lock = Infallible;

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&mut self) -> Result<()> {
        info!("✓ InMemory backend ready");
        Ok(())
    }

    fn set_prefix(&mut self, prefix: &str) {
        self.prefix = prefix.to_string();
    }

    async fn get(&self, key: &str) -> Result<String> {
        self.read(&self.key(key))
    }

    async fn set<V>(&self, key: &str, value: V, ttl_seconds: u64) -> Result<()>
    where
        V: Into<CacheValue> + Send,
    {
        let start = Instant::now();
        let key = self.key(key);
        let value: CacheValue = value.into();
        let value = value.into_encoded().map_err(|e| {
            self.metrics.record_error(&key, &e.to_string());
            e
        })?;

        let ttl = (ttl_seconds > 0).then(|| Duration::from_secs(ttl_seconds));
        self.items.insert(key.clone(), Arc::new(Entry::new(value, ttl)));

        if let Some(d) = ttl {
            debug!("✓ InMemory SET {} (TTL: {:?})", key, d);
        } else {
            debug!("✓ InMemory SET {}", key);
        }
        self.metrics.record_set(&key, start.elapsed());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.remove(&self.key(key));
        Ok(())
    }

    async fn hash_get(&self, hash: &str, field: &str) -> Result<String> {
        self.read(&self.key(&KeyBuilder::hash_field(hash, field)))
    }

    async fn hash_del(&self, hash: &str, field: &str) -> Result<()> {
        self.remove(&self.key(&KeyBuilder::hash_field(hash, field)));
        Ok(())
    }

    async fn increase(&self, key: &str) -> Result<()> {
        self.calculate(key, 1)
    }

    async fn decrease(&self, key: &str) -> Result<()> {
        self.calculate(key, -1)
    }

    async fn expire(&self, key: &str, duration: Duration) -> Result<()> {
        let key = self.key(key);
        self.update(&key, |entry| {
            Ok(Entry::new(entry.value.clone(), Some(duration)))
        })?;
        debug!("✓ InMemory EXPIRE {} (TTL: {:?})", key, duration);
        Ok(())
    }

    async fn append(&self, message: Message) -> Result<()> {
        self.queues.append(&message, &self.signal).map(|_| ())
    }

    async fn register<C: Consumer>(&self, stream: &str, consumer: C) {
        self.queues.register(
            stream,
            Arc::new(consumer),
            self.signal.clone(),
            Arc::clone(&self.metrics),
        );
    }

    async fn run(&self) {
        self.signal.wait().await;
    }

    async fn shutdown(&self) {
        if self.signal.trigger() {
            info!("✓ InMemory shutdown requested");
        }
        self.queues.close_idle().await;
    }

    async fn lock(
        &self,
        key: &str,
        _ttl_seconds: u64,
        _options: Option<LockOptions>,
    ) -> Result<Self::Lock> {
        Err(Error::UnsupportedOperation(format!(
            "memory backend does not support lock ({})",
            key
        )))
    }
}

/// Cache statistics.
#[derive(Clone, Debug)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub total_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_backend_set_get() {
        let backend = InMemoryBackend::new();

        backend.set("key1", "value1", 60).await.expect("Failed to set");

        let result = backend.get("key1").await.expect("Failed to get");
        assert_eq!(result, "value1");
    }

    #[tokio::test]
    async fn test_inmemory_backend_miss() {
        let backend = InMemoryBackend::new();

        let result = backend.get("nonexistent").await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_inmemory_backend_set_rejects_invalid_bytes() {
        let backend = InMemoryBackend::new();

        let result = backend.set("bin", vec![0xc3, 0x28], 60).await;
        assert!(matches!(result, Err(Error::EncodingError(_))));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_inmemory_backend_delete_idempotent() {
        let backend = InMemoryBackend::new();

        backend.set("key1", "value1", 60).await.expect("Failed to set");
        backend.del("key1").await.expect("Failed to delete");
        backend.del("key1").await.expect("Failed to delete twice");
        backend.del("never").await.expect("Failed to delete absent");

        assert!(backend.get("key1").await.is_err());
    }

    #[tokio::test]
    async fn test_inmemory_backend_ttl_zero_never_expires() {
        let backend = InMemoryBackend::new();
        backend.set("forever", "v", 0).await.expect("Failed to set");

        let stats = backend.stats();
        assert_eq!(stats.expired_entries, 0);
        assert_eq!(backend.get("forever").await.expect("Failed to get"), "v");
    }

    #[tokio::test]
    async fn test_inmemory_backend_expiration_evicts_on_read() {
        let backend = InMemoryBackend::new();

        backend.set("key1", "value1", 60).await.expect("Failed to set");
        backend
            .expire("key1", Duration::from_millis(50))
            .await
            .expect("Failed to expire");

        // Still present until expiry
        assert_eq!(backend.get("key1").await.expect("Failed to get"), "value1");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(backend.len(), 1);
        assert_eq!(backend.stats().expired_entries, 1);

        assert!(matches!(backend.get("key1").await, Err(Error::NotFound(_))));
        assert_eq!(backend.len(), 0);
        assert!(matches!(backend.get("key1").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_inmemory_backend_evict_spares_newer_entry() {
        let backend = InMemoryBackend::new();

        backend.set("k", "old", 60).await.expect("Failed to set");
        let stale = backend
            .items
            .get("k")
            .map(|e| Arc::clone(e.value()))
            .expect("entry missing");

        // A concurrent set lands before the eviction of the stale entry.
        backend.set("k", "new", 60).await.expect("Failed to set");
        backend.evict("k", &stale);

        assert_eq!(backend.get("k").await.expect("Failed to get"), "new");
    }

    #[tokio::test]
    async fn test_inmemory_backend_expire_missing_key() {
        let backend = InMemoryBackend::new();

        let result = backend.expire("ghost", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(Error::NotExist(_))));
    }

    #[tokio::test]
    async fn test_inmemory_backend_expire_keeps_value() {
        let backend = InMemoryBackend::new();

        backend.set("k", "kept", 1).await.expect("Failed to set");
        backend
            .expire("k", Duration::from_secs(60))
            .await
            .expect("Failed to expire");

        assert_eq!(backend.get("k").await.expect("Failed to get"), "kept");
    }

    #[tokio::test]
    async fn test_inmemory_backend_huge_ttl_never_expires() {
        let backend = InMemoryBackend::new();

        backend.set("k", "v", u64::MAX).await.expect("Failed to set");
        assert_eq!(backend.get("k").await.expect("Failed to get"), "v");

        backend
            .expire("k", Duration::MAX)
            .await
            .expect("Failed to expire");
        assert_eq!(backend.get("k").await.expect("Failed to get"), "v");
        assert_eq!(backend.stats().expired_entries, 0);

        // The shard lock must still be usable after the update.
        backend.increase("k").await.expect_err("value is not a counter");
        backend.set("k", 1, 60).await.expect("Failed to set");
        backend.increase("k").await.expect("Failed to increase");
    }

    #[tokio::test]
    async fn test_inmemory_backend_counters() {
        let backend = InMemoryBackend::new();

        backend.set("ctr", "10", 60).await.expect("Failed to set");
        backend.increase("ctr").await.expect("Failed to increase");
        assert_eq!(backend.get("ctr").await.expect("Failed to get"), "11");

        backend.decrease("ctr").await.expect("Failed to decrease");
        backend.decrease("ctr").await.expect("Failed to decrease");
        assert_eq!(backend.get("ctr").await.expect("Failed to get"), "9");
    }

    #[tokio::test]
    async fn test_inmemory_backend_counter_errors() {
        let backend = InMemoryBackend::new();

        assert!(matches!(
            backend.increase("missing").await,
            Err(Error::NotExist(_))
        ));

        backend.set("word", "abc", 60).await.expect("Failed to set");
        assert!(matches!(
            backend.decrease("word").await,
            Err(Error::TypeError(_))
        ));
        assert_eq!(backend.get("word").await.expect("Failed to get"), "abc");

        backend.set("max", i64::MAX, 60).await.expect("Failed to set");
        assert!(matches!(
            backend.increase("max").await,
            Err(Error::TypeError(_))
        ));
    }

    #[tokio::test]
    async fn test_inmemory_backend_counter_preserves_expiry() {
        let backend = InMemoryBackend::new();

        backend.set("ctr", 1, 60).await.expect("Failed to set");
        backend
            .expire("ctr", Duration::from_millis(50))
            .await
            .expect("Failed to expire");
        backend.increase("ctr").await.expect("Failed to increase");

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(matches!(
            backend.increase("ctr").await,
            Err(Error::NotExist(_))
        ));
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn test_inmemory_backend_hash_aliases_flat_keys() {
        let backend = InMemoryBackend::new();

        backend.set("a", "1", 60).await.expect("Failed to set");
        assert_eq!(backend.hash_get("a", "").await.expect("Failed to get"), "1");

        backend.set("user:name", "ann", 60).await.expect("Failed to set");
        assert_eq!(
            backend
                .hash_get("user:", "name")
                .await
                .expect("Failed to get"),
            "ann"
        );

        backend.hash_del("user:", "name").await.expect("Failed to delete");
        assert!(backend.get("user:name").await.is_err());
    }

    #[tokio::test]
    async fn test_inmemory_backend_prefix_is_per_handle() {
        let shared = InMemoryBackend::new();
        let mut tenant = shared.clone();
        tenant.set_prefix("tenant_a:");

        tenant.set("k", "scoped", 60).await.expect("Failed to set");

        assert!(shared.get("k").await.is_err());
        assert_eq!(
            shared.get("tenant_a:k").await.expect("Failed to get"),
            "scoped"
        );
        assert_eq!(tenant.get("k").await.expect("Failed to get"), "scoped");
    }

    #[tokio::test]
    async fn test_inmemory_backend_lock_unsupported() {
        let backend = InMemoryBackend::new();

        let result = backend.lock("x", 5, None).await;
        assert!(matches!(result, Err(Error::UnsupportedOperation(_))));
    }

    #[tokio::test]
    async fn test_inmemory_backend_run_until_shutdown() {
        let backend = InMemoryBackend::new();
        let runner = backend.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        backend.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run did not return")
            .expect("task failed");

        // Second shutdown is harmless
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_inmemory_backend_shared_signal() {
        let signal = ShutdownSignal::new();
        let first = InMemoryBackend::new().with_signal(signal.clone());
        let second = InMemoryBackend::new().with_signal(signal.clone());

        first.shutdown().await;
        assert!(second.signal().is_triggered());
        tokio::time::timeout(Duration::from_millis(100), second.run())
            .await
            .expect("run should return once the shared signal fired");
    }

    #[tokio::test]
    async fn test_inmemory_backend_stats() {
        let backend = InMemoryBackend::new();

        backend.set("key1", "value_with_data", 60).await.expect("Failed to set");
        backend.set("key2", "data", 60).await.expect("Failed to set");

        let stats = backend.stats();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.expired_entries, 0);
        assert_eq!(stats.total_bytes, 19);
    }

    #[tokio::test]
    async fn test_inmemory_backend_thread_safe() {
        let backend = InMemoryBackend::new();
        let mut handles = vec![];

        for i in 0..10 {
            let b = backend.clone();
            let handle = tokio::spawn(async move {
                let key = format!("key_{}", i);
                let value = format!("value_{}", i);
                b.set(&key, value, 60).await.expect("Failed to set");
            });
            handles.push(handle);
        }

        for handle in handles {
            handle.await.expect("Task failed");
        }

        assert_eq!(backend.len(), 10);
    }

    // Only test touching these variables; both cases run in one test so they
    // cannot race each other.
    #[test]
    fn test_memory_config_from_env() {
        std::env::set_var(POOL_NUM_ENV, "not-a-number");
        let result = MemoryConfig::from_env();
        assert!(matches!(result, Err(Error::ConfigError(_))));
        std::env::remove_var(POOL_NUM_ENV);

        std::env::set_var(MAX_DELIVERIES_ENV, "-3");
        let result = MemoryConfig::from_env();
        assert!(matches!(result, Err(Error::ConfigError(_))));

        std::env::set_var(POOL_NUM_ENV, " 16 ");
        std::env::set_var(MAX_DELIVERIES_ENV, "4");
        let config = MemoryConfig::from_env().expect("Failed to read config");
        assert_eq!(config.pool_num, 16);
        assert_eq!(config.max_deliveries, Some(4));

        std::env::remove_var(POOL_NUM_ENV);
        std::env::remove_var(MAX_DELIVERIES_ENV);
        let config = MemoryConfig::from_env().expect("Failed to read config");
        assert_eq!(config.pool_num, 0);
        assert!(config.max_deliveries.is_none());
    }

    #[test]
    fn test_memory_config_builder() {
        let config = MemoryConfig::default()
            .with_pool_num(8)
            .with_max_deliveries(5);
        assert_eq!(config.pool_num, 8);
        assert_eq!(config.max_deliveries, Some(5));
    }
}
