//! Redis backend implementation.

use super::redis_queue::{self, ConsumerOptions, ProducerOptions, Registration};
use super::CacheBackend;
use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::key::KeyBuilder;
use crate::lock::{DistributedLock, LockOptions};
use crate::message::Message;
use crate::signal::ShutdownSignal;
use crate::value::CacheValue;
use deadpool_redis::{redis, redis::AsyncCommands, Config as PoolConfig, Pool, Runtime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Pool statistics information.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub connections: u32,
    pub idle_connections: u32,
}

/// Default Redis connection pool size.
/// Formula: (CPU cores × 2) + 1
/// For 8-core systems: 16 connections is optimal
/// Override with REDIS_POOL_SIZE environment variable
const DEFAULT_POOL_SIZE: u32 = 16;

/// Adds `delta` to an existing integer key; returns nil when the key is
/// absent so that counters never spring into existence.
const COUNTER_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return false
end
return redis.call('INCRBY', KEYS[1], ARGV[1])
"#;

const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

const REFRESH_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const PTTL_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PTTL', KEYS[1])
end
return -3
"#;

/// Configuration for Redis backend.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: u32,
    pub pool_size: u32,
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
            pool_size: DEFAULT_POOL_SIZE,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    /// Build Redis connection string.
    pub fn connection_string(&self) -> String {
        if let Some(password) = &self.password {
            if let Some(username) = &self.username {
                format!(
                    "redis://{}:{}@{}:{}/{}",
                    username, password, self.host, self.port, self.database
                )
            } else {
                format!(
                    "redis://default:{}@{}:{}/{}",
                    password, self.host, self.port, self.database
                )
            }
        } else {
            format!("redis://{}:{}/{}", self.host, self.port, self.database)
        }
    }
}

fn create_pool(conn_str: &str, pool_size: u32, timeout: Option<Duration>) -> Result<Pool> {
    let mut cfg = PoolConfig::from_url(conn_str);
    let mut pool_cfg = deadpool_redis::PoolConfig::new(pool_size as usize);
    pool_cfg.timeouts.wait = timeout;
    pool_cfg.timeouts.create = timeout;
    cfg.pool = Some(pool_cfg);

    cfg.create_pool(Some(Runtime::Tokio1))
        .map_err(|e| Error::BackendError(format!("Failed to create Redis pool: {}", e)))
}

/// Redis backend with connection pooling and async operations.
///
/// Item-store calls map onto plain Redis commands, the queue onto Redis
/// Streams with consumer groups, and `lock` onto `SET NX PX` with
/// token-checked release.
///
/// # Example
///
/// ```no_run
/// # use cache_queue::backend::{RedisBackend, RedisConfig, CacheBackend};
/// # use cache_queue::error::Result;
/// # async fn example() -> Result<()> {
/// let config = RedisConfig::default();
/// let mut backend = RedisBackend::new(config).await?;
/// backend.connect().await?;
///
/// backend.set("key", "value", 60).await?;
/// let value = backend.get("key").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisBackend {
    pool: Pool,
    prefix: String,
    signal: ShutdownSignal,
    consumer_options: ConsumerOptions,
    producer_options: ProducerOptions,
    registrations: Arc<Mutex<Vec<Registration>>>,
    started: Arc<AtomicBool>,
}

impl RedisBackend {
    /// Create new Redis backend from configuration.
    ///
    /// # Errors
    /// Returns `Err` if pool creation fails.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        let pool = create_pool(
            &config.connection_string(),
            config.pool_size,
            Some(config.connection_timeout),
        )?;

        info!(
            "✓ Redis backend initialized: {}:{}",
            config.host, config.port
        );

        Ok(Self::from_pool(pool))
    }

    /// Create from connection string directly.
    ///
    /// Pool size is determined by:
    /// 1. `REDIS_POOL_SIZE` environment variable (if set)
    /// 2. `DEFAULT_POOL_SIZE` constant (16)
    ///
    /// # Errors
    /// Returns `Err` if pool creation fails.
    pub async fn from_connection_string(conn_str: &str) -> Result<Self> {
        let pool_size = std::env::var("REDIS_POOL_SIZE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_POOL_SIZE);

        let pool = create_pool(conn_str, pool_size, None)?;

        info!(
            "✓ Redis backend initialized from connection string (pool size: {})",
            pool_size
        );

        Ok(Self::from_pool(pool))
    }

    /// Wrap an existing pool, sharing its connections with other users.
    pub fn from_pool(pool: Pool) -> Self {
        RedisBackend {
            pool,
            prefix: String::new(),
            signal: ShutdownSignal::new(),
            consumer_options: ConsumerOptions::default(),
            producer_options: ProducerOptions::default(),
            registrations: Arc::new(Mutex::new(Vec::new())),
            started: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_consumer_options(mut self, options: ConsumerOptions) -> Self {
        self.consumer_options = options;
        self
    }

    pub fn with_producer_options(mut self, options: ProducerOptions) -> Self {
        self.producer_options = options;
        self
    }

    /// Use an externally owned shutdown signal.
    pub fn with_signal(mut self, signal: ShutdownSignal) -> Self {
        self.signal = signal;
        self
    }

    /// The underlying connection pool, for commands outside this contract.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Get current pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        let status = self.pool.status();
        PoolStats {
            connections: status.size as u32,
            idle_connections: status.available as u32,
        }
    }

    /// Ping the server.
    ///
    /// # Errors
    /// Returns `Err` if no connection can be obtained or PING fails.
    pub async fn health_check(&self) -> Result<bool> {
        let mut conn = self.conn().await?;

        let pong: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| Error::BackendError(format!("Redis PING failed: {}", e)))?;

        Ok(pong == "PONG" || pong.contains("PONG"))
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::BackendError(format!("Failed to get Redis connection: {}", e)))
    }

    fn key(&self, key: &str) -> String {
        KeyBuilder::namespaced(&self.prefix, key)
    }

    /// Claim the right to start readers. Only the first call, across all
    /// clones, gets `true`.
    fn claim_readers(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    async fn calculate(&self, key: &str, delta: i64) -> Result<()> {
        let key = self.key(key);
        let mut conn = self.conn().await?;

        let script = redis::Script::new(COUNTER_SCRIPT);
        let value: Option<i64> = script
            .key(&key)
            .arg(delta)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| {
                if e.to_string().contains("not an integer") {
                    Error::TypeError(format!("value of {} is not an integer", key))
                } else {
                    Error::BackendError(format!("Redis INCRBY failed for key {}: {}", key, e))
                }
            })?;

        match value {
            Some(n) => {
                debug!("✓ Redis INCRBY {} {} -> {}", key, delta, n);
                Ok(())
            }
            None => Err(Error::NotExist(key)),
        }
    }
}

impl CacheBackend for RedisBackend {
    type Lock = RedisLock;

    fn name(&self) -> &'static str {
        "redis"
    }

    async fn connect(&mut self) -> Result<()> {
        if self.health_check().await? {
            info!("✓ Redis backend connected");
            Ok(())
        } else {
            Err(Error::BackendError("Redis PING returned no PONG".to_string()))
        }
    }

    fn set_prefix(&mut self, prefix: &str) {
        self.prefix = prefix.to_string();
    }

    async fn get(&self, key: &str) -> Result<String> {
        let key = self.key(key);
        let mut conn = self.conn().await?;

        let value: Option<String> = conn
            .get(&key)
            .await
            .map_err(|e| Error::BackendError(format!("Redis GET failed for key {}: {}", key, e)))?;

        match value {
            Some(value) => {
                debug!("✓ Redis GET {} -> HIT", key);
                Ok(value)
            }
            None => {
                debug!("✓ Redis GET {} -> MISS", key);
                Err(Error::NotFound(key))
            }
        }
    }

    async fn set<V>(&self, key: &str, value: V, ttl_seconds: u64) -> Result<()>
    where
        V: Into<CacheValue> + Send,
    {
        let key = self.key(key);
        let value: CacheValue = value.into();
        let value = value.into_encoded()?;
        let mut conn = self.conn().await?;

        if ttl_seconds > 0 {
            conn.set_ex::<_, _, ()>(&key, value, ttl_seconds)
                .await
                .map_err(|e| {
                    Error::BackendError(format!("Redis SET_EX failed for key {}: {}", key, e))
                })?;
            debug!("✓ Redis SET {} (TTL: {}s)", key, ttl_seconds);
        } else {
            conn.set::<_, _, ()>(&key, value).await.map_err(|e| {
                Error::BackendError(format!("Redis SET failed for key {}: {}", key, e))
            })?;
            debug!("✓ Redis SET {}", key);
        }

        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let key = self.key(key);
        let mut conn = self.conn().await?;

        conn.del::<_, ()>(&key)
            .await
            .map_err(|e| Error::BackendError(format!("Redis DEL failed for key {}: {}", key, e)))?;

        debug!("✓ Redis DELETE {}", key);
        Ok(())
    }

    async fn hash_get(&self, hash: &str, field: &str) -> Result<String> {
        let hash = self.key(hash);
        let mut conn = self.conn().await?;

        let value: Option<String> = conn.hget(&hash, field).await.map_err(|e| {
            Error::BackendError(format!("Redis HGET failed for {} {}: {}", hash, field, e))
        })?;

        value.ok_or_else(|| Error::NotFound(KeyBuilder::hash_field(&hash, field)))
    }

    async fn hash_del(&self, hash: &str, field: &str) -> Result<()> {
        let hash = self.key(hash);
        let mut conn = self.conn().await?;

        conn.hdel::<_, _, ()>(&hash, field).await.map_err(|e| {
            Error::BackendError(format!("Redis HDEL failed for {} {}: {}", hash, field, e))
        })?;

        debug!("✓ Redis HDEL {} {}", hash, field);
        Ok(())
    }

    async fn increase(&self, key: &str) -> Result<()> {
        self.calculate(key, 1).await
    }

    async fn decrease(&self, key: &str) -> Result<()> {
        self.calculate(key, -1).await
    }

    async fn expire(&self, key: &str, duration: Duration) -> Result<()> {
        let key = self.key(key);
        let mut conn = self.conn().await?;

        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(&key)
            .arg(redis_queue::millis(duration))
            .query_async(&mut *conn)
            .await
            .map_err(|e| {
                Error::BackendError(format!("Redis PEXPIRE failed for key {}: {}", key, e))
            })?;

        if updated == 0 {
            return Err(Error::NotExist(key));
        }
        debug!("✓ Redis EXPIRE {} (TTL: {:?})", key, duration);
        Ok(())
    }

    async fn append(&self, message: Message) -> Result<()> {
        redis_queue::append(&self.pool, &self.producer_options, &message)
            .await
            .map(|_| ())
    }

    async fn register<C: Consumer>(&self, stream: &str, consumer: C) {
        let mut registrations = self
            .registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let consumer_name = format!(
            "{}-{}",
            self.consumer_options.consumer_name,
            registrations.len()
        );
        debug!("✓ Redis REGISTER {} as {}", stream, consumer_name);
        registrations.push(Registration {
            stream: stream.to_string(),
            consumer_name,
            consumer: Arc::new(consumer),
        });
    }

    /// Start one reader per registration and block until shutdown.
    ///
    /// Readers are started once per backend: a later `run`, on this handle
    /// or a clone, only waits for shutdown. Consumers must be registered
    /// before the first `run`.
    async fn run(&self) {
        if !self.claim_readers() {
            warn!("⚠ Redis readers already started; run only waits for shutdown");
            self.signal.wait().await;
            return;
        }

        let registrations: Vec<Registration> = self
            .registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let mut readers = Vec::with_capacity(registrations.len());
        for registration in registrations {
            if let Err(e) =
                redis_queue::ensure_group(&self.pool, &self.consumer_options, &registration.stream)
                    .await
            {
                error!("✗ {}", e);
                continue;
            }
            readers.push(tokio::spawn(redis_queue::read_loop(
                self.pool.clone(),
                self.consumer_options.clone(),
                registration,
                self.signal.clone(),
            )));
        }

        self.signal.wait().await;
        for reader in readers {
            if let Err(e) = reader.await {
                error!("✗ Redis reader task failed: {}", e);
            }
        }
    }

    async fn shutdown(&self) {
        if self.signal.trigger() {
            info!("✓ Redis shutdown requested");
        }
    }

    async fn lock(
        &self,
        key: &str,
        ttl_seconds: u64,
        options: Option<LockOptions>,
    ) -> Result<Self::Lock> {
        let options = options.unwrap_or_default();
        let key = self.key(key);
        let token = Uuid::now_v7().simple().to_string();
        let value = format!("{}{}", token, options.metadata.as_deref().unwrap_or(""));
        let ttl_ms = ttl_seconds.saturating_mul(1000);

        for attempt in 0..=options.retry_count {
            if attempt > 0 {
                tokio::time::sleep(options.retry_backoff).await;
            }

            let mut conn = self.conn().await?;
            let obtained: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&value)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut *conn)
                .await
                .map_err(|e| {
                    Error::BackendError(format!("Redis SET NX failed for lock {}: {}", key, e))
                })?;

            if obtained.is_some() {
                debug!("✓ Redis LOCK {} (TTL: {}s)", key, ttl_seconds);
                return Ok(RedisLock {
                    pool: self.pool.clone(),
                    key,
                    value,
                    metadata: options.metadata,
                });
            }
        }

        Err(Error::LockContention(key))
    }
}

/// A lock held in Redis.
///
/// The stored value is a random token followed by the metadata; refresh and
/// release only act while the stored value still matches.
pub struct RedisLock {
    pool: Pool,
    key: String,
    value: String,
    metadata: Option<String>,
}

impl RedisLock {
    async fn run_script<T>(&self, source: &str, extra: Option<u64>) -> Result<T>
    where
        T: redis::FromRedisValue,
    {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| Error::BackendError(format!("Failed to get Redis connection: {}", e)))?;

        let script = redis::Script::new(source);
        let mut invocation = script.key(&self.key);
        invocation.arg(&self.value);
        if let Some(extra) = extra {
            invocation.arg(extra);
        }

        let result: T = invocation.invoke_async(&mut *conn).await.map_err(|e| {
            Error::BackendError(format!("Redis lock script failed for {}: {}", self.key, e))
        })?;
        Ok(result)
    }
}

impl DistributedLock for RedisLock {
    fn key(&self) -> &str {
        &self.key
    }

    fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    async fn ttl(&self) -> Result<Option<Duration>> {
        let pttl: i64 = self.run_script(PTTL_SCRIPT, None).await?;
        Ok((pttl >= 0).then(|| Duration::from_millis(pttl as u64)))
    }

    async fn refresh(&self, ttl: Duration) -> Result<()> {
        let refreshed: i64 = self
            .run_script(REFRESH_SCRIPT, Some(redis_queue::millis(ttl)))
            .await?;
        if refreshed == 0 {
            return Err(Error::LockNotHeld(self.key.clone()));
        }
        debug!("✓ Redis LOCK REFRESH {} (TTL: {:?})", self.key, ttl);
        Ok(())
    }

    async fn release(self) -> Result<()> {
        let released: i64 = self.run_script(UNLOCK_SCRIPT, None).await?;
        if released == 0 {
            return Err(Error::LockNotHeld(self.key));
        }
        debug!("✓ Redis UNLOCK {}", self.key);
        Ok(())
    }
}
