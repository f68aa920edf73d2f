//! Cache-and-queue backend implementations.

use crate::consumer::Consumer;
use crate::error::Result;
use crate::lock::{DistributedLock, LockOptions};
use crate::message::Message;
use crate::value::CacheValue;
use std::time::Duration;

pub mod inmemory;
pub mod memqueue;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "redis")]
pub mod redis_queue;

pub use inmemory::{InMemoryBackend, MemoryConfig};
pub use memqueue::StreamState;
#[cfg(feature = "redis")]
pub use redis::{PoolStats, RedisBackend, RedisConfig, RedisLock};
#[cfg(feature = "redis")]
pub use redis_queue::{ConsumerOptions, ProducerOptions};

/// The contract every backend satisfies.
///
/// Covers key-value storage with expiration, hash fields, counters, a
/// message queue with consumer registration, and distributed locks where the
/// backend supports them.
///
/// **IMPORTANT:** All methods except `connect` and `set_prefix` use `&self`.
/// Clones share the same underlying store and queues; the key prefix is
/// per handle.
///
/// **ASYNC:** All I/O methods are async and must be awaited inside a Tokio
/// runtime.
#[allow(async_fn_in_trait)]
pub trait CacheBackend: Send + Sync + Clone {
    /// Handle returned by a successful [`lock`](Self::lock).
    type Lock: DistributedLock;

    /// Backend name ("memory", "redis").
    fn name(&self) -> &'static str;

    /// Verify the backend is reachable.
    ///
    /// # Errors
    /// Returns `Err` if the backend cannot be reached.
    async fn connect(&mut self) -> Result<()>;

    /// Namespace every key used by this handle's item-store operations.
    fn set_prefix(&mut self, prefix: &str);

    /// Read a value.
    ///
    /// # Errors
    /// `Error::NotFound` if the key is absent or expired.
    async fn get(&self, key: &str) -> Result<String>;

    /// Store a value, overwriting any existing entry.
    ///
    /// `ttl_seconds == 0` stores the value without expiry.
    ///
    /// # Errors
    /// `Error::EncodingError` if the value has no string form.
    async fn set<V>(&self, key: &str, value: V, ttl_seconds: u64) -> Result<()>
    where
        V: Into<CacheValue> + Send;

    /// Remove a value. Removing an absent key is not an error.
    async fn del(&self, key: &str) -> Result<()>;

    /// Read a hash field.
    ///
    /// # Errors
    /// `Error::NotFound` if the field is absent or expired.
    async fn hash_get(&self, hash: &str, field: &str) -> Result<String>;

    /// Remove a hash field. Removing an absent field is not an error.
    async fn hash_del(&self, hash: &str, field: &str) -> Result<()>;

    /// Add one to an integer value.
    ///
    /// # Errors
    /// `Error::NotExist` if the key is absent, `Error::TypeError` if the value
    /// is not an integer.
    async fn increase(&self, key: &str) -> Result<()>;

    /// Subtract one from an integer value.
    ///
    /// # Errors
    /// Same as [`increase`](Self::increase).
    async fn decrease(&self, key: &str) -> Result<()>;

    /// Reset a key's expiry to `duration` from now, keeping its value.
    ///
    /// # Errors
    /// `Error::NotExist` if the key is absent or expired.
    async fn expire(&self, key: &str, duration: Duration) -> Result<()>;

    /// Publish a message on `message.stream`.
    ///
    /// The backend assigns the message id; a caller-supplied id is ignored.
    /// The call does not wait for a consumer.
    ///
    /// # Errors
    /// `Error::QueueClosed` after shutdown, `Error::BackendError` on I/O
    /// failure.
    async fn append(&self, message: Message) -> Result<()>;

    /// Bind a consumer to a stream.
    ///
    /// Registering several consumers on one stream makes them compete: each
    /// message goes to exactly one of them (work queue, not broadcast).
    async fn register<C: Consumer>(&self, stream: &str, consumer: C);

    /// Block until [`shutdown`](Self::shutdown) is called.
    async fn run(&self);

    /// Release `run` and stop every consumer.
    async fn shutdown(&self);

    /// Acquire a distributed lock on `key` for `ttl_seconds`.
    ///
    /// # Errors
    /// `Error::UnsupportedOperation` on backends without locks,
    /// `Error::LockContention` when the lock is held elsewhere.
    async fn lock(
        &self,
        key: &str,
        ttl_seconds: u64,
        options: Option<LockOptions>,
    ) -> Result<Self::Lock>;
}
