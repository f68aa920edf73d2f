//! Distributed lock facade.

use crate::error::Result;
use std::convert::Infallible;
use std::time::Duration;

/// Options for lock acquisition.
///
/// By default a lock is attempted once; contention fails immediately.
#[derive(Clone, Debug)]
pub struct LockOptions {
    /// Extra attempts after the first one fails.
    pub retry_count: u32,
    /// Pause between attempts.
    pub retry_backoff: Duration,
    /// Opaque data stored alongside the lock token.
    pub metadata: Option<String>,
}

impl Default for LockOptions {
    fn default() -> Self {
        LockOptions {
            retry_count: 0,
            retry_backoff: Duration::from_millis(100),
            metadata: None,
        }
    }
}

impl LockOptions {
    pub fn with_retry(mut self, count: u32, backoff: Duration) -> Self {
        self.retry_count = count;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }
}

/// A held lock.
///
/// The lock expires on its own after its TTL; `release` frees it early.
#[allow(async_fn_in_trait)]
pub trait DistributedLock: Send + Sync {
    /// The locked key.
    fn key(&self) -> &str;

    /// Metadata stored with the lock, if any.
    fn metadata(&self) -> Option<&str>;

    /// Remaining time to live, or `None` once the lock is gone.
    async fn ttl(&self) -> Result<Option<Duration>>;

    /// Extend the lock to `ttl` from now.
    ///
    /// # Errors
    /// `Error::LockNotHeld` if the lock expired or was taken over.
    async fn refresh(&self, ttl: Duration) -> Result<()>;

    /// Release the lock.
    ///
    /// # Errors
    /// `Error::LockNotHeld` if the lock expired or was taken over.
    async fn release(self) -> Result<()>;
}

/// Backends without lock support use `Infallible` as their lock type: no
/// handle can ever be produced.
impl DistributedLock for Infallible {
    fn key(&self) -> &str {
        match *self {}
    }

    fn metadata(&self) -> Option<&str> {
        match *self {}
    }

    async fn ttl(&self) -> Result<Option<Duration>> {
        match *self {}
    }

    async fn refresh(&self, _ttl: Duration) -> Result<()> {
        match *self {}
    }

    async fn release(self) -> Result<()> {
        match self {}
    }
}
