//! # cache-queue
//!
//! A pluggable cache-and-queue abstraction with two interchangeable backends.
//!
//! ## Features
//!
//! - **One contract:** [`CacheBackend`] covers key-value storage with
//!   expiration, hash fields, atomic counters, a message queue with consumer
//!   registration, and distributed locks
//! - **In-process backend:** [`InMemoryBackend`](backend::InMemoryBackend),
//!   a concurrent store with lazy expiry and channel-based streams
//! - **Networked backend:** `RedisBackend` (feature `redis`), a thin layer
//!   over Redis keys, hashes and streams
//! - **At-least-once delivery:** failed messages are redelivered, with an
//!   optional cap
//!
//! ## Quick Start
//!
//! ```ignore
//! use cache_queue::{backend::InMemoryBackend, CacheBackend, Message};
//!
//! let backend = InMemoryBackend::new();
//!
//! backend.set("visits", 0, 3600).await?;
//! backend.increase("visits").await?;
//!
//! backend
//!     .register("emails", |message: Message| async move {
//!         send_email(&message).await
//!     })
//!     .await;
//! backend
//!     .append(Message::new("emails").with_value("to", "ann@example.com"))
//!     .await?;
//!
//! // Block until another task calls backend.shutdown()
//! backend.run().await;
//! ```

#[macro_use]
extern crate log;

pub mod backend;
pub mod consumer;
pub mod error;
pub mod key;
pub mod lock;
pub mod message;
pub mod observability;
pub mod signal;
pub mod value;

// Re-exports for convenience
pub use backend::CacheBackend;
pub use consumer::Consumer;
pub use error::{Error, Result};
pub use lock::{DistributedLock, LockOptions};
pub use message::Message;
pub use signal::ShutdownSignal;
pub use value::CacheValue;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
