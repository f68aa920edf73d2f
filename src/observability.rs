//! Metrics hooks for store and queue operations.
//!
//! Implement [`CacheMetrics`] to feed your monitoring system:
//!
//! ```ignore
//! use cache_queue::observability::CacheMetrics;
//! use std::time::Duration;
//!
//! struct PrometheusMetrics;
//!
//! impl CacheMetrics for PrometheusMetrics {
//!     fn record_hit(&self, _key: &str, _duration: Duration) {
//!         // counter!("cache_hits").inc();
//!     }
//!     fn record_redelivered(&self, _stream: &str) {
//!         // counter!("queue_redeliveries").inc();
//!     }
//!     // ... other methods keep their logging defaults
//! }
//!
//! // let backend = InMemoryBackend::new().with_metrics(Arc::new(PrometheusMetrics));
//! ```
//!
//! Backends default to [`NoOpMetrics`]. The trait's own default methods log
//! through the `log` crate, so an empty `impl CacheMetrics for X {}` gives
//! debug logging of every event.

use std::time::Duration;

/// Trait for cache and queue metrics collection.
pub trait CacheMetrics: Send + Sync {
    /// Record a read that found a live entry.
    fn record_hit(&self, key: &str, duration: Duration) {
        debug!("Cache HIT: {} took {:?}", key, duration);
    }

    /// Record a read that found nothing (or an expired entry).
    fn record_miss(&self, key: &str, duration: Duration) {
        debug!("Cache MISS: {} took {:?}", key, duration);
    }

    /// Record a write.
    fn record_set(&self, key: &str, duration: Duration) {
        debug!("Cache SET: {} took {:?}", key, duration);
    }

    /// Record a delete.
    fn record_delete(&self, key: &str, duration: Duration) {
        debug!("Cache DELETE: {} took {:?}", key, duration);
    }

    /// Record an error.
    fn record_error(&self, key: &str, error: &str) {
        warn!("Cache ERROR for {}: {}", key, error);
    }

    /// Record a message acknowledged by its consumer.
    fn record_delivered(&self, stream: &str, duration: Duration) {
        debug!("Queue DELIVERED on {} took {:?}", stream, duration);
    }

    /// Record a message put back on its stream after a consumer error.
    fn record_redelivered(&self, stream: &str) {
        debug!("Queue REDELIVER on {}", stream);
    }

    /// Record a message discarded without being acknowledged.
    fn record_dropped(&self, stream: &str) {
        warn!("Queue DROPPED message on {}", stream);
    }
}

/// Default metrics implementation (no-op).
#[derive(Clone, Default)]
pub struct NoOpMetrics;

impl CacheMetrics for NoOpMetrics {
    fn record_hit(&self, _key: &str, _duration: Duration) {}
    fn record_miss(&self, _key: &str, _duration: Duration) {}
    fn record_set(&self, _key: &str, _duration: Duration) {}
    fn record_delete(&self, _key: &str, _duration: Duration) {}
    fn record_error(&self, _key: &str, _error: &str) {}
    fn record_delivered(&self, _stream: &str, _duration: Duration) {}
    fn record_redelivered(&self, _stream: &str) {}
    fn record_dropped(&self, _stream: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LoggingMetrics;
    impl CacheMetrics for LoggingMetrics {}

    #[test]
    fn test_noop_metrics() {
        let metrics = NoOpMetrics;
        metrics.record_hit("key", Duration::from_secs(1));
        metrics.record_miss("key", Duration::from_secs(2));
        metrics.record_redelivered("stream");
    }

    #[test]
    fn test_default_methods_log() {
        let metrics = LoggingMetrics;
        metrics.record_set("key", Duration::from_millis(1));
        metrics.record_delivered("stream", Duration::from_millis(1));
        metrics.record_dropped("stream");
    }
}
