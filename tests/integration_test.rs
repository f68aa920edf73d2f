//! Integration tests for cache-queue
//!
//! These tests verify end-to-end behavior of the in-process backend through
//! the public `CacheBackend` contract.

use cache_queue::backend::{CacheBackend, InMemoryBackend, MemoryConfig, StreamState};
use cache_queue::{Error, Message};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// Test 1: Set then Get
///
/// A value is readable immediately after it is written.
#[tokio::test]
async fn test_set_then_get() {
    let backend = InMemoryBackend::new();

    backend.set("greeting", "hello", 60).await.expect("Failed to set");
    assert_eq!(backend.get("greeting").await.expect("Failed to get"), "hello");

    backend.set("n", 42i64, 60).await.expect("Failed to set");
    assert_eq!(backend.get("n").await.expect("Failed to get"), "42");

    backend.set("flag", true, 60).await.expect("Failed to set");
    assert_eq!(backend.get("flag").await.expect("Failed to get"), "true");
}

/// Test 2: Expiry has no resurrection
///
/// Once an entry has expired, every later read fails with NotFound.
#[tokio::test]
async fn test_expired_entry_stays_gone() {
    let backend = InMemoryBackend::new();

    backend.set("session", "abc", 1).await.expect("Failed to set");
    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert!(matches!(backend.get("session").await, Err(Error::NotFound(_))));
    assert!(matches!(backend.get("session").await, Err(Error::NotFound(_))));
    assert!(matches!(
        backend.expire("session", Duration::from_secs(60)).await,
        Err(Error::NotExist(_))
    ));
}

/// Test 3: Del is idempotent
#[tokio::test]
async fn test_del_idempotent() {
    let backend = InMemoryBackend::new();

    backend.del("absent").await.expect("Del of absent key failed");
    backend.set("k", "v", 60).await.expect("Failed to set");
    backend.del("k").await.expect("Failed to delete");
    backend.del("k").await.expect("Repeated delete failed");
    assert!(backend.get("k").await.is_err());
}

/// Test 4: Counter linearizability
///
/// 1000 concurrent increments on one key lose no update.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_increase_loses_no_updates() {
    let backend = InMemoryBackend::new();
    backend.set("hits", "0", 60).await.expect("Failed to set");

    let mut handles = Vec::with_capacity(1000);
    for _ in 0..1000 {
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            backend.increase("hits").await.expect("Failed to increase");
        }));
    }
    for handle in handles {
        handle.await.expect("Task failed");
    }

    assert_eq!(backend.get("hits").await.expect("Failed to get"), "1000");
}

/// Test 5: Mixed concurrent increments and decrements cancel out
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_increase_decrease_balance() {
    let backend = InMemoryBackend::new();
    backend.set("balance", 100, 60).await.expect("Failed to set");

    let mut handles = Vec::new();
    for i in 0..500 {
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                backend.increase("balance").await
            } else {
                backend.decrease("balance").await
            }
        }));
    }
    for handle in handles {
        handle.await.expect("Task failed").expect("Counter op failed");
    }

    assert_eq!(backend.get("balance").await.expect("Failed to get"), "100");
}

/// Test 6: Counter scenario
#[tokio::test]
async fn test_counter_scenario() {
    let backend = InMemoryBackend::new();

    backend.set("ctr", "10", 60).await.expect("Failed to set");
    backend.increase("ctr").await.expect("Failed to increase");
    assert_eq!(backend.get("ctr").await.expect("Failed to get"), "11");

    backend.decrease("ctr").await.expect("Failed to decrease");
    backend.decrease("ctr").await.expect("Failed to decrease");
    assert_eq!(backend.get("ctr").await.expect("Failed to get"), "9");
}

/// Test 7: Hash fields share the flat key space
#[tokio::test]
async fn test_hash_get_aliases_plain_key() {
    let backend = InMemoryBackend::new();

    backend.set("a", "1", 60).await.expect("Failed to set");
    assert_eq!(backend.hash_get("a", "").await.expect("Failed to get"), "1");

    backend.hash_del("a", "").await.expect("Failed to delete");
    assert!(matches!(backend.get("a").await, Err(Error::NotFound(_))));
}

/// Test 8: Lock is unsupported in-process
#[tokio::test]
async fn test_lock_unsupported() {
    let backend = InMemoryBackend::new();

    for _ in 0..3 {
        assert!(matches!(
            backend.lock("x", 5, None).await,
            Err(Error::UnsupportedOperation(_))
        ));
    }
}

/// Test 9: At-least-once delivery
///
/// A consumer that fails once sees the message exactly twice, with the same
/// id both times, and then never again.
#[tokio::test]
async fn test_failed_message_redelivered_once() {
    let backend = InMemoryBackend::new();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&seen);
    backend
        .register("retry", move |message: Message| {
            let log = Arc::clone(&log);
            async move {
                let mut log = log.lock().await;
                log.push(message.id.clone());
                if log.len() == 1 {
                    Err(Error::Other("transient failure".to_string()))
                } else {
                    Ok(())
                }
            }
        })
        .await;

    backend
        .append(Message::new("retry").with_value("job", 1))
        .await
        .expect("Failed to append");

    tokio::time::sleep(Duration::from_millis(300)).await;

    let seen = seen.lock().await;
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], seen[1]);
    assert!(!seen[0].is_empty());
}

/// Test 10: Competing consumers
///
/// Two registrations on one stream split the messages; none is delivered to
/// both.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_registrations_share_work() {
    let backend = InMemoryBackend::new();
    let (tx, mut rx) = mpsc::unbounded_channel::<(u8, String)>();

    for worker in [1u8, 2u8] {
        let tx = tx.clone();
        backend
            .register("work", move |message: Message| {
                let tx = tx.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    let _ = tx.send((worker, message.id));
                    Ok::<(), Error>(())
                }
            })
            .await;
    }
    drop(tx);

    for i in 0..100 {
        backend
            .append(Message::new("work").with_value("n", i))
            .await
            .expect("Failed to append");
    }

    let mut ids = HashSet::new();
    let mut workers = HashSet::new();
    for _ in 0..100 {
        let (worker, id) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for deliveries")
            .expect("Channel closed");
        assert!(ids.insert(id), "message delivered twice");
        workers.insert(worker);
    }

    assert_eq!(ids.len(), 100);
    assert_eq!(workers.len(), 2, "both consumers should get work");
    assert!(
        tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err(),
        "no extra deliveries expected"
    );
}

/// Test 11: Tenant prefix travels with the message
#[tokio::test]
async fn test_message_prefix_round_trip() {
    let backend = InMemoryBackend::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    backend
        .register("tenanted", move |message: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message.prefix().to_string());
                Ok::<(), Error>(())
            }
        })
        .await;

    let mut message = Message::new("tenanted");
    message.set_prefix("tenant_b");
    backend.append(message).await.expect("Failed to append");

    let prefix = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("Timed out")
        .expect("Channel closed");
    assert_eq!(prefix, "tenant_b");
}

/// Test 12: Run blocks until Shutdown; streams stop afterwards
#[tokio::test]
async fn test_run_shutdown_lifecycle() {
    let backend = InMemoryBackend::with_config(MemoryConfig::default().with_pool_num(4));
    let delivered = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&delivered);
    backend
        .register("lifecycle", move |_message: Message| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), Error>(())
            }
        })
        .await;
    backend
        .append(Message::new("idle_stream"))
        .await
        .expect("Failed to append");
    assert_eq!(backend.stream_state("never_used"), None);
    assert_eq!(
        backend.stream_state("lifecycle"),
        Some(StreamState::Active)
    );

    let runner = backend.clone();
    let run = tokio::spawn(async move { runner.run().await });

    for _ in 0..3 {
        backend
            .append(Message::new("lifecycle"))
            .await
            .expect("Failed to append");
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!run.is_finished());

    backend.shutdown().await;
    tokio::time::timeout(Duration::from_secs(1), run)
        .await
        .expect("run did not return after shutdown")
        .expect("Task failed");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(delivered.load(Ordering::SeqCst), 3);
    assert_eq!(
        backend.stream_state("lifecycle"),
        Some(StreamState::Stopped)
    );
    assert_eq!(
        backend.stream_state("idle_stream"),
        Some(StreamState::Stopped)
    );
    assert!(matches!(
        backend.append(Message::new("lifecycle")).await,
        Err(Error::QueueClosed(_))
    ));
}

/// Test 13: Redelivery cap
#[tokio::test]
async fn test_poison_message_capped() {
    let backend = InMemoryBackend::with_config(MemoryConfig::default().with_max_deliveries(4));
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&attempts);
    backend
        .register("poison", move |_message: Message| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), Error>(Error::Other("never works".to_string()))
            }
        })
        .await;
    backend
        .append(Message::new("poison"))
        .await
        .expect("Failed to append");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
}
