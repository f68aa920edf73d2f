//! Basic usage of the in-process backend.
//!
//! Run with: RUST_LOG=debug cargo run --example basic_usage

use cache_queue::backend::{CacheBackend, InMemoryBackend, MemoryConfig};
use cache_queue::{Error, Message, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    println!("=== cache-queue basic usage ===\n");

    let config = MemoryConfig::from_env()?.with_max_deliveries(5);
    let backend = InMemoryBackend::with_config(config);

    // Item store
    backend.set("greeting", "hello", 60).await?;
    println!("greeting = {}", backend.get("greeting").await?);

    // Counters
    backend.set("visits", 0, 3600).await?;
    for _ in 0..3 {
        backend.increase("visits").await?;
    }
    println!("visits = {}", backend.get("visits").await?);

    match backend.increase("no_such_counter").await {
        Err(Error::NotExist(key)) => println!("counter {} does not exist", key),
        other => println!("unexpected: {:?}", other),
    }

    // Expiry
    backend.expire("greeting", Duration::from_millis(100)).await?;
    tokio::time::sleep(Duration::from_millis(150)).await;
    println!(
        "greeting after expiry: {}",
        backend.get("greeting").await.unwrap_or_else(|e| e.to_string())
    );

    // Queue
    backend
        .register("emails", |message: Message| async move {
            println!(
                "sending email {} to {}",
                message.id,
                message.get("to").and_then(|v| v.as_str()).unwrap_or("?")
            );
            Ok::<(), Error>(())
        })
        .await;

    for to in ["ann@example.com", "bob@example.com"] {
        backend
            .append(Message::new("emails").with_value("to", to))
            .await?;
    }

    // Locks are not available in-process
    if let Err(e) = backend.lock("report", 5, None).await {
        println!("lock: {}", e);
    }

    let stopper = backend.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        stopper.shutdown().await;
    });
    backend.run().await;

    println!("\nshutdown complete");
    Ok(())
}
