//! Redis Streams producer and consumer-group readers.
//!
//! Every registered consumer becomes one member of the stream's consumer
//! group and runs its own `XREADGROUP` loop, so several registrations on the
//! same stream compete for entries. Entries are acknowledged after the
//! consumer succeeds; failed entries stay pending and are claimed again once
//! they have been idle longer than the visibility timeout.

use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::signal::ShutdownSignal;
use deadpool_redis::{redis, Pool};
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Stream field holding the JSON-encoded message values.
const VALUES_FIELD: &str = "values";

/// Options for stream consumers.
#[derive(Clone, Debug)]
pub struct ConsumerOptions {
    /// Consumer group shared by every reader of a stream.
    pub group_name: String,
    /// Base name of this process's consumers inside the group.
    pub consumer_name: String,
    /// Pending entries idle for longer than this are claimed and redelivered.
    pub visibility_timeout: Duration,
    /// How long one `XREADGROUP` waits for new entries. Also bounds how long
    /// `shutdown` waits for readers to notice the signal.
    pub block_timeout: Duration,
    /// How often each reader looks for idle pending entries.
    pub reclaim_interval: Duration,
    /// Entries fetched per read.
    pub buffer_size: usize,
    /// Deliveries attempted before a failing entry is acknowledged and
    /// dropped. `None` redelivers forever.
    pub max_deliveries: Option<u32>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            group_name: "cache-queue".to_string(),
            consumer_name: format!("consumer-{}", Uuid::now_v7().simple()),
            visibility_timeout: Duration::from_secs(60),
            block_timeout: Duration::from_secs(5),
            reclaim_interval: Duration::from_secs(1),
            buffer_size: 100,
            max_deliveries: None,
        }
    }
}

/// Options for stream producers.
#[derive(Clone, Debug)]
pub struct ProducerOptions {
    /// Trim streams to this many entries on append. `None` keeps everything.
    pub stream_max_len: Option<u64>,
    /// Use `MAXLEN ~` (cheaper, approximate) instead of exact trimming.
    pub approximate_max_len: bool,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        ProducerOptions {
            stream_max_len: None,
            approximate_max_len: true,
        }
    }
}

/// One `register` call.
#[derive(Clone)]
pub(crate) struct Registration {
    pub stream: String,
    pub consumer_name: String,
    pub consumer: Arc<dyn Consumer>,
}

/// Milliseconds for a Redis argument, saturating at `u64::MAX`.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub(crate) fn encode_values(values: &HashMap<String, Value>) -> Result<String> {
    Ok(serde_json::to_string(values)?)
}

pub(crate) fn decode_message(
    stream: &str,
    id: String,
    mut fields: HashMap<String, String>,
) -> Result<Message> {
    let values = match fields.remove(VALUES_FIELD) {
        Some(raw) => serde_json::from_str(&raw)?,
        None => HashMap::new(),
    };
    Ok(Message {
        id,
        stream: stream.to_string(),
        values,
    })
}

async fn connection(pool: &Pool) -> Result<deadpool_redis::Connection> {
    pool.get()
        .await
        .map_err(|e| Error::BackendError(format!("Failed to get Redis connection: {}", e)))
}

/// `XADD` a message and return the id Redis assigned.
pub(crate) async fn append(
    pool: &Pool,
    options: &ProducerOptions,
    message: &Message,
) -> Result<String> {
    let mut conn = connection(pool).await?;

    let mut cmd = redis::cmd("XADD");
    cmd.arg(&message.stream);
    if let Some(max_len) = options.stream_max_len {
        cmd.arg("MAXLEN");
        if options.approximate_max_len {
            cmd.arg("~");
        }
        cmd.arg(max_len);
    }
    cmd.arg("*")
        .arg(VALUES_FIELD)
        .arg(encode_values(&message.values)?);

    let id: String = cmd.query_async(&mut *conn).await.map_err(|e| {
        Error::BackendError(format!("Redis XADD failed for stream {}: {}", message.stream, e))
    })?;

    debug!("✓ Redis APPEND {} -> {}", message.stream, id);
    Ok(id)
}

/// Create the consumer group (and the stream) if missing.
pub(crate) async fn ensure_group(
    pool: &Pool,
    options: &ConsumerOptions,
    stream: &str,
) -> Result<()> {
    let mut conn = connection(pool).await?;

    let created: redis::RedisResult<()> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream)
        .arg(&options.group_name)
        .arg("$")
        .arg("MKSTREAM")
        .query_async(&mut *conn)
        .await;

    match created {
        Ok(()) => {
            info!("✓ Redis consumer group {} created on {}", options.group_name, stream);
            Ok(())
        }
        Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
        Err(e) => Err(Error::BackendError(format!(
            "Redis XGROUP CREATE failed for stream {}: {}",
            stream, e
        ))),
    }
}

type StreamReply = Vec<(String, Vec<(String, HashMap<String, String>)>)>;

async fn read_new(
    pool: &Pool,
    options: &ConsumerOptions,
    registration: &Registration,
) -> Result<Vec<(String, HashMap<String, String>)>> {
    let mut conn = connection(pool).await?;

    let reply: Option<StreamReply> = redis::cmd("XREADGROUP")
        .arg("GROUP")
        .arg(&options.group_name)
        .arg(&registration.consumer_name)
        .arg("COUNT")
        .arg(options.buffer_size)
        .arg("BLOCK")
        .arg(millis(options.block_timeout))
        .arg("STREAMS")
        .arg(&registration.stream)
        .arg(">")
        .query_async(&mut *conn)
        .await
        .map_err(|e| {
            Error::BackendError(format!(
                "Redis XREADGROUP failed for stream {}: {}",
                registration.stream, e
            ))
        })?;

    Ok(reply
        .unwrap_or_default()
        .into_iter()
        .flat_map(|(_stream, entries)| entries)
        .collect())
}

async fn ack(pool: &Pool, options: &ConsumerOptions, stream: &str, id: &str) -> Result<()> {
    let mut conn = connection(pool).await?;
    redis::cmd("XACK")
        .arg(stream)
        .arg(&options.group_name)
        .arg(id)
        .query_async::<()>(&mut *conn)
        .await
        .map_err(|e| Error::BackendError(format!("Redis XACK failed for {} {}: {}", stream, id, e)))
}

/// Claim entries that failed (or whose reader died) and have been idle past
/// the visibility timeout. Entries past `max_deliveries` are acknowledged
/// and dropped instead.
async fn reclaim(
    pool: &Pool,
    options: &ConsumerOptions,
    registration: &Registration,
) -> Result<Vec<(String, HashMap<String, String>)>> {
    let min_idle = millis(options.visibility_timeout);
    let mut conn = connection(pool).await?;

    let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
        .arg(&registration.stream)
        .arg(&options.group_name)
        .arg("IDLE")
        .arg(min_idle)
        .arg("-")
        .arg("+")
        .arg(options.buffer_size)
        .query_async(&mut *conn)
        .await
        .map_err(|e| {
            Error::BackendError(format!(
                "Redis XPENDING failed for stream {}: {}",
                registration.stream, e
            ))
        })?;
    drop(conn);

    let mut ids = Vec::with_capacity(pending.len());
    for (id, _owner, _idle, deliveries) in pending {
        if options
            .max_deliveries
            .is_some_and(|max| deliveries >= u64::from(max))
        {
            error!(
                "✗ Redis stream {} entry {} dropped after {} deliveries",
                registration.stream, id, deliveries
            );
            ack(pool, options, &registration.stream, &id).await?;
        } else {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut conn = connection(pool).await?;
    let claimed: Vec<Option<(String, HashMap<String, String>)>> = redis::cmd("XCLAIM")
        .arg(&registration.stream)
        .arg(&options.group_name)
        .arg(&registration.consumer_name)
        .arg(min_idle)
        .arg(&ids)
        .query_async(&mut *conn)
        .await
        .map_err(|e| {
            Error::BackendError(format!(
                "Redis XCLAIM failed for stream {}: {}",
                registration.stream, e
            ))
        })?;

    let claimed: Vec<_> = claimed.into_iter().flatten().collect();
    if !claimed.is_empty() {
        warn!(
            "⚠ Redis stream {} reclaimed {} pending entries",
            registration.stream,
            claimed.len()
        );
    }
    Ok(claimed)
}

async fn dispatch(
    pool: &Pool,
    options: &ConsumerOptions,
    registration: &Registration,
    id: String,
    fields: HashMap<String, String>,
) {
    let stream = &registration.stream;
    let message = match decode_message(stream, id.clone(), fields) {
        Ok(message) => message,
        Err(e) => {
            // Undecodable entries would fail forever; drop them.
            error!("✗ Redis stream {} entry {} is malformed: {}", stream, id, e);
            if let Err(e) = ack(pool, options, stream, &id).await {
                warn!("⚠ {}", e);
            }
            return;
        }
    };

    let outcome = AssertUnwindSafe(registration.consumer.consume(message))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(Error::Other("consumer panicked".to_string())));

    match outcome {
        Ok(()) => {
            if let Err(e) = ack(pool, options, stream, &id).await {
                warn!("⚠ {}", e);
            }
        }
        Err(e) => warn!(
            "⚠ Redis stream {} entry {} failed: {}; left pending for redelivery",
            stream, id, e
        ),
    }
}

/// Read-and-dispatch loop for one registration. Returns once `signal`
/// fires; an in-flight blocking read finishes first.
pub(crate) async fn read_loop(
    pool: Pool,
    options: ConsumerOptions,
    registration: Registration,
    signal: ShutdownSignal,
) {
    info!(
        "✓ Redis reader {} started for stream {}",
        registration.consumer_name, registration.stream
    );
    let mut last_reclaim = Instant::now();

    while !signal.is_triggered() {
        if last_reclaim.elapsed() >= options.reclaim_interval {
            last_reclaim = Instant::now();
            match reclaim(&pool, &options, &registration).await {
                Ok(entries) => {
                    for (id, fields) in entries {
                        dispatch(&pool, &options, &registration, id, fields).await;
                    }
                }
                Err(e) => warn!("⚠ {}", e),
            }
        }

        match read_new(&pool, &options, &registration).await {
            Ok(entries) => {
                for (id, fields) in entries {
                    dispatch(&pool, &options, &registration, id, fields).await;
                }
            }
            Err(e) => {
                warn!("⚠ {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = signal.wait() => {}
                }
            }
        }
    }

    info!(
        "✓ Redis reader {} stopped for stream {}",
        registration.consumer_name, registration.stream
    );
}
