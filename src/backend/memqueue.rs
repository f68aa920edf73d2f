//! In-process stream registry, producer and consumer dispatchers.
//!
//! Each stream is one Tokio mpsc channel. Producers push into it, and every
//! registered consumer runs a dispatcher task that pulls from the shared
//! receiver. Dispatchers compete for messages, so a message reaches exactly
//! one consumer per delivery.
//!
//! Lifecycle of a stream:
//!
//! ```text
//! (uncreated) --append/register--> Active --shutdown--> Draining --empty--> Stopped
//! ```

use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::observability::CacheMetrics;
use crate::signal::ShutdownSignal;
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard};
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Observable state of an in-process stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Accepting messages.
    Active,
    /// Closed to producers; dispatchers are finishing buffered messages.
    Draining,
    /// Closed and empty; dispatchers have exited.
    Stopped,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => StreamState::Active,
            1 => StreamState::Draining,
            _ => StreamState::Stopped,
        }
    }
}

/// A message plus the number of times it has been handed to a consumer.
pub(crate) struct Delivery {
    message: Message,
    attempts: u32,
}

#[derive(Clone)]
enum QueueSender {
    Bounded(mpsc::Sender<Delivery>),
    Unbounded(mpsc::UnboundedSender<Delivery>),
}

impl QueueSender {
    fn try_send(&self, delivery: Delivery) -> std::result::Result<(), TrySendError<Delivery>> {
        match self {
            QueueSender::Bounded(tx) => tx.try_send(delivery),
            QueueSender::Unbounded(tx) => tx
                .send(delivery)
                .map_err(|e| TrySendError::Closed(e.0)),
        }
    }

    async fn send(&self, delivery: Delivery) -> std::result::Result<(), Delivery> {
        match self {
            QueueSender::Bounded(tx) => tx.send(delivery).await.map_err(|e| e.0),
            QueueSender::Unbounded(tx) => tx.send(delivery).map_err(|e| e.0),
        }
    }

    fn is_closed(&self) -> bool {
        match self {
            QueueSender::Bounded(tx) => tx.is_closed(),
            QueueSender::Unbounded(tx) => tx.is_closed(),
        }
    }
}

/// Deliveries waiting for room in a full bounded channel.
///
/// While `forwarding` is set, a single task owns the queue and moves it into
/// the channel front to back; new deliveries join the back of the queue.
#[derive(Default)]
struct Overflow {
    queue: VecDeque<Delivery>,
    forwarding: bool,
}

fn lock_overflow(overflow: &SyncMutex<Overflow>) -> MutexGuard<'_, Overflow> {
    overflow.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

enum QueueReceiver {
    Bounded(mpsc::Receiver<Delivery>),
    Unbounded(mpsc::UnboundedReceiver<Delivery>),
}

impl QueueReceiver {
    async fn recv(&mut self) -> Option<Delivery> {
        match self {
            QueueReceiver::Bounded(rx) => rx.recv().await,
            QueueReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    fn close(&mut self) {
        match self {
            QueueReceiver::Bounded(rx) => rx.close(),
            QueueReceiver::Unbounded(rx) => rx.close(),
        }
    }
}

/// One named channel and its bookkeeping.
pub(crate) struct Stream {
    name: String,
    sender: QueueSender,
    receiver: Mutex<QueueReceiver>,
    overflow: Arc<SyncMutex<Overflow>>,
    state: AtomicU8,
    dispatchers: AtomicUsize,
}

impl Stream {
    /// `capacity == 0` makes the channel unbounded.
    fn new(name: &str, capacity: usize) -> Self {
        let (sender, receiver) = if capacity == 0 {
            let (tx, rx) = mpsc::unbounded_channel();
            (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx))
        } else {
            let (tx, rx) = mpsc::channel(capacity);
            (QueueSender::Bounded(tx), QueueReceiver::Bounded(rx))
        };

        Stream {
            name: name.to_string(),
            sender,
            receiver: Mutex::new(receiver),
            overflow: Arc::new(SyncMutex::new(Overflow::default())),
            state: AtomicU8::new(StreamState::Active as u8),
            dispatchers: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Put a delivery on the channel without blocking the caller.
    ///
    /// Deliveries reach the channel in call order. While the channel has
    /// room they go straight in. A full bounded channel starts a forwarder
    /// task, and until it has emptied the overflow queue every later
    /// delivery queues behind it instead of overtaking.
    fn enqueue(&self, delivery: Delivery) -> Result<()> {
        let mut overflow = lock_overflow(&self.overflow);

        if overflow.forwarding {
            if self.sender.is_closed() {
                return Err(Error::QueueClosed(self.name.clone()));
            }
            overflow.queue.push_back(delivery);
            return Ok(());
        }

        match self.sender.try_send(delivery) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(delivery)) => {
                overflow.queue.push_back(delivery);
                overflow.forwarding = true;
                tokio::spawn(forward(
                    self.name.clone(),
                    self.sender.clone(),
                    Arc::clone(&self.overflow),
                ));
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(Error::QueueClosed(self.name.clone())),
        }
    }

    /// Receive the next delivery for a dispatcher.
    ///
    /// Once shutdown fires the channel is closed and the remaining buffered
    /// deliveries are handed out; `None` means closed and empty.
    async fn next(&self, signal: &ShutdownSignal) -> Option<Delivery> {
        let mut rx = self.receiver.lock().await;

        if !signal.is_triggered() {
            tokio::select! {
                delivery = rx.recv() => return delivery,
                _ = signal.wait() => {}
            }
        }

        if self.state() == StreamState::Active {
            self.set_state(StreamState::Draining);
            debug!("✓ InMemory stream {} draining", self.name);
        }
        rx.close();
        rx.recv().await
    }
}

/// Drain the overflow queue into the channel, waiting for room as needed.
async fn forward(name: String, sender: QueueSender, overflow: Arc<SyncMutex<Overflow>>) {
    loop {
        let next = {
            let mut overflow = lock_overflow(&overflow);
            match overflow.queue.pop_front() {
                Some(delivery) => delivery,
                None => {
                    overflow.forwarding = false;
                    return;
                }
            }
        };

        if let Err(delivery) = sender.send(next).await {
            let mut overflow = lock_overflow(&overflow);
            warn!(
                "⚠ InMemory stream {} closed before message {} and {} more were enqueued",
                name,
                delivery.message.id,
                overflow.queue.len()
            );
            overflow.queue.clear();
            overflow.forwarding = false;
            return;
        }
    }
}

/// Configuration shared by every stream of a registry.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct QueueSettings {
    pub capacity: usize,
    pub max_deliveries: Option<u32>,
}

/// Concurrent map from stream name to its channel.
#[derive(Clone)]
pub(crate) struct QueueRegistry {
    streams: Arc<DashMap<String, Arc<Stream>>>,
    settings: QueueSettings,
}

impl QueueRegistry {
    pub fn new(settings: QueueSettings) -> Self {
        QueueRegistry {
            streams: Arc::new(DashMap::new()),
            settings,
        }
    }

    /// Look up a stream, creating it on first use.
    fn stream(&self, name: &str) -> Arc<Stream> {
        if let Some(stream) = self.streams.get(name) {
            return Arc::clone(stream.value());
        }
        let stream = self
            .streams
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("✓ InMemory stream {} created", name);
                Arc::new(Stream::new(name, self.settings.capacity))
            });
        Arc::clone(stream.value())
    }

    pub fn state(&self, name: &str) -> Option<StreamState> {
        self.streams.get(name).map(|stream| stream.state())
    }

    /// Producer: copy the message, give it a fresh id, and enqueue it.
    pub fn append(&self, message: &Message, signal: &ShutdownSignal) -> Result<String> {
        if signal.is_triggered() {
            return Err(Error::QueueClosed(message.stream.clone()));
        }

        let stream = self.stream(&message.stream);
        let mut message = message.clone();
        message.id = Uuid::now_v7().to_string();
        let id = message.id.clone();

        stream.enqueue(Delivery {
            message,
            attempts: 0,
        })?;
        debug!("✓ InMemory APPEND {} -> {}", stream.name, id);
        Ok(id)
    }

    /// Start one dispatcher task for `consumer` on stream `name`.
    pub fn register(
        &self,
        name: &str,
        consumer: Arc<dyn Consumer>,
        signal: ShutdownSignal,
        metrics: Arc<dyn CacheMetrics>,
    ) {
        let stream = self.stream(name);
        stream.dispatchers.fetch_add(1, Ordering::AcqRel);
        let max_deliveries = self.settings.max_deliveries;

        tokio::spawn(async move {
            info!("✓ InMemory dispatcher started for stream {}", stream.name);

            while let Some(mut delivery) = stream.next(&signal).await {
                delivery.attempts += 1;
                let start = Instant::now();

                let outcome = AssertUnwindSafe(consumer.consume(delivery.message.clone()))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(Error::Other("consumer panicked".to_string())));

                let err = match outcome {
                    Ok(()) => {
                        metrics.record_delivered(&stream.name, start.elapsed());
                        continue;
                    }
                    Err(err) => err,
                };

                if max_deliveries.is_some_and(|max| delivery.attempts >= max) {
                    error!(
                        "✗ InMemory stream {} message {} dropped after {} deliveries: {}",
                        stream.name, delivery.message.id, delivery.attempts, err
                    );
                    metrics.record_dropped(&stream.name);
                    continue;
                }

                warn!(
                    "⚠ InMemory stream {} message {} failed (delivery {}): {}; requeueing",
                    stream.name, delivery.message.id, delivery.attempts, err
                );
                let id = delivery.message.id.clone();
                match stream.enqueue(delivery) {
                    Ok(()) => metrics.record_redelivered(&stream.name),
                    Err(_) => {
                        warn!(
                            "⚠ InMemory stream {} closed, message {} not redelivered",
                            stream.name, id
                        );
                        metrics.record_dropped(&stream.name);
                    }
                }
            }

            stream.set_state(StreamState::Stopped);
            stream.dispatchers.fetch_sub(1, Ordering::AcqRel);
            info!("✓ InMemory dispatcher stopped for stream {}", stream.name);
        });
    }

    /// Close streams that have no dispatcher to drain them.
    pub async fn close_idle(&self) {
        let streams: Vec<Arc<Stream>> = self
            .streams
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for stream in streams {
            if stream.dispatchers.load(Ordering::Acquire) == 0 {
                stream.receiver.lock().await.close();
                stream.set_state(StreamState::Stopped);
                debug!("✓ InMemory stream {} stopped (no dispatchers)", stream.name);
            }
        }
    }
}
