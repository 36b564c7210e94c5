//! Queue consumer: one serialized channel, a bounded pool of workers
//!
//! The transport channel is not safe for concurrent use, so every channel
//! operation goes through [`ChannelHandle`], a single mutex driven from
//! blocking tasks. Workers acknowledge against the handle captured at
//! delivery time; after a reconnect the old handle is closed and its
//! deliveries are left for the broker to redeliver.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::QueueMessage;
use crate::pipeline::{EventProcessor, EventSource};
use crate::queue::{Channel, Delivery, QueueTransport};

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue: String,
    /// Worker pool size; also the channel prefetch
    pub workers: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Consecutive failed sessions tolerated before giving up
    pub max_restarts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    /// Hard per-event deadline; `None` lets a worker run unbounded
    pub event_deadline: Option<Duration>,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            queue: "conversation_events".to_string(),
            workers: 4,
            poll_interval: Duration::from_millis(200),
            heartbeat_interval: Duration::from_secs(10),
            max_restarts: 20,
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            event_deadline: Some(Duration::from_secs(120)),
        }
    }
}

impl ConsumerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue: config.queue.name.clone(),
            workers: config.consumer.workers.max(1),
            poll_interval: Duration::from_millis(config.queue.poll_interval_ms.max(1)),
            heartbeat_interval: Duration::from_secs(config.queue.heartbeat_secs.max(1)),
            max_restarts: config.consumer.max_restarts,
            backoff_initial: Duration::from_millis(config.consumer.backoff_initial_ms.max(1)),
            backoff_max: Duration::from_millis(config.consumer.backoff_max_ms.max(1)),
            event_deadline: config.event_deadline(),
        }
    }
}

/// Counters reported when the consumer stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    /// Settlements skipped because the original channel had closed
    pub abandoned: u64,
    /// Deliveries requeued because processing outlived the deadline
    pub timed_out: u64,
    pub restarts: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    abandoned: AtomicU64,
    timed_out: AtomicU64,
    restarts: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

// ============================================
// CHANNEL HANDLE
// ============================================

/// Shared, serialized access to one transport channel
#[derive(Clone)]
pub struct ChannelHandle {
    id: Arc<str>,
    channel: Arc<Mutex<Box<dyn Channel>>>,
    open: Arc<AtomicBool>,
}

impl ChannelHandle {
    pub fn new(channel: Box<dyn Channel>) -> Self {
        Self {
            id: Arc::from(channel.id()),
            channel: Arc::new(Mutex::new(channel)),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Stop settling through this handle; deliveries fall back to the broker
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Run one channel operation under the lock on a blocking thread
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Channel) -> Result<T> + Send + 'static,
    {
        let channel = Arc::clone(&self.channel);
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = channel
                .lock()
                .map_err(|_| Error::Unexpected("channel mutex poisoned".to_string()))?;
            f(&mut **guard)
        })
        .await
        .map_err(|e| Error::Unexpected(format!("channel task join error: {}", e)))?;

        if let Err(e) = &result {
            if e.is_infra() {
                self.mark_closed();
            }
        }
        result
    }

    async fn close(&self) {
        self.mark_closed();
        if let Err(e) = self.call(|channel| channel.close()).await {
            tracing::debug!(channel_id = %self.id, error = %e, "channel close failed");
        }
    }
}

// ============================================
// CONSUMER
// ============================================

pub struct ConcurrentConsumer {
    transport: Arc<dyn QueueTransport>,
    processor: EventProcessor,
    settings: ConsumerSettings,
    counters: Arc<Counters>,
}

/// How one channel session ended
enum SessionEnd {
    Shutdown,
    Lost { error: Error, healthy: bool },
}

impl ConcurrentConsumer {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        processor: EventProcessor,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            transport,
            processor,
            settings,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Consume until `shutdown` flips to true.
    ///
    /// Transport failures reconnect with exponential backoff. Only after
    /// `max_restarts` consecutive failed sessions does this return an error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<ConsumerStats> {
        let workers = self.settings.workers.max(1);
        let permits = Arc::new(Semaphore::new(workers));
        let mut backoff = self.settings.backoff_initial;
        let mut failures: u32 = 0;

        tracing::info!(
            queue = %self.settings.queue,
            workers,
            "consumer starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let error = match self.open_channel(workers).await {
                Ok(handle) => {
                    let end = self.session(&handle, &permits, &mut shutdown).await;
                    match end {
                        SessionEnd::Shutdown => {
                            self.drain(&permits, workers).await;
                            handle.close().await;
                            break;
                        }
                        SessionEnd::Lost { error, healthy } => {
                            handle.close().await;
                            if healthy {
                                failures = 0;
                                backoff = self.settings.backoff_initial;
                            }
                            error
                        }
                    }
                }
                Err(e) => e,
            };

            failures += 1;
            self.counters.restarts.fetch_add(1, Ordering::Relaxed);
            if failures > self.settings.max_restarts {
                tracing::error!(
                    failures,
                    error = %error,
                    "consumer exceeded restart limit"
                );
                self.drain(&permits, workers).await;
                return Err(Error::Unexpected(format!(
                    "consumer gave up after {} restarts: {}",
                    self.settings.max_restarts, error
                )));
            }

            tracing::warn!(
                error = %error,
                attempt = failures,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                "queue channel lost, reconnecting"
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    self.drain(&permits, workers).await;
                    break;
                }
            }
            backoff = next_backoff(backoff, self.settings.backoff_max);
        }

        let stats = self.counters.snapshot();
        tracing::info!(
            delivered = stats.delivered,
            acked = stats.acked,
            requeued = stats.requeued,
            abandoned = stats.abandoned,
            timed_out = stats.timed_out,
            restarts = stats.restarts,
            "consumer stopped"
        );
        Ok(stats)
    }

    async fn open_channel(&self, prefetch: usize) -> Result<ChannelHandle> {
        let transport = Arc::clone(&self.transport);
        let queue = self.settings.queue.clone();
        let channel = tokio::task::spawn_blocking(move || {
            transport.declare(&queue)?;
            transport.open_channel(&queue, prefetch)
        })
        .await
        .map_err(|e| Error::Unexpected(format!("channel open join error: {}", e)))??;

        let handle = ChannelHandle::new(channel);
        tracing::info!(channel_id = %handle.id(), "subscribed to queue");
        Ok(handle)
    }

    async fn session(
        &self,
        handle: &ChannelHandle,
        permits: &Arc<Semaphore>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let opened = Instant::now();
        let mut heartbeat = tokio::spawn(heartbeat_loop(
            handle.clone(),
            self.settings.heartbeat_interval,
        ));
        let mut poll = tokio::time::interval(self.settings.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                _ = wait_for_shutdown(shutdown) => break SessionEnd::Shutdown,
                beat = &mut heartbeat => {
                    let error = match beat {
                        Ok(e) => e,
                        Err(e) => Error::Unexpected(format!("heartbeat task failed: {}", e)),
                    };
                    break SessionEnd::Lost {
                        error,
                        healthy: opened.elapsed() >= self.settings.heartbeat_interval,
                    };
                }
                _ = poll.tick() => {
                    if let Err(error) = self.pump(handle, permits).await {
                        break SessionEnd::Lost {
                            error,
                            healthy: opened.elapsed() >= self.settings.heartbeat_interval,
                        };
                    }
                }
            }
        };

        heartbeat.abort();
        end
    }

    /// Pull deliveries while a worker slot is free
    async fn pump(&self, handle: &ChannelHandle, permits: &Arc<Semaphore>) -> Result<()> {
        loop {
            let Ok(permit) = Arc::clone(permits).try_acquire_owned() else {
                return Ok(());
            };
            let Some(delivery) = handle.call(|channel| channel.poll()).await? else {
                return Ok(());
            };
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);

            let worker = Worker {
                processor: self.processor.clone(),
                handle: handle.clone(),
                deadline: self.settings.event_deadline,
                counters: Arc::clone(&self.counters),
            };
            tokio::spawn(worker.handle(delivery, permit));
        }
    }

    /// Wait for every in-flight worker to finish
    async fn drain(&self, permits: &Arc<Semaphore>, workers: usize) {
        let total = u32::try_from(workers).unwrap_or(u32::MAX);
        if let Ok(all) = permits.acquire_many(total).await {
            drop(all);
        }
    }
}

async fn heartbeat_loop(handle: ChannelHandle, every: Duration) -> Error {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = handle.call(|channel| channel.heartbeat()).await {
            return e;
        }
        if !handle.is_open() {
            return Error::ChannelClosed(handle.id().to_string());
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    let next = current + current;
    if next > max {
        max
    } else {
        next
    }
}

// ============================================
// WORKER
// ============================================

struct Worker {
    processor: EventProcessor,
    handle: ChannelHandle,
    deadline: Option<Duration>,
    counters: Arc<Counters>,
}

impl Worker {
    /// The permit is a worker slot. Past the deadline the message is
    /// requeued, but the slot stays taken until the blocking call returns.
    async fn handle(self, delivery: Delivery, permit: OwnedSemaphorePermit) {
        let (ack, slot) = self.process(&delivery, permit).await;
        self.settle(delivery.tag, ack).await;
        drop(slot);
    }

    /// Process the delivery; true means it may be acknowledged. The permit
    /// comes back unless the blocking task still owns it.
    async fn process(
        &self,
        delivery: &Delivery,
        permit: OwnedSemaphorePermit,
    ) -> (bool, Option<OwnedSemaphorePermit>) {
        let message: QueueMessage = match serde_json::from_slice(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(tag = delivery.tag, error = %e, "dropping undecodable queue message");
                return (true, Some(permit));
            }
        };
        let conversation_id = message.conversation_id;

        let processor = self.processor.clone();
        let id = conversation_id.clone();
        let task = tokio::task::spawn_blocking(move || {
            let report = processor.run(EventSource::Conversation(&id));
            (report, permit)
        });

        let joined = match self.deadline {
            Some(deadline) => match tokio::time::timeout(deadline, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                        "event exceeded deadline, requeueing"
                    );
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                    return (false, None);
                }
            },
            None => task.await,
        };

        let (report, permit) = match joined {
            Ok((report, permit)) => (Ok(report), Some(permit)),
            Err(e) => (Err(e), None),
        };
        let ack = match report {
            Ok(Ok(report)) => match report.single() {
                Some(outcome) => {
                    tracing::debug!(
                        conversation_id = %conversation_id,
                        outcome = outcome.label(),
                        redelivered = delivery.redelivered,
                        "delivery processed"
                    );
                    outcome.should_ack()
                }
                None => true,
            },
            Ok(Err(e)) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %e,
                    code = e.code(),
                    "store unavailable while processing, requeueing"
                );
                false
            }
            Err(e) => {
                tracing::error!(conversation_id = %conversation_id, error = %e, "worker task failed");
                false
            }
        };
        (ack, permit)
    }

    async fn settle(&self, tag: u64, ack: bool) {
        if !self.handle.is_open() {
            tracing::debug!(
                channel_id = %self.handle.id(),
                tag,
                "original channel closed, leaving delivery to the broker"
            );
            self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let result = if ack {
            self.handle.call(move |channel| channel.ack(tag)).await
        } else {
            self.handle.call(move |channel| channel.nack(tag, true)).await
        };

        match result {
            Ok(()) if ack => {
                self.counters.acked.fetch_add(1, Ordering::Relaxed);
            }
            Ok(()) => {
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    channel_id = %self.handle.id(),
                    tag,
                    ack,
                    error = %e,
                    "settlement failed, broker will redeliver"
                );
            }
        }
    }
}
