//! Durable notification queue between ingestion and the consumer
//!
//! The transport is a trait so the consumer can run against the shipped
//! SQLite broker or a test double. Channels are not safe for concurrent use;
//! callers serialize access themselves.

mod sqlite;

use crate::error::Result;
use crate::model::{ConversationEvent, QueueMessage};

pub use sqlite::{QueueDepth, SqliteBroker, SqliteChannel};

/// One message handed to a channel, pending ack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Valid only on the channel that produced it
    pub tag: u64,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

pub trait QueueTransport: Send + Sync {
    /// Create the queue if missing; idempotent
    fn declare(&self, queue: &str) -> Result<()>;

    /// Persist a message; it survives broker restarts
    fn publish(&self, queue: &str, body: &[u8]) -> Result<()>;

    /// Open a consuming channel that holds at most `prefetch` unacked messages
    fn open_channel(&self, queue: &str, prefetch: usize) -> Result<Box<dyn Channel>>;
}

pub trait Channel: Send {
    fn id(&self) -> &str;

    /// Next ready message, or `None` when empty or the prefetch window is full
    fn poll(&mut self) -> Result<Option<Delivery>>;

    fn ack(&mut self, tag: u64) -> Result<()>;

    fn nack(&mut self, tag: u64, requeue: bool) -> Result<()>;

    /// Keep the channel alive; fails once the broker has closed it
    fn heartbeat(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Declare and publish the lightweight "event is ready" notification
pub fn publish_event(
    transport: &dyn QueueTransport,
    queue: &str,
    event: &ConversationEvent,
) -> Result<QueueMessage> {
    let message = QueueMessage::for_event(event);
    let body = serde_json::to_vec(&message)?;
    transport.declare(queue)?;
    transport.publish(queue, &body)?;
    Ok(message)
}
