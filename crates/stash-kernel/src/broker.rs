//! Broker seam used by the drain engine.
//!
//! A [`Delivery`] is one claimed message. Claims are exclusive until the
//! message is acknowledged or negatively acknowledged through its handle.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Message `type` of the top-level signal that finalizes a transaction.
pub const COMMIT_KIND: &str = "commit";

/// Header on a commit signal naming the transaction queue.
pub const QUEUE_HEADER: &str = "queue";

/// Message headers, normalized to JSON values by the broker adapter.
pub type Headers = Map<String, Value>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("broker {operation} on queue '{queue}' failed: {reason}")]
    Queue {
        operation: &'static str,
        queue: String,
        reason: String,
    },
    #[error("acknowledgement failed: {0}")]
    Acknowledge(String),
}

impl BrokerError {
    pub fn queue(operation: &'static str, queue: &str, reason: impl fmt::Display) -> Self {
        Self::Queue {
            operation,
            queue: queue.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Settles a claimed message.
#[async_trait]
pub trait Acknowledge: Send + Sync + 'static {
    async fn ack(&self) -> Result<(), BrokerError>;
    /// Negatively acknowledges; `requeue` puts the message back for redelivery.
    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// Outcome of a conditional queue deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDeletion {
    Deleted,
    /// The queue still held messages and was left in place.
    NotEmpty { messages: u32 },
}

/// Queue operations the drain engine needs from the broker.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Creates the queue if it does not exist yet.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Appends a message of the given `kind` to `queue`.
    async fn publish(
        &self,
        queue: &str,
        kind: &str,
        headers: Headers,
        body: Vec<u8>,
    ) -> Result<(), BrokerError>;

    /// Claims a single message, or returns `None` when the queue has nothing ready.
    async fn pull(&self, queue: &str) -> Result<Option<Delivery>, BrokerError>;

    /// Deletes the queue only if it holds no messages at the time of the call.
    async fn delete_queue_if_empty(&self, queue: &str) -> Result<QueueDeletion, BrokerError>;
}

/// A claimed message plus the handle that settles it.
pub struct Delivery {
    pub kind: Option<String>,
    pub headers: Headers,
    pub body: Vec<u8>,
    handle: Arc<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        kind: Option<String>,
        headers: Headers,
        body: Vec<u8>,
        handle: Arc<dyn Acknowledge>,
    ) -> Self {
        Self {
            kind,
            headers,
            body,
            handle,
        }
    }

    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn header_str(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(Value::as_str)
    }

    /// Shared settle handle, for settling after the delivery itself is gone.
    pub fn handle(&self) -> Arc<dyn Acknowledge> {
        self.handle.clone()
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.handle.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.handle.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("kind", &self.kind)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .finish()
    }
}
