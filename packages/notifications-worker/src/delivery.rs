//! The delivery envelope and its terminal actions.
//!
//! A [`Delivery`] is settled by [`Delivery::settle`], which consumes it. The
//! compiler therefore guarantees at most one terminal action per delivery, and
//! the processor's single exit point guarantees at least one.

use async_trait::async_trait;

use crate::error::WorkerError;
use crate::headers::Headers;

/// Terminal action taken for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; remove from the queue.
    Acknowledge,
    /// Reject with requeue so any worker can pick it up again.
    Requeue,
    /// Reject without requeue; the queue topology routes it to the dead-letter queue.
    DeadLetter,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Acknowledge => "ack",
            Disposition::Requeue => "requeue",
            Disposition::DeadLetter => "dead-letter",
        }
    }
}

/// Broker-side acknowledge/reject for one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn acknowledge(&self) -> Result<(), WorkerError>;

    async fn reject(&self, requeue: bool) -> Result<(), WorkerError>;
}

/// Broker-assigned properties of a delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub exchange: String,
    pub routing_key: String,
    pub consumer_tag: String,
}

/// One message pulled from the delivery stream.
pub struct Delivery {
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub properties: DeliveryProperties,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        payload: Vec<u8>,
        headers: Headers,
        properties: DeliveryProperties,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            payload,
            headers,
            properties,
            acker,
        }
    }

    /// Perform the terminal action. Consumes the delivery.
    pub async fn settle(self, disposition: Disposition) -> Result<(), WorkerError> {
        match disposition {
            Disposition::Acknowledge => self.acker.acknowledge().await,
            Disposition::Requeue => self.acker.reject(true).await,
            Disposition::DeadLetter => self.acker.reject(false).await,
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}
