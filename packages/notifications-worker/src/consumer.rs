//! The consume loop.
//!
//! One task pulls deliveries one at a time and runs each through the
//! [`DeliveryProcessor`] before pulling the next. The broker's prefetch of one
//! keeps at most a single unacknowledged delivery in flight. The loop ends when
//! the stream closes, either because the connection went away or because
//! intake was stopped.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::delivery::Delivery;
use crate::error::WorkerError;
use crate::processor::{DeliveryProcessor, Outcome};

/// Ordered stream of deliveries.
#[async_trait]
pub trait DeliverySource: Send {
    /// Next delivery, or `None` once the stream has closed.
    async fn next_delivery(&mut self) -> Option<Result<Delivery, WorkerError>>;
}

/// Stops the broker from handing out new deliveries without dropping the
/// connection, so the in-flight delivery can still be settled.
#[async_trait]
pub trait IntakeControl: Send + Sync {
    async fn stop_intake(&self) -> Result<(), WorkerError>;
}

/// Outcome counters for one run of the loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub acknowledged: u64,
    pub poisoned: u64,
    pub exhausted: u64,
    pub requeued: u64,
    pub stream_errors: u64,
}

impl LoopStats {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Acknowledged { .. } => self.acknowledged += 1,
            Outcome::Poison => self.poisoned += 1,
            Outcome::Exhausted { .. } => self.exhausted += 1,
            Outcome::Interrupted { .. } => self.requeued += 1,
        }
    }

    pub fn processed(&self) -> u64 {
        self.acknowledged + self.poisoned + self.exhausted + self.requeued
    }
}

/// Pull and process deliveries until the source closes.
pub async fn run_consume_loop<S>(mut source: S, processor: Arc<DeliveryProcessor>) -> LoopStats
where
    S: DeliverySource,
{
    let worker_id = processor.worker().worker_id.clone();
    let mut stats = LoopStats::default();

    debug!(worker_id = %worker_id, "consume loop starting");

    while let Some(next) = source.next_delivery().await {
        match next {
            Ok(delivery) => {
                let outcome = processor.process(delivery).await;
                stats.record(outcome);
            }
            Err(e) => {
                stats.stream_errors += 1;
                warn!(worker_id = %worker_id, error = %e, "delivery stream error");
            }
        }
    }

    info!(
        worker_id = %worker_id,
        acknowledged = stats.acknowledged,
        poisoned = stats.poisoned,
        exhausted = stats.exhausted,
        requeued = stats.requeued,
        stream_errors = stats.stream_errors,
        "messages channel closed (connection/channel ended)"
    );

    stats
}

/// Run the consume loop on its own task. The handle resolves once the loop ends.
pub fn spawn_consume_loop<S>(source: S, processor: Arc<DeliveryProcessor>) -> JoinHandle<LoopStats>
where
    S: DeliverySource + 'static,
{
    tokio::spawn(run_consume_loop(source, processor))
}
