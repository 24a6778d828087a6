//! Per-delivery processing: decode, retry envelope, terminal action.
//!
//! # State machine
//!
//! ```text
//! Decoding ──► Poison                          (dead-letter)
//!    │
//!    └──► Attempting ──► Success               (ack)
//!            ▲   │
//!            │   ├──► Exhausted                (dead-letter)
//!            │   ├──► Interrupted              (requeue)
//!            │   ▼
//!            └─ RetryWait ──► Interrupted      (requeue)
//! ```
//!
//! Cancellation is checked before every attempt and raced against every
//! backoff wait. A handler that has started is never interrupted.
//!
//! Each delivery gets one `notifications.handle` span, continued from the
//! publisher's trace when the headers carry one, and one child
//! `notifications.attempt` span per handler call.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::field::Empty;
use tracing::{error, info, info_span, warn, Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::command::{self, SendEmailCommand};
use crate::delivery::{Delivery, Disposition};
use crate::handler::{CommandHandler, HandlerContext};
use crate::identity::{CorrelationIdentity, WorkerIdentity};
use crate::retry::RetryPolicy;
use crate::telemetry::TraceBridge;

/// How a delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler succeeded on attempt `attempts`.
    Acknowledged { attempts: u32 },
    /// Payload could not be decoded. No handler call was made.
    Poison,
    /// Every attempt failed.
    Exhausted { attempts: u32 },
    /// Shutdown began before the next attempt could start.
    Interrupted { attempts: u32 },
}

impl Outcome {
    pub fn disposition(&self) -> Disposition {
        match self {
            Outcome::Acknowledged { .. } => Disposition::Acknowledge,
            Outcome::Poison | Outcome::Exhausted { .. } => Disposition::DeadLetter,
            Outcome::Interrupted { .. } => Disposition::Requeue,
        }
    }

    /// Number of handler invocations made.
    pub fn attempts(&self) -> u32 {
        match self {
            Outcome::Poison => 0,
            Outcome::Acknowledged { attempts }
            | Outcome::Exhausted { attempts }
            | Outcome::Interrupted { attempts } => *attempts,
        }
    }
}

/// Runs the full pipeline for one delivery at a time.
pub struct DeliveryProcessor {
    handler: Arc<dyn CommandHandler>,
    worker: WorkerIdentity,
    queue_name: String,
    policy: RetryPolicy,
    bridge: TraceBridge,
    shutdown: CancellationToken,
}

impl DeliveryProcessor {
    pub fn new(
        handler: Arc<dyn CommandHandler>,
        worker: WorkerIdentity,
        queue_name: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            handler,
            worker,
            queue_name: queue_name.into(),
            policy: RetryPolicy::default(),
            bridge: TraceBridge::new(),
            shutdown,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn worker(&self) -> &WorkerIdentity {
        &self.worker
    }

    /// Process one delivery to its terminal action.
    ///
    /// The delivery is settled exactly once before this returns. A failed
    /// ack/reject round-trip is logged and recorded on a span but does not
    /// change the returned outcome.
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        let parent = self.bridge.extract(&delivery.headers);

        let span = info_span!(
            "notifications.handle",
            otel.kind = "consumer",
            otel.status_code = Empty,
            otel.status_message = Empty,
            messaging.system = "rabbitmq",
            messaging.destination = %self.queue_name,
            messaging.operation = "process",
            messaging.message_id = Empty,
            amqp.exchange = %delivery.properties.exchange,
            amqp.routing_key = %delivery.properties.routing_key,
            amqp.consumer_tag = %delivery.properties.consumer_tag,
            hireflow.worker_id = %self.worker.worker_id,
            hireflow.application_id = Empty,
            hireflow.job_id = Empty,
            hireflow.correlation_id = Empty,
            "notification.type" = Empty,
        );
        if let Some(message_id) = delivery
            .properties
            .message_id
            .as_deref()
            .filter(|id| !id.is_empty())
        {
            span.record("messaging.message_id", message_id);
        }
        span.set_parent(parent);

        self.run(delivery, &span).instrument(span.clone()).await
    }

    async fn run(&self, delivery: Delivery, span: &Span) -> Outcome {
        let command = match command::decode(&delivery.payload) {
            Ok(command) => command,
            Err(e) => {
                let message_id = delivery.properties.message_id.clone().unwrap_or_default();
                let correlation_id = delivery
                    .properties
                    .correlation_id
                    .clone()
                    .unwrap_or_default();

                record_status(span, false, "invalid json");
                error!(
                    worker_id = %self.worker.worker_id,
                    pod = %self.worker.pod_name,
                    message_id = %message_id,
                    correlation_id = %correlation_id,
                    error = %e,
                    payload = %e.raw_lossy(),
                    "invalid message, sending to DLQ"
                );
                let outcome = Outcome::Poison;
                self.settle(delivery, outcome, &message_id, &correlation_id, span)
                    .await;
                return outcome;
            }
        };

        let ids = CorrelationIdentity::derive(
            delivery.properties.message_id.as_deref(),
            delivery.properties.correlation_id.as_deref(),
            &delivery.headers,
            &command,
        );
        span.record("messaging.message_id", ids.message_id.as_str());
        span.record("hireflow.correlation_id", ids.correlation_id.as_str());
        span.record("hireflow.application_id", command.application_id.as_str());
        span.record("hireflow.job_id", command.job_id);
        span.record("notification.type", command.kind.as_str());

        let (outcome, last_attempt) = self.attempt_loop(&command, &ids, span).await;
        self.report(outcome, &ids, span);

        // The ack belongs to the successful attempt; rejects to the delivery.
        let settle_span = last_attempt.as_ref().unwrap_or(span);
        self.settle(
            delivery,
            outcome,
            &ids.message_id,
            &ids.correlation_id,
            settle_span,
        )
        .await;
        outcome
    }

    /// Runs attempts until one succeeds, the policy is exhausted or shutdown
    /// begins. On success the still-open span of the winning attempt is
    /// returned so the ack can be recorded on it.
    async fn attempt_loop(
        &self,
        command: &SendEmailCommand,
        ids: &CorrelationIdentity,
        span: &Span,
    ) -> (Outcome, Option<Span>) {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;

        loop {
            if self.shutdown.is_cancelled() {
                record_status(span, false, "terminated before attempt; requeue");
                info!(
                    worker_id = %self.worker.worker_id,
                    message_id = %ids.message_id,
                    correlation_id = %ids.correlation_id,
                    attempt,
                    max_attempts,
                    "shutdown in progress, not starting attempt"
                );
                let outcome = Outcome::Interrupted {
                    attempts: attempt - 1,
                };
                return (outcome, None);
            }

            let attempt_span = info_span!(
                "notifications.attempt",
                otel.kind = "internal",
                otel.status_code = Empty,
                otel.status_message = Empty,
                attempt,
            );
            let ctx = HandlerContext {
                trace: attempt_span.context(),
                worker: &self.worker,
                correlation: ids,
                attempt,
            };

            let result = self
                .handler
                .handle(ctx, command)
                .instrument(attempt_span.clone())
                .await;

            let err = match result {
                Ok(()) => {
                    record_status(&attempt_span, true, "ok");
                    let outcome = Outcome::Acknowledged { attempts: attempt };
                    return (outcome, Some(attempt_span));
                }
                Err(e) => e,
            };

            record_status(&attempt_span, false, "handler failed");
            drop(attempt_span);

            warn!(
                worker_id = %self.worker.worker_id,
                pod = %self.worker.pod_name,
                message_id = %ids.message_id,
                correlation_id = %ids.correlation_id,
                attempt,
                max_attempts,
                kind = err.kind(),
                error = %err,
                "handler failed"
            );

            let Some(wait) = self.policy.backoff_after(attempt) else {
                record_status(span, false, "max attempts reached; dlq");
                return (Outcome::Exhausted { attempts: attempt }, None);
            };

            info!(
                worker_id = %self.worker.worker_id,
                message_id = %ids.message_id,
                correlation_id = %ids.correlation_id,
                attempt,
                max_attempts,
                backoff_ms = wait.as_millis() as u64,
                "backing off before retrying"
            );

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    record_status(span, false, "terminated during backoff; requeue");
                    info!(
                        worker_id = %self.worker.worker_id,
                        message_id = %ids.message_id,
                        correlation_id = %ids.correlation_id,
                        attempt,
                        max_attempts,
                        "shutdown during backoff"
                    );
                    return (Outcome::Interrupted { attempts: attempt }, None);
                }
                _ = tokio::time::sleep(wait) => {}
            }

            attempt += 1;
        }
    }

    fn report(&self, outcome: Outcome, ids: &CorrelationIdentity, span: &Span) {
        match outcome {
            Outcome::Acknowledged { attempts } => {
                record_status(span, true, "processed");
                info!(
                    worker_id = %self.worker.worker_id,
                    message_id = %ids.message_id,
                    correlation_id = %ids.correlation_id,
                    attempts,
                    "message processed"
                );
            }
            Outcome::Exhausted { attempts } => {
                error!(
                    worker_id = %self.worker.worker_id,
                    pod = %self.worker.pod_name,
                    message_id = %ids.message_id,
                    correlation_id = %ids.correlation_id,
                    attempts,
                    "max attempts reached, sending to DLQ"
                );
            }
            Outcome::Interrupted { attempts } => {
                info!(
                    worker_id = %self.worker.worker_id,
                    message_id = %ids.message_id,
                    correlation_id = %ids.correlation_id,
                    attempts,
                    "worker terminating, requeueing message"
                );
            }
            Outcome::Poison => {}
        }
    }

    async fn settle(
        &self,
        delivery: Delivery,
        outcome: Outcome,
        message_id: &str,
        correlation_id: &str,
        status_span: &Span,
    ) {
        let disposition = outcome.disposition();
        if let Err(e) = delivery.settle(disposition).await {
            record_status(status_span, false, &format!("{} failed", disposition.as_str()));
            error!(
                worker_id = %self.worker.worker_id,
                pod = %self.worker.pod_name,
                message_id = %message_id,
                correlation_id = %correlation_id,
                disposition = disposition.as_str(),
                error = %e,
                "failed to settle message"
            );
        }
    }
}

/// A status message always marks the exported span as an error, so success
/// only records the code.
fn record_status(span: &Span, ok: bool, message: &str) {
    if ok {
        span.record("otel.status_code", "ok");
    } else {
        span.record("otel.status_code", "error");
        span.record("otel.status_message", message);
    }
}
