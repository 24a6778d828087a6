//! Test doubles for the processing pipeline.
//!
//! These stand in for the broker and the business handler so the retry and
//! shutdown logic can be exercised without a RabbitMQ connection.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::command::SendEmailCommand;
use crate::consumer::{DeliverySource, IntakeControl};
use crate::delivery::{Acknowledger, Delivery, DeliveryProperties, Disposition};
use crate::error::WorkerError;
use crate::handler::{CommandHandler, HandlerContext, HandlerError};
use crate::headers::Headers;

/// One recorded handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerCall {
    pub attempt: u32,
    pub worker_id: String,
    pub message_id: String,
    pub correlation_id: String,
    pub application_id: String,
}

#[derive(Default)]
struct ScriptState {
    failures_left: Option<usize>,
    calls: Vec<HandlerCall>,
}

/// Handler that fails a fixed number of times, then succeeds.
///
/// Clones share state, so a test can keep one clone and hand another to the
/// processor.
#[derive(Clone)]
pub struct ScriptedHandler {
    state: Arc<Mutex<ScriptState>>,
    cancel_on_call: Option<(usize, CancellationToken)>,
}

impl ScriptedHandler {
    fn with_failures(failures_left: Option<usize>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState {
                failures_left,
                calls: Vec::new(),
            })),
            cancel_on_call: None,
        }
    }

    pub fn always_succeeding() -> Self {
        Self::with_failures(Some(0))
    }

    /// Fails the first `k` calls, succeeds afterwards.
    pub fn failing_times(k: usize) -> Self {
        Self::with_failures(Some(k))
    }

    pub fn always_failing() -> Self {
        Self::with_failures(None)
    }

    /// Cancel `token` while the `n`th call (1-based) is running.
    pub fn cancel_during_call(mut self, n: usize, token: CancellationToken) -> Self {
        self.cancel_on_call = Some((n, token));
        self
    }

    pub fn calls(&self) -> Vec<HandlerCall> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .calls
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .calls
            .len()
    }

    /// Attempt numbers in call order.
    pub fn attempts(&self) -> Vec<u32> {
        self.calls().iter().map(|c| c.attempt).collect()
    }
}

#[async_trait]
impl CommandHandler for ScriptedHandler {
    async fn handle(
        &self,
        ctx: HandlerContext<'_>,
        command: &SendEmailCommand,
    ) -> Result<(), HandlerError> {
        let (call_number, fail) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.calls.push(HandlerCall {
                attempt: ctx.attempt,
                worker_id: ctx.worker.worker_id.clone(),
                message_id: ctx.correlation.message_id.clone(),
                correlation_id: ctx.correlation.correlation_id.clone(),
                application_id: command.application_id.clone(),
            });
            let fail = match state.failures_left.as_mut() {
                None => true,
                Some(0) => false,
                Some(n) => {
                    *n -= 1;
                    true
                }
            };
            (state.calls.len(), fail)
        };

        if let Some((n, token)) = &self.cancel_on_call {
            if *n == call_number {
                token.cancel();
            }
        }

        if fail {
            Err(HandlerError::Transient(format!(
                "simulated transient failure (call {})",
                call_number
            )))
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct AckState {
    dispositions: Vec<Disposition>,
}

/// Acknowledger that records every terminal action it is asked to perform.
#[derive(Clone, Default)]
pub struct RecordingAcknowledger {
    state: Arc<Mutex<AckState>>,
    fail: bool,
}

impl RecordingAcknowledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records calls but reports every broker round-trip as failed.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn dispositions(&self) -> Vec<Disposition> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .dispositions
            .clone()
    }

    fn record(&self, disposition: Disposition) -> Result<(), WorkerError> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .dispositions
            .push(disposition);

        if self.fail {
            return Err(WorkerError::Settle {
                action: disposition.as_str(),
                reason: "channel closed".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for RecordingAcknowledger {
    async fn acknowledge(&self) -> Result<(), WorkerError> {
        self.record(Disposition::Acknowledge)
    }

    async fn reject(&self, requeue: bool) -> Result<(), WorkerError> {
        self.record(if requeue {
            Disposition::Requeue
        } else {
            Disposition::DeadLetter
        })
    }
}

/// Build a delivery for `payload` settled through `acker`.
pub fn json_delivery(payload: &str, acker: &RecordingAcknowledger) -> Delivery {
    Delivery::new(
        payload.as_bytes().to_vec(),
        Headers::new(),
        DeliveryProperties::default(),
        Box::new(acker.clone()),
    )
}

struct SourceState {
    queued: Mutex<VecDeque<Delivery>>,
    stopped: CancellationToken,
    stop_calls: Mutex<usize>,
}

/// In-memory delivery stream.
///
/// Hands out the queued deliveries in order. Once drained it either closes
/// (like a dropped channel) or, when created with [`VecSource::held_open`],
/// waits until intake is stopped, like a live consumer with an empty queue.
pub struct VecSource {
    state: Arc<SourceState>,
    hold_open: bool,
}

/// Intake handle paired with a [`VecSource`].
#[derive(Clone)]
pub struct VecIntake {
    state: Arc<SourceState>,
}

impl VecSource {
    /// Closes as soon as all deliveries have been handed out.
    pub fn closing(deliveries: Vec<Delivery>) -> (Self, VecIntake) {
        Self::build(deliveries, false)
    }

    /// Stays open after draining until intake is stopped.
    pub fn held_open(deliveries: Vec<Delivery>) -> (Self, VecIntake) {
        Self::build(deliveries, true)
    }

    fn build(deliveries: Vec<Delivery>, hold_open: bool) -> (Self, VecIntake) {
        let state = Arc::new(SourceState {
            queued: Mutex::new(deliveries.into()),
            stopped: CancellationToken::new(),
            stop_calls: Mutex::new(0),
        });
        (
            Self {
                state: state.clone(),
                hold_open,
            },
            VecIntake { state },
        )
    }
}

impl VecIntake {
    pub fn stop_calls(&self) -> usize {
        *self
            .state
            .stop_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Deliveries never handed out because intake stopped first.
    pub fn remaining(&self) -> usize {
        self.state
            .queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl DeliverySource for VecSource {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, WorkerError>> {
        if self.state.stopped.is_cancelled() {
            return None;
        }

        let next = self
            .state
            .queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        match next {
            Some(delivery) => Some(Ok(delivery)),
            None if self.hold_open => {
                self.state.stopped.cancelled().await;
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl IntakeControl for VecIntake {
    async fn stop_intake(&self) -> Result<(), WorkerError> {
        *self
            .state
            .stop_calls
            .lock()
            .unwrap_or_else(|e| e.into_inner()) += 1;
        self.state.stopped.cancel();
        Ok(())
    }
}
