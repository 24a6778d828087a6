//! # Notifications worker
//!
//! Consumes `SendEmail` commands from a durable RabbitMQ queue and runs each
//! through a bounded retry envelope before deciding its fate.
//!
//! ```text
//! RabbitMQ ──► AmqpSource ──► consume loop ──► DeliveryProcessor
//!                                                   │
//!                                 decode ──► attempt 1..=N (with backoff)
//!                                                   │
//!                           ack / requeue / dead-letter (exactly once)
//! ```
//!
//! ## Guarantees
//!
//! - At most one delivery in flight per worker (prefetch 1, one task).
//! - Every delivery gets exactly one terminal action.
//! - Undecodable payloads are dead-lettered without calling the handler.
//! - Shutdown never interrupts a running handler; it only skips future
//!   attempts and requeues.
//! - Trace context from the publisher is continued when present.

pub mod amqp;
pub mod command;
pub mod config;
pub mod consumer;
pub mod delivery;
pub mod error;
pub mod handler;
pub mod headers;
pub mod identity;
pub mod processor;
pub mod retry;
pub mod shutdown;
pub mod telemetry;
pub mod testing;

pub use command::SendEmailCommand;
pub use config::WorkerConfig;
pub use consumer::{run_consume_loop, spawn_consume_loop, DeliverySource, IntakeControl, LoopStats};
pub use delivery::{Acknowledger, Delivery, DeliveryProperties, Disposition};
pub use error::WorkerError;
pub use handler::{CommandHandler, HandlerContext, HandlerError, LoggingEmailHandler};
pub use headers::{HeaderValue, Headers};
pub use identity::{CorrelationIdentity, WorkerIdentity};
pub use processor::{DeliveryProcessor, Outcome};
pub use retry::RetryPolicy;
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome};
pub use telemetry::TraceBridge;
