//! Error types for the notifications worker.
//!
//! Library code returns these pattern-matchable errors; the binary wraps them
//! with `anyhow` context at the process boundary.

use thiserror::Error;

/// Errors raised by the broker-facing parts of the worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Could not establish the connection, channel, topology or consumer.
    /// Fatal at startup.
    #[error("broker setup failed: {0}")]
    Setup(String),

    /// The delivery stream reported an error while pulling the next message.
    #[error("delivery stream error: {0}")]
    Stream(String),

    /// An acknowledge or reject round-trip failed. Never changes the outcome
    /// already chosen for the delivery.
    #[error("failed to {action} delivery: {reason}")]
    Settle { action: &'static str, reason: String },

    /// Asking the broker to stop intake failed.
    #[error("failed to stop intake: {0}")]
    StopIntake(String),

    /// A retry policy was built with a schedule that does not fit its attempt count.
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(String),
}

impl From<lapin::Error> for WorkerError {
    fn from(err: lapin::Error) -> Self {
        WorkerError::Stream(err.to_string())
    }
}
