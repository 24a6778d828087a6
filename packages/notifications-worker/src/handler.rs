//! The pluggable command handler.
//!
//! The processor treats handlers as black boxes: a handler either succeeds or
//! returns a reason. Once started, a handler always runs to completion;
//! shutdown only affects the retry scaffolding around it.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::command::SendEmailCommand;
use crate::identity::{CorrelationIdentity, WorkerIdentity};

/// Everything a handler gets to know about the attempt it runs in.
#[derive(Debug, Clone)]
pub struct HandlerContext<'a> {
    /// Trace context of the current attempt span.
    pub trace: opentelemetry::Context,
    pub worker: &'a WorkerIdentity,
    pub correlation: &'a CorrelationIdentity,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Why a handler attempt failed.
///
/// The retry envelope retries both kinds the same way; the kind only shows up
/// in logs and span status.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Transient(_) => "transient",
            HandlerError::Permanent(_) => "permanent",
        }
    }
}

/// Executes a decoded command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: HandlerContext<'_>,
        command: &SendEmailCommand,
    ) -> Result<(), HandlerError>;
}

/// Handler that records the notification in the logs instead of calling an
/// email provider.
#[derive(Debug, Default, Clone)]
pub struct LoggingEmailHandler;

#[async_trait]
impl CommandHandler for LoggingEmailHandler {
    async fn handle(
        &self,
        ctx: HandlerContext<'_>,
        command: &SendEmailCommand,
    ) -> Result<(), HandlerError> {
        info!(
            worker_id = %ctx.worker.worker_id,
            pod = %ctx.worker.pod_name,
            correlation_id = %ctx.correlation.correlation_id,
            attempt = ctx.attempt,
            to = %command.to,
            subject = %command.subject,
            application_id = %command.application_id,
            "NOTIFY SendEmail"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_logging_handler_succeeds() {
        let worker = WorkerIdentity::with_worker_id("abcd1234");
        let correlation = CorrelationIdentity {
            message_id: "m-1".to_string(),
            correlation_id: "APP1".to_string(),
        };
        let ctx = HandlerContext {
            trace: opentelemetry::Context::new(),
            worker: &worker,
            correlation: &correlation,
            attempt: 1,
        };

        let result = LoggingEmailHandler
            .handle(ctx, &SendEmailCommand::default())
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(HandlerError::Transient("x".into()).kind(), "transient");
        assert_eq!(HandlerError::Permanent("x".into()).kind(), "permanent");
    }
}
