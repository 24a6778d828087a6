//! Worker identity and per-message correlation.

use uuid::Uuid;

use crate::command::SendEmailCommand;
use crate::headers::Headers;

pub const MESSAGE_ID_HEADER: &str = "message_id";
pub const CORRELATION_ID_HEADER: &str = "correlation_id";

/// Identity of this worker process, attached to every log line and span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    /// Short random id so instances can be told apart.
    pub worker_id: String,
    pub pod_name: String,
    pub namespace: String,
    pub node_name: String,
}

impl WorkerIdentity {
    /// Generate a fresh worker id for this process.
    pub fn generate(
        pod_name: impl Into<String>,
        namespace: impl Into<String>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            worker_id: new_worker_id(),
            pod_name: pod_name.into(),
            namespace: namespace.into(),
            node_name: node_name.into(),
        }
    }

    /// Create with a fixed worker id.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            pod_name: String::new(),
            namespace: String::new(),
            node_name: String::new(),
        }
    }

    /// Consumer tag used for targeted cancellation of intake.
    pub fn consumer_tag(&self) -> String {
        format!("notifications-{}", self.worker_id)
    }
}

fn new_worker_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Message and correlation ids derived for one delivery.
///
/// Both fields are non-empty once derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationIdentity {
    pub message_id: String,
    pub correlation_id: String,
}

impl CorrelationIdentity {
    /// Derive ids from broker properties, headers and the decoded command.
    ///
    /// Message id: property, then header, then a fresh random token.
    /// Correlation id: property, then header, then the command's application
    /// id, then the message id.
    pub fn derive(
        property_message_id: Option<&str>,
        property_correlation_id: Option<&str>,
        headers: &Headers,
        command: &SendEmailCommand,
    ) -> Self {
        let message_id = non_empty(property_message_id)
            .or_else(|| headers.get_str(MESSAGE_ID_HEADER))
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let correlation_id = non_empty(property_correlation_id)
            .or_else(|| headers.get_str(CORRELATION_ID_HEADER))
            .or_else(|| non_empty(Some(command.application_id.as_str())))
            .map(str::to_string)
            .unwrap_or_else(|| message_id.clone());

        Self {
            message_id,
            correlation_id,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.is_empty())
}
