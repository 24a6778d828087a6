// Common test utilities

#![allow(dead_code)]

use std::sync::Arc;

use notifications_worker::testing::{RecordingAcknowledger, ScriptedHandler};
use notifications_worker::{
    Delivery, DeliveryProcessor, DeliveryProperties, Headers, WorkerIdentity,
};
use tokio_util::sync::CancellationToken;

pub const QUEUE: &str = "notifications.commands";
pub const WORKER_ID: &str = "a1b2c3d4";

/// The canonical valid command used across scenarios.
pub const SEND_EMAIL: &str =
    r#"{"type":"email","to":"a@x.com","subject":"hi","applicationId":"APP1","jobId":7}"#;

pub fn processor(handler: &ScriptedHandler, shutdown: &CancellationToken) -> DeliveryProcessor {
    DeliveryProcessor::new(
        Arc::new(handler.clone()),
        WorkerIdentity::with_worker_id(WORKER_ID),
        QUEUE,
        shutdown.clone(),
    )
}

/// Delivery as the broker adapter would build it, with headers and properties.
pub fn delivery(
    payload: &str,
    headers: Headers,
    properties: DeliveryProperties,
    acker: &RecordingAcknowledger,
) -> Delivery {
    Delivery::new(
        payload.as_bytes().to_vec(),
        headers,
        DeliveryProperties {
            routing_key: QUEUE.to_string(),
            consumer_tag: format!("notifications-{}", WORKER_ID),
            ..properties
        },
        Box::new(acker.clone()),
    )
}

/// Command for application `application_id`.
pub fn send_email_for(application_id: &str) -> String {
    format!(
        r#"{{"type":"email","to":"a@x.com","subject":"hi","applicationId":"{}","jobId":7}}"#,
        application_id
    )
}
