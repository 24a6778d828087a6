//! RabbitMQ adapter.
//!
//! Declares the durable work queue with its dead-letter routing, consumes with
//! a prefetch of one and manual acknowledgement, and maps lapin deliveries onto
//! [`Delivery`].

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use tracing::{debug, info, warn};

use crate::config::WorkerConfig;
use crate::consumer::{DeliverySource, IntakeControl};
use crate::delivery::{Acknowledger, Delivery, DeliveryProperties};
use crate::error::WorkerError;
use crate::headers::{HeaderValue, Headers};
use crate::identity::WorkerIdentity;

const PREFETCH: u16 = 1;

/// Open connection and channel. Close explicitly once the loop has drained.
pub struct AmqpConnection {
    connection: Connection,
    channel: Channel,
}

impl AmqpConnection {
    pub async fn close(self) {
        if let Err(e) = self.channel.close(200, "worker shutdown").await {
            debug!(error = %e, "channel close failed");
        }
        if let Err(e) = self.connection.close(200, "worker shutdown").await {
            warn!(error = %e, "connection close failed");
        }
    }
}

/// Connect, declare the queue, set QoS and start consuming.
///
/// Everything except QoS is fatal: without prefetch the worker still runs,
/// just with more unacknowledged deliveries buffered client-side.
pub async fn connect(
    config: &WorkerConfig,
    identity: &WorkerIdentity,
) -> Result<(AmqpSource, AmqpIntake, AmqpConnection), WorkerError> {
    let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
        .await
        .map_err(|e| WorkerError::Setup(format!("connect: {}", e)))?;

    let channel = connection
        .create_channel()
        .await
        .map_err(|e| WorkerError::Setup(format!("open channel: {}", e)))?;

    channel
        .queue_declare(
            &config.queue_name,
            QueueDeclareOptions {
                durable: true,
                ..QueueDeclareOptions::default()
            },
            dead_letter_arguments(config),
        )
        .await
        .map_err(|e| WorkerError::Setup(format!("declare queue {}: {}", config.queue_name, e)))?;

    if let Err(e) = channel
        .basic_qos(PREFETCH, BasicQosOptions::default())
        .await
    {
        warn!(worker_id = %identity.worker_id, error = %e, "failed to set QoS prefetch");
    }

    let consumer_tag = identity.consumer_tag();
    let consumer = channel
        .basic_consume(
            &config.queue_name,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| WorkerError::Setup(format!("consume: {}", e)))?;

    info!(
        worker_id = %identity.worker_id,
        pod = %identity.pod_name,
        queue = %config.queue_name,
        consumer_tag = %consumer_tag,
        broker = %config.rabbitmq_url_safe(),
        "consuming"
    );

    Ok((
        AmqpSource {
            consumer,
            consumer_tag: consumer_tag.clone(),
        },
        AmqpIntake {
            channel: channel.clone(),
            consumer_tag,
        },
        AmqpConnection {
            connection,
            channel,
        },
    ))
}

fn dead_letter_arguments(config: &WorkerConfig) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(config.dead_letter_exchange.as_str().into()),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(config.dead_letter_routing_key().into()),
    );
    args
}

/// Deliveries from a lapin consumer.
pub struct AmqpSource {
    consumer: Consumer,
    consumer_tag: String,
}

#[async_trait]
impl DeliverySource for AmqpSource {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, WorkerError>> {
        let next = self.consumer.next().await?;
        Some(
            next.map(|delivery| convert(delivery, &self.consumer_tag))
                .map_err(WorkerError::from),
        )
    }
}

fn convert(delivery: lapin::message::Delivery, consumer_tag: &str) -> Delivery {
    let props = &delivery.properties;
    let properties = DeliveryProperties {
        message_id: props.message_id().as_ref().map(|v| v.as_str().to_string()),
        correlation_id: props
            .correlation_id()
            .as_ref()
            .map(|v| v.as_str().to_string()),
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        consumer_tag: consumer_tag.to_string(),
    };

    let headers = props
        .headers()
        .as_ref()
        .map(convert_headers)
        .unwrap_or_default();

    Delivery::new(
        delivery.data,
        headers,
        properties,
        Box::new(AmqpAcker(delivery.acker)),
    )
}

/// String-like header values only. Other AMQP types carry no trace or id data.
fn convert_headers(table: &FieldTable) -> Headers {
    let mut headers = Headers::new();
    for (key, value) in table.inner() {
        if let Some(value) = header_value(value) {
            headers.insert(key.as_str(), value);
        }
    }
    headers
}

fn header_value(value: &AMQPValue) -> Option<HeaderValue> {
    match value {
        AMQPValue::LongString(s) => Some(HeaderValue::Bytes(s.as_bytes().to_vec())),
        AMQPValue::ShortString(s) => Some(HeaderValue::Text(s.as_str().to_string())),
        AMQPValue::ByteArray(b) => Some(HeaderValue::Bytes(b.as_slice().to_vec())),
        _ => None,
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn acknowledge(&self) -> Result<(), WorkerError> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| WorkerError::Settle {
                action: "ack",
                reason: e.to_string(),
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), WorkerError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|e| WorkerError::Settle {
                action: if requeue { "requeue" } else { "dead-letter" },
                reason: e.to_string(),
            })
    }
}

/// Cancels this worker's consumer so the broker stops delivering to it.
pub struct AmqpIntake {
    channel: Channel,
    consumer_tag: String,
}

#[async_trait]
impl IntakeControl for AmqpIntake {
    async fn stop_intake(&self) -> Result<(), WorkerError> {
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| WorkerError::StopIntake(e.to_string()))
    }
}
