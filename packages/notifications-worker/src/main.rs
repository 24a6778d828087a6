// Entry point for the notifications worker

use std::sync::Arc;

use anyhow::{Context, Result};
use notifications_worker::{
    amqp, shutdown, spawn_consume_loop, telemetry, DeliveryProcessor, LoggingEmailHandler,
    ShutdownCoordinator, ShutdownOutcome, WorkerConfig, WorkerIdentity,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = WorkerConfig::from_env().context("Failed to load configuration")?;
    let identity = WorkerIdentity::generate(
        config.pod_name.clone(),
        config.pod_namespace.clone(),
        config.node_name.clone(),
    );

    let telemetry = telemetry::init(&config, &identity);

    info!(
        worker_id = %identity.worker_id,
        pod = %identity.pod_name,
        namespace = %identity.namespace,
        node = %identity.node_name,
        queue = %config.queue_name,
        "worker starting"
    );

    let token = CancellationToken::new();
    shutdown::install_signal_handlers(token.clone(), identity.worker_id.clone());

    let result = run(&config, identity, token).await;

    telemetry.shutdown();
    result
}

async fn run(config: &WorkerConfig, identity: WorkerIdentity, token: CancellationToken) -> Result<()> {
    let (source, intake, connection) = amqp::connect(config, &identity)
        .await
        .context("Failed to connect to RabbitMQ")?;

    let worker_id = identity.worker_id.clone();
    let processor = Arc::new(DeliveryProcessor::new(
        Arc::new(LoggingEmailHandler),
        identity,
        config.queue_name.clone(),
        token.clone(),
    ));

    let consume = spawn_consume_loop(source, processor);
    let coordinator = ShutdownCoordinator::new(token, config.shutdown_grace, worker_id.clone());

    match coordinator.run(&intake, consume).await {
        ShutdownOutcome::LoopFinished(stats) => {
            info!(worker_id = %worker_id, processed = stats.processed(), "worker stopped");
        }
        ShutdownOutcome::GraceElapsed => {
            warn!(worker_id = %worker_id, "worker stopped before in-flight message settled");
        }
        ShutdownOutcome::LoopFailed(reason) => {
            warn!(worker_id = %worker_id, reason = %reason, "worker stopped after consume loop failure");
        }
    }

    connection.close().await;
    info!(worker_id = %worker_id, "shutdown complete");
    Ok(())
}
