//! Consume loop and graceful shutdown driven through the in-memory source.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{processor, send_email_for, SEND_EMAIL, WORKER_ID};
use notifications_worker::testing::{json_delivery, RecordingAcknowledger, ScriptedHandler, VecSource};
use notifications_worker::{
    spawn_consume_loop, Disposition, ShutdownCoordinator, ShutdownOutcome,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn mixed_batch_gets_one_terminal_action_each() {
    let handler = ScriptedHandler::failing_times(1);
    let shutdown = CancellationToken::new();

    let good = RecordingAcknowledger::new();
    let poison = RecordingAcknowledger::new();
    let retried = RecordingAcknowledger::new();
    let (source, _intake) = VecSource::closing(vec![
        json_delivery("oops", &poison),
        json_delivery(&send_email_for("APP1"), &retried),
        json_delivery(&send_email_for("APP2"), &good),
    ]);

    let stats = spawn_consume_loop(source, Arc::new(processor(&handler, &shutdown)))
        .await
        .unwrap();

    assert_eq!(stats.poisoned, 1);
    assert_eq!(stats.acknowledged, 2);
    assert_eq!(poison.dispositions(), vec![Disposition::DeadLetter]);
    assert_eq!(retried.dispositions(), vec![Disposition::Acknowledge]);
    assert_eq!(good.dispositions(), vec![Disposition::Acknowledge]);

    // First call for APP1 fails, second succeeds, APP2 succeeds first time.
    let calls: Vec<_> = handler
        .calls()
        .into_iter()
        .map(|c| (c.application_id, c.attempt))
        .collect();
    assert_eq!(
        calls,
        vec![
            ("APP1".to_string(), 1),
            ("APP1".to_string(), 2),
            ("APP2".to_string(), 1)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn idle_worker_shuts_down_promptly() {
    let handler = ScriptedHandler::always_succeeding();
    let shutdown = CancellationToken::new();
    let (source, intake) = VecSource::held_open(Vec::new());

    let consume = spawn_consume_loop(source, Arc::new(processor(&handler, &shutdown)));
    let coordinator =
        ShutdownCoordinator::new(shutdown.clone(), Duration::from_secs(10), WORKER_ID);

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let outcome = coordinator.run(&intake, consume).await;

    assert!(matches!(outcome, ShutdownOutcome::LoopFinished(stats) if stats.processed() == 0));
    assert_eq!(intake.stop_calls(), 1);
    assert_eq!(start.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn shutdown_mid_backoff_requeues_in_flight_and_stops_intake() {
    let handler = ScriptedHandler::always_failing();
    let shutdown = CancellationToken::new();

    let in_flight = RecordingAcknowledger::new();
    let later: Vec<_> = (0..2).map(|_| RecordingAcknowledger::new()).collect();
    let mut deliveries = vec![json_delivery(SEND_EMAIL, &in_flight)];
    deliveries.extend(later.iter().map(|a| json_delivery(SEND_EMAIL, a)));
    let (source, intake) = VecSource::held_open(deliveries);

    let consume = spawn_consume_loop(source, Arc::new(processor(&handler, &shutdown)));
    let coordinator =
        ShutdownCoordinator::new(shutdown.clone(), Duration::from_secs(10), WORKER_ID);

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        trigger.cancel();
    });

    let outcome = coordinator.run(&intake, consume).await;
    let ShutdownOutcome::LoopFinished(stats) = outcome else {
        panic!("expected loop to finish, got {:?}", outcome);
    };

    assert_eq!(in_flight.dispositions(), vec![Disposition::Requeue]);
    assert_eq!(handler.call_count(), 1);
    assert_eq!(stats.acknowledged + stats.exhausted + stats.poisoned, 0);

    // Anything pulled after cancellation is requeued untouched; the rest stays queued.
    for acker in &later {
        let dispositions = acker.dispositions();
        assert!(dispositions.is_empty() || dispositions == vec![Disposition::Requeue]);
    }
    assert_eq!(stats.requeued as usize + intake.remaining(), 3);
}

#[tokio::test(start_paused = true)]
async fn grace_period_bounds_the_wait() {
    let handler = ScriptedHandler::always_failing();
    let shutdown = CancellationToken::new();
    let acker = RecordingAcknowledger::new();
    let (source, intake) = VecSource::held_open(vec![json_delivery(SEND_EMAIL, &acker)]);

    // A processor that ignores the shared token keeps backing off after shutdown.
    let detached = CancellationToken::new();
    let consume = spawn_consume_loop(source, Arc::new(processor(&handler, &detached)));
    let coordinator =
        ShutdownCoordinator::new(shutdown.clone(), Duration::from_secs(2), WORKER_ID);

    // Let the first attempt fail and the backoff begin.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.call_count(), 1);

    shutdown.cancel();
    let start = Instant::now();
    let outcome = coordinator.run(&intake, consume).await;

    assert_eq!(outcome, ShutdownOutcome::GraceElapsed);
    assert_eq!(start.elapsed(), Duration::from_secs(2));
    assert!(acker.dispositions().is_empty());
}
