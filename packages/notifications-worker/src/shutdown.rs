//! Graceful shutdown.
//!
//! On SIGINT/SIGTERM the shared token is cancelled. The coordinator then stops
//! broker intake, so nothing new is delivered, and waits up to the grace period
//! for the in-flight delivery to reach its terminal action.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::consumer::{IntakeControl, LoopStats};

/// How the consume loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The loop returned on its own, or within the grace period.
    LoopFinished(LoopStats),
    /// The grace period ran out and the loop task was aborted.
    GraceElapsed,
    /// The loop task panicked or was cancelled.
    LoopFailed(String),
}

pub struct ShutdownCoordinator {
    shutdown: CancellationToken,
    grace: Duration,
    worker_id: String,
}

impl ShutdownCoordinator {
    pub fn new(shutdown: CancellationToken, grace: Duration, worker_id: impl Into<String>) -> Self {
        Self {
            shutdown,
            grace,
            worker_id: worker_id.into(),
        }
    }

    /// Wait for either the loop to end or shutdown to be requested, then drain.
    pub async fn run(
        &self,
        intake: &dyn IntakeControl,
        mut consume: JoinHandle<LoopStats>,
    ) -> ShutdownOutcome {
        tokio::select! {
            joined = &mut consume => return self.joined(joined),
            _ = self.shutdown.cancelled() => {}
        }

        info!(
            worker_id = %self.worker_id,
            grace_secs = self.grace.as_secs(),
            "shutdown requested, stopping intake"
        );

        if let Err(e) = intake.stop_intake().await {
            warn!(worker_id = %self.worker_id, error = %e, "failed to cancel consumer");
        }

        match tokio::time::timeout(self.grace, &mut consume).await {
            Ok(joined) => self.joined(joined),
            Err(_) => {
                warn!(
                    worker_id = %self.worker_id,
                    grace_secs = self.grace.as_secs(),
                    "grace period elapsed, abandoning in-flight message"
                );
                consume.abort();
                ShutdownOutcome::GraceElapsed
            }
        }
    }

    fn joined(&self, joined: Result<LoopStats, tokio::task::JoinError>) -> ShutdownOutcome {
        match joined {
            Ok(stats) => {
                info!(worker_id = %self.worker_id, "consume loop finished");
                ShutdownOutcome::LoopFinished(stats)
            }
            Err(e) => {
                error!(worker_id = %self.worker_id, error = %e, "consume loop task failed");
                ShutdownOutcome::LoopFailed(e.to_string())
            }
        }
    }
}

/// Cancel `shutdown` on the first SIGINT or SIGTERM.
pub fn install_signal_handlers(shutdown: CancellationToken, worker_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let signal = wait_for_signal().await;
        info!(worker_id = %worker_id, signal, "received shutdown signal");
        shutdown.cancel();
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "SIGINT"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::DeliverySource;
    use crate::testing::VecSource;

    fn coordinator(token: &CancellationToken, grace_secs: u64) -> ShutdownCoordinator {
        ShutdownCoordinator::new(token.clone(), Duration::from_secs(grace_secs), "test0001")
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_ending_first_skips_stop_intake() {
        let token = CancellationToken::new();
        let (_source, intake) = VecSource::closing(Vec::new());
        let handle = tokio::spawn(async { LoopStats::default() });

        let outcome = coordinator(&token, 10).run(&intake, handle).await;

        assert_eq!(outcome, ShutdownOutcome::LoopFinished(LoopStats::default()));
        assert_eq!(intake.stop_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_intake_and_waits_for_loop() {
        let token = CancellationToken::new();
        let (mut source, intake) = VecSource::held_open(Vec::new());
        let handle = tokio::spawn(async move {
            while source.next_delivery().await.is_some() {}
            LoopStats::default()
        });

        token.cancel();
        let outcome = coordinator(&token, 10).run(&intake, handle).await;

        assert_eq!(outcome, ShutdownOutcome::LoopFinished(LoopStats::default()));
        assert_eq!(intake.stop_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_elapsed_aborts_loop() {
        let token = CancellationToken::new();
        let (_source, intake) = VecSource::closing(Vec::new());
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            LoopStats::default()
        });
        let start = tokio::time::Instant::now();

        token.cancel();
        let outcome = coordinator(&token, 5).run(&intake, handle).await;

        assert_eq!(outcome, ShutdownOutcome::GraceElapsed);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_loop_is_reported() {
        let token = CancellationToken::new();
        let (_source, intake) = VecSource::closing(Vec::new());
        let handle: JoinHandle<LoopStats> = tokio::spawn(async { panic!("boom") });

        let outcome = coordinator(&token, 5).run(&intake, handle).await;

        assert!(matches!(outcome, ShutdownOutcome::LoopFailed(_)));
    }
}
