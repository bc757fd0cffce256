//! Periodic submission lookup and orphan scanning.
//!
//! One task owns both tickers, so runs of the same kind never overlap and
//! external triggers coalesce with the schedule.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::Controller;

/// Configuration for the lookup task.
#[derive(Clone, Debug)]
pub struct LookupConfig {
    /// How often to poll for newly accepted submissions.
    pub interval: Duration,
    /// How often to scan for orphaned running submissions.
    pub orphan_interval: Duration,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(2000),
            orphan_interval: Duration::from_millis(300_000),
        }
    }
}

/// Background task feeding the controller with work.
pub struct LookupTask {
    controller: Arc<Controller>,
    config: LookupConfig,
    trigger: Arc<Notify>,
    orphan_trigger: Arc<Notify>,
}

impl LookupTask {
    pub fn new(controller: Arc<Controller>, config: LookupConfig) -> Self {
        Self {
            controller,
            config,
            trigger: Arc::new(Notify::new()),
            orphan_trigger: Arc::new(Notify::new()),
        }
    }

    /// Handle that wakes the submission scan ahead of its next tick.
    pub fn trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.trigger)
    }

    /// Handle that wakes the orphan scan ahead of its next tick.
    pub fn orphan_trigger(&self) -> Arc<Notify> {
        Arc::clone(&self.orphan_trigger)
    }

    /// Run until the shutdown token fires. Starts with an orphan scan so
    /// submissions interrupted by a previous crash resume immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            lookup_interval_ms = self.config.interval.as_millis(),
            orphan_interval_ms = self.config.orphan_interval.as_millis(),
            "lookup task started"
        );

        self.controller.recover_orphans(&shutdown).await;

        let mut lookup_tick = tokio::time::interval(self.config.interval);
        lookup_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut orphan_tick = tokio::time::interval_at(
            Instant::now() + self.config.orphan_interval,
            self.config.orphan_interval,
        );
        orphan_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("lookup task shutting down");
                    break;
                }
                _ = lookup_tick.tick() => self.scan_submissions(&shutdown).await,
                _ = self.trigger.notified() => self.scan_submissions(&shutdown).await,
                _ = orphan_tick.tick() => self.controller.recover_orphans(&shutdown).await,
                _ = self.orphan_trigger.notified() => {
                    self.controller.recover_orphans(&shutdown).await
                }
            }
        }
    }

    /// Claim every currently accepted submission and spawn its loop.
    async fn scan_submissions(&self, shutdown: &CancellationToken) {
        loop {
            match self.controller.claim_next_submission().await {
                Ok(Some(submission)) => {
                    info!(submission_id = %submission.id, "starting submission");
                    tokio::spawn(
                        Arc::clone(&self.controller)
                            .handle_submission(submission, shutdown.child_token()),
                    );
                }
                Ok(None) => break,
                Err(err) => {
                    error!(error = %err, "submission lookup failed");
                    break;
                }
            }
        }
    }
}
