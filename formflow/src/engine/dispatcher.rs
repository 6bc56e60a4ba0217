//! Claim-and-dispatch loop.
//!
//! Each tick promotes due retries, claims eligible pending jobs up to the
//! concurrency ceiling and hands each to a detached worker task. Dispatch is
//! fire-and-forget: completion is observed only through subsequent job-store
//! state, never through a held handle, so the loop can never block on a slow
//! handler.

use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::Result;
use crate::config::EngineConfig;
use crate::database::repositories::JobRepository;
use crate::engine::worker::Executor;

pub struct Dispatcher {
    repo: Arc<dyn JobRepository>,
    executor: Arc<Executor>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        executor: Arc<Executor>,
        config: EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            repo,
            executor,
            config,
            cancel,
        }
    }

    /// Run the periodic dispatch loop until cancellation.
    pub async fn run(self: Arc<Self>) {
        info!(
            interval_secs = self.config.dispatch_interval_secs,
            max_concurrent = self.config.max_concurrent,
            "dispatcher started"
        );

        let mut interval = tokio::time::interval(self.config.dispatch_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(e) = self.tick().await {
                // One bad tick must not take the loop down.
                error!(error = %e, "dispatch tick failed");
            }
        }

        info!("dispatcher stopped");
    }

    async fn tick(&self) -> Result<usize> {
        let promoted = self.repo.promote_due_retries().await?;
        if promoted > 0 {
            debug!(promoted, "promoted retry jobs to pending");
        }
        self.dispatch(false).await
    }

    /// Claim up to the available concurrency and spawn a worker per job.
    ///
    /// `ignore_schedule` is the administrative force-dispatch path: the
    /// concurrency ceiling still applies but `scheduled_for` is bypassed.
    pub async fn dispatch(&self, ignore_schedule: bool) -> Result<usize> {
        let processing = self.repo.count_processing().await? as usize;
        let available = self.config.max_concurrent.saturating_sub(processing);
        if available == 0 {
            return Ok(0);
        }

        let claimed = self.repo.claim_next_batch(available, ignore_schedule).await?;
        let count = claimed.len();
        if count > 0 {
            debug!(claimed = count, available, "dispatching claimed jobs");
        }

        for job in claimed {
            let executor = self.executor.clone();
            // Detached: a panicking handler kills only its own task, and the
            // reaper later reclaims the orphaned PROCESSING row.
            tokio::spawn(async move {
                executor.execute(job).await;
            });
        }

        Ok(count)
    }
}
