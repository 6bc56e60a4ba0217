//! Stuck-job detector and reaper.
//!
//! Independent cadence from the dispatcher. A PROCESSING row older than the
//! job timeout means a crashed or hung worker: recoverable while attempts
//! remain, failed once they are exhausted. Old PENDING rows are a different
//! signal entirely (dispatch starvation) and are reported, never mutated.

use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;
use crate::config::EngineConfig;
use crate::database::repositories::JobRepository;

/// Result of one reaper scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapOutcome {
    /// Stuck jobs reset to PENDING with an attempt consumed.
    pub reset: u64,
    /// Stuck jobs failed because no attempts remained.
    pub failed: u64,
}

pub struct Reaper {
    repo: Arc<dyn JobRepository>,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl Reaper {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        config: EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            repo,
            config,
            cancel,
        }
    }

    /// Run the periodic scan loop until cancellation.
    pub async fn run(self: Arc<Self>) {
        info!(
            interval_secs = self.config.reaper_interval_secs,
            job_timeout_secs = self.config.job_timeout_secs,
            "reaper started"
        );

        let mut interval = tokio::time::interval(self.config.reaper_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(e) = self.scan().await {
                error!(error = %e, "reaper scan failed");
            }
        }

        info!("reaper stopped");
    }

    /// One scan: reclaim or fail stuck PROCESSING jobs, then report stale
    /// PENDING jobs.
    pub async fn scan(&self) -> Result<ReapOutcome> {
        let now = chrono::Utc::now();
        let outcome = self.reclaim(now - self.config.job_timeout()).await?;

        let stale_cutoff = now - self.config.stale_pending_threshold();
        let stale = self.repo.count_stale_pending(stale_cutoff).await?;
        if stale > 0 {
            // Not auto-remediated: forcing these through could mask a
            // misconfigured concurrency cap.
            warn!(
                stale,
                threshold_secs = self.config.stale_pending_threshold_secs,
                "pending jobs exceed the stale threshold; check dispatch capacity"
            );
        }

        Ok(outcome)
    }

    /// Reclaim PROCESSING jobs started before `cutoff`.
    pub async fn reclaim(&self, cutoff: chrono::DateTime<chrono::Utc>) -> Result<ReapOutcome> {
        let reset = self.repo.reset_stuck_jobs(cutoff).await?;
        let failed = self.repo.fail_exhausted_stuck_jobs(cutoff).await?;

        if reset > 0 {
            warn!(reset, "reset stuck jobs to pending");
        }
        if failed > 0 {
            warn!(failed, "failed stuck jobs with exhausted attempts");
        }

        Ok(ReapOutcome { reset, failed })
    }
}
