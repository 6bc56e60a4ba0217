//! The job engine.
//!
//! One explicit service object per process: it owns the store handle, the
//! handler registry and the background loops, and every operational control
//! goes through it. Concurrency between the dispatcher tick, administrative
//! force-dispatch and the reaper scan is resolved entirely by the store's
//! atomic claim/mark operations, so the engine itself holds no job state.

pub mod dispatcher;
pub mod handlers;
pub mod reaper;
pub mod retry;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use reaper::{ReapOutcome, Reaper};
pub use retry::{ErrorClass, RetryPolicy, classify};
pub use worker::Executor;

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EngineConfig;
use crate::database::models::{JobCounts, JobDbModel, JobStatus, JobType};
use crate::database::repositories::JobRepository;
use crate::engine::handlers::{AiGenerationPayload, DocumentRenderPayload, HandlerRegistry};
use crate::{Error, Result};

/// Snapshot returned by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub stats: JobCounts,
    /// Pending jobs older than the stale threshold (starvation signal).
    pub stale_pending: u64,
    /// Mean execution duration across completed jobs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_duration_secs: Option<f64>,
    /// Recent jobs; omitted in quiet mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jobs: Option<Vec<JobDbModel>>,
}

/// Outcome of a manual retry request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The job was requeued for immediate dispatch.
    Requeued,
    /// The job was already pending; nothing to do.
    AlreadyPending,
}

/// Maximum jobs included in a non-quiet status response.
const STATUS_JOB_LIMIT: i64 = 100;

pub struct JobEngine {
    config: EngineConfig,
    repo: Arc<dyn JobRepository>,
    dispatcher: Arc<Dispatcher>,
    reaper: Arc<Reaper>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobEngine {
    pub fn new(
        config: EngineConfig,
        repo: Arc<dyn JobRepository>,
        registry: HandlerRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let executor = Arc::new(Executor::new(
            repo.clone(),
            Arc::new(registry),
            RetryPolicy::new(&config.backoff),
            config.handler_timeout(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            repo.clone(),
            executor,
            config.clone(),
            cancel.clone(),
        ));
        let reaper = Arc::new(Reaper::new(repo.clone(), config.clone(), cancel.clone()));

        Ok(Self {
            config,
            repo,
            dispatcher,
            reaper,
            cancel,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repository(&self) -> Arc<dyn JobRepository> {
        self.repo.clone()
    }

    /// Reclaim PROCESSING rows left over from a previous run. Called once at
    /// startup, before the loops begin.
    pub async fn recover_interrupted(&self) -> Result<ReapOutcome> {
        let outcome = self.reaper.reclaim(chrono::Utc::now()).await?;
        if outcome.reset > 0 || outcome.failed > 0 {
            info!(
                reset = outcome.reset,
                failed = outcome.failed,
                "recovered jobs interrupted by a previous shutdown"
            );
        }
        Ok(outcome)
    }

    /// Start the dispatcher and reaper loops.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().expect("engine task list poisoned");
        tasks.push(tokio::spawn(self.dispatcher.clone().run()));
        tasks.push(tokio::spawn(self.reaper.clone().run()));
        info!("job engine started");
    }

    /// Signal the loops to stop and wait for them to finish. In-flight
    /// executions keep running; anything still PROCESSING at next startup is
    /// recovered by `recover_interrupted`.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().expect("engine task list poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("job engine stopped");
    }

    /// Enqueue a new job. Fast and synchronous: validates, writes the row
    /// and returns; execution happens later on a dispatcher tick. The
    /// configured startup delay defers eligibility so the triggering
    /// transaction can settle.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        max_attempts: Option<u32>,
    ) -> Result<String> {
        let max_attempts = max_attempts.unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(Error::validation("max_attempts must be at least 1"));
        }
        validate_payload(job_type, &payload)?;

        let scheduled_for = chrono::Utc::now() + self.config.startup_delay();
        let job = JobDbModel::new(job_type, payload.to_string(), max_attempts, scheduled_for);
        let job_id = job.id.clone();

        self.repo.create_job(&job).await?;
        info!(job_id = %job_id, job_type = %job.job_type, "enqueued job");
        Ok(job_id)
    }

    /// Administrative immediate dispatch: bypasses the schedule gate but
    /// still respects the concurrency ceiling. Retry jobs whose backoff has
    /// elapsed are promoted first; ones still inside their backoff stay
    /// parked.
    pub async fn force_process(&self) -> Result<usize> {
        self.repo.promote_due_retries().await?;
        let processed = self.dispatcher.dispatch(true).await?;
        info!(processed, "force-dispatched jobs");
        Ok(processed)
    }

    /// Run a reaper scan on demand.
    pub async fn cleanup_stuck(&self) -> Result<ReapOutcome> {
        self.reaper.scan().await
    }

    /// Delete terminal jobs older than the retention window.
    pub async fn cleanup_old(&self, retention: Option<chrono::Duration>) -> Result<u64> {
        let retention = retention.unwrap_or_else(|| self.config.retention());
        let cutoff = chrono::Utc::now() - retention;
        let deleted = self
            .repo
            .delete_older_than(
                cutoff,
                &[JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled],
            )
            .await?;
        if deleted > 0 {
            info!(deleted, "deleted old terminal jobs");
        }
        Ok(deleted)
    }

    /// Manually requeue a FAILED or RETRY job. Preserves `attempt_count`, so
    /// repeated manual intervention cannot bypass the attempt ceiling.
    /// Safe to repeat: a job that is already pending is a no-op.
    pub async fn retry_job(&self, id: &str) -> Result<RetryOutcome> {
        let job = self.repo.get_job(id).await?;
        match job.parsed_status() {
            Some(JobStatus::Pending) => Ok(RetryOutcome::AlreadyPending),
            Some(JobStatus::Failed) | Some(JobStatus::Retry) => {
                if self.repo.requeue_for_retry(id).await? {
                    info!(job_id = %id, "manually requeued job");
                    Ok(RetryOutcome::Requeued)
                } else {
                    // Lost a race with a dispatcher promotion or another
                    // operator; report what the row looks like now.
                    let job = self.repo.get_job(id).await?;
                    match job.parsed_status() {
                        Some(JobStatus::Pending) => Ok(RetryOutcome::AlreadyPending),
                        _ => Err(Error::invalid_transition(job.status, "PENDING")),
                    }
                }
            }
            _ => Err(Error::invalid_transition(job.status, "PENDING")),
        }
    }

    /// Cancel a still-pending job. Anything already claimed, terminal or in
    /// backoff fails with an invalid-transition error; cancellation of
    /// in-flight work is deliberately unsupported.
    pub async fn cancel_job(&self, id: &str) -> Result<()> {
        self.repo.cancel_job(id).await?;
        info!(job_id = %id, "cancelled job");
        Ok(())
    }

    /// Current per-status counts plus, unless `quiet`, the most recent jobs.
    pub async fn status(&self, quiet: bool) -> Result<EngineStatus> {
        let stats = self.repo.get_job_counts_by_status().await?;
        let stale_cutoff = chrono::Utc::now() - self.config.stale_pending_threshold();
        let stale_pending = self.repo.count_stale_pending(stale_cutoff).await?;
        let avg_duration_secs = self.repo.average_completed_duration_secs().await?;

        let jobs = if quiet {
            None
        } else {
            Some(self.repo.list_recent_jobs(STATUS_JOB_LIMIT).await?)
        };

        Ok(EngineStatus {
            stats,
            stale_pending,
            avg_duration_secs,
            jobs,
        })
    }
}

/// Reject payloads the job's handler would not be able to parse.
fn validate_payload(job_type: JobType, payload: &serde_json::Value) -> Result<()> {
    let check = match job_type {
        JobType::AiGeneration => {
            serde_json::from_value::<AiGenerationPayload>(payload.clone()).map(|_| ())
        }
        JobType::DocumentRender => {
            serde_json::from_value::<DocumentRenderPayload>(payload.clone()).map(|_| ())
        }
    };
    check.map_err(|e| Error::validation(format!("invalid {} payload: {e}", job_type.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_validation() {
        let good = serde_json::json!({
            "submission_id": "s-1",
            "prompt": "Summarize this",
            "model": "standard",
        });
        assert!(validate_payload(JobType::AiGeneration, &good).is_ok());

        let missing_prompt = serde_json::json!({"submission_id": "s-1", "model": "standard"});
        assert!(validate_payload(JobType::AiGeneration, &missing_prompt).is_err());

        // A valid AI payload is not a valid render payload.
        assert!(validate_payload(JobType::DocumentRender, &good).is_err());
    }
}
