//! Per-job executor.
//!
//! Runs one claimed job through its handler and reports the outcome back to
//! the store. Every path out of `execute` is a store transition; nothing is
//! kept in memory once the call returns.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::database::models::JobDbModel;
use crate::database::repositories::JobRepository;
use crate::engine::handlers::{ExecutionError, HandlerOutput, HandlerRegistry};
use crate::engine::retry::{ErrorClass, RetryPolicy, classify};

pub struct Executor {
    repo: Arc<dyn JobRepository>,
    registry: Arc<HandlerRegistry>,
    policy: RetryPolicy,
    handler_timeout: Duration,
}

impl Executor {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        registry: Arc<HandlerRegistry>,
        policy: RetryPolicy,
        handler_timeout: Duration,
    ) -> Self {
        Self {
            repo,
            registry,
            policy,
            handler_timeout,
        }
    }

    /// Execute one claimed job to a terminal or retry transition.
    ///
    /// Never returns an error: failures are captured into the job record. A
    /// store transition that itself fails (e.g. the reaper reclaimed the job
    /// first) is logged and dropped; the record already reflects whoever won.
    pub async fn execute(&self, job: JobDbModel) {
        let Some(owner_token) = job.owner_token.clone() else {
            warn!(job_id = %job.id, "dispatched job has no owner token; skipping");
            return;
        };

        debug!(job_id = %job.id, job_type = %job.job_type, "executing job");
        let started = std::time::Instant::now();

        match self.run_handler(&job).await {
            Ok(output) => {
                self.report_success(&job, &owner_token, output, started.elapsed())
                    .await;
            }
            Err(err) => {
                self.report_failure(&job, &owner_token, err).await;
            }
        }
    }

    async fn run_handler(&self, job: &JobDbModel) -> Result<HandlerOutput, ExecutionError> {
        let handler = job
            .parsed_job_type()
            .and_then(|job_type| self.registry.resolve(job_type))
            .ok_or_else(|| ExecutionError::UnknownJobType(job.job_type.clone()))?;

        // Bounded per-call timeout, strictly shorter than the stuck-job
        // timeout so the worker detects most failures before the reaper does.
        match timeout(self.handler_timeout, handler.run(&job.payload)).await {
            Ok(result) => result,
            Err(_) => Err(ExecutionError::Timeout),
        }
    }

    async fn report_success(
        &self,
        job: &JobDbModel,
        owner_token: &str,
        output: HandlerOutput,
        elapsed: Duration,
    ) {
        let duration_secs = elapsed.as_secs_f64();
        match self
            .repo
            .mark_completed(&job.id, owner_token, &output.result_reference, duration_secs)
            .await
        {
            Ok(()) => {
                info!(job_id = %job.id, duration_secs, "job completed");
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "completion transition lost");
            }
        }
    }

    async fn report_failure(&self, job: &JobDbModel, owner_token: &str, err: ExecutionError) {
        let attempts_used = job.attempt_count + 1;
        let message = err.to_string();

        let result = match classify(&err) {
            ErrorClass::Permanent => {
                info!(job_id = %job.id, error = %message, "permanent failure");
                self.repo.mark_failed(&job.id, owner_token, &message).await
            }
            ErrorClass::Transient if attempts_used < job.max_attempts => {
                let delay = self.policy.backoff(job.attempt_count as u32);
                let next = chrono::Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                info!(
                    job_id = %job.id,
                    attempt = attempts_used,
                    retry_in_secs = delay.as_secs(),
                    error = %message,
                    "transient failure, scheduling retry"
                );
                self.repo
                    .mark_retry(&job.id, owner_token, &message, next)
                    .await
            }
            ErrorClass::Transient => {
                info!(
                    job_id = %job.id,
                    attempts = attempts_used,
                    error = %message,
                    "transient failure with attempts exhausted"
                );
                self.repo.mark_failed(&job.id, owner_token, &message).await
            }
        };

        if let Err(e) = result {
            error!(job_id = %job.id, error = %e, "failure transition lost");
        }
    }
}
