//! Job repository.
//!
//! Every state transition is a single conditional UPDATE keyed on the
//! expected prior status (and owner token where one is held), so a lost race
//! yields zero affected rows instead of a duplicate transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::database::models::{JobCounts, JobDbModel, JobStatus};
use crate::database::retry::retry_on_busy;
use crate::database::time;
use crate::{Error, Result};

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new pending job. Performs no execution.
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;

    async fn get_job(&self, id: &str) -> Result<JobDbModel>;
    async fn find_job(&self, id: &str) -> Result<Option<JobDbModel>>;

    /// Atomically claim up to `limit` eligible pending jobs, oldest first.
    /// Each claimed row transitions to PROCESSING with a fresh owner token
    /// and `started_at = now`. No job is ever returned to two callers.
    /// `ignore_schedule` bypasses the `scheduled_for` gate (force dispatch).
    async fn claim_next_batch(&self, limit: usize, ignore_schedule: bool)
    -> Result<Vec<JobDbModel>>;

    /// Terminal success; requires the job to be PROCESSING under
    /// `owner_token`.
    async fn mark_completed(
        &self,
        id: &str,
        owner_token: &str,
        result_reference: &str,
        duration_secs: f64,
    ) -> Result<()>;

    /// Terminal-for-dispatch failure; consumes the attempt. Requires the job
    /// to be PROCESSING under `owner_token`.
    async fn mark_failed(&self, id: &str, owner_token: &str, error: &str) -> Result<()>;

    /// Transient failure; consumes the attempt and parks the job in RETRY
    /// until `next_scheduled_for`. Requires the job to be PROCESSING under
    /// `owner_token`.
    async fn mark_retry(
        &self,
        id: &str,
        owner_token: &str,
        error: &str,
        next_scheduled_for: DateTime<Utc>,
    ) -> Result<()>;

    /// Move RETRY jobs whose backoff deadline has passed back to PENDING.
    /// Returns the number of promoted rows.
    async fn promote_due_retries(&self) -> Result<u64>;

    /// Cancel a job. Succeeds only while the job is still PENDING.
    async fn cancel_job(&self, id: &str) -> Result<()>;

    /// Requeue a FAILED or RETRY job for immediate dispatch, preserving its
    /// attempt count. Returns false when the job was not in either status.
    async fn requeue_for_retry(&self, id: &str) -> Result<bool>;

    /// Reset stuck PROCESSING jobs (started before `cutoff`) that still have
    /// attempts left: back to PENDING, attempt consumed, owner cleared.
    async fn reset_stuck_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Fail stuck PROCESSING jobs (started before `cutoff`) that have
    /// exhausted their attempts.
    async fn fail_exhausted_stuck_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Count PENDING jobs created before `cutoff`. Report-only; old pending
    /// rows indicate dispatch starvation, not a worker crash.
    async fn count_stale_pending(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn count_processing(&self) -> Result<u64>;
    async fn get_job_counts_by_status(&self) -> Result<JobCounts>;

    /// Mean execution duration across completed jobs, if any.
    async fn average_completed_duration_secs(&self) -> Result<Option<f64>>;
    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobDbModel>>;
    async fn list_recent_jobs(&self, limit: i64) -> Result<Vec<JobDbModel>>;

    /// Delete rows in the given statuses last updated before `cutoff`.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>, statuses: &[JobStatus])
    -> Result<u64>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Explain why a conditional transition affected zero rows.
    async fn transition_failure(&self, id: &str, to: JobStatus) -> Error {
        match self.find_job(id).await {
            Ok(Some(job)) => Error::invalid_transition(job.status, to.as_str()),
            Ok(None) => Error::not_found("Job", id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        retry_on_busy("create_job", || async {
            sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, job_type, status, payload, attempt_count, max_attempts,
                    created_at, scheduled_for, started_at, completed_at,
                    owner_token, error_message, result_reference, duration_secs,
                    updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&job.id)
            .bind(&job.job_type)
            .bind(&job.status)
            .bind(&job.payload)
            .bind(job.attempt_count)
            .bind(job.max_attempts)
            .bind(&job.created_at)
            .bind(&job.scheduled_for)
            .bind(&job.started_at)
            .bind(&job.completed_at)
            .bind(&job.owner_token)
            .bind(&job.error_message)
            .bind(&job.result_reference)
            .bind(job.duration_secs)
            .bind(&job.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        self.find_job(id)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn find_job(&self, id: &str) -> Result<Option<JobDbModel>> {
        let job = sqlx::query_as::<_, JobDbModel>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    async fn claim_next_batch(
        &self,
        limit: usize,
        ignore_schedule: bool,
    ) -> Result<Vec<JobDbModel>> {
        // One conditional UPDATE per row. The statement is atomic under
        // SQLite's single-writer model: either it claims the selected row or
        // the row was taken first and zero rows match.
        let sql = if ignore_schedule {
            r#"
            UPDATE jobs SET
                status = 'PROCESSING',
                owner_token = ?,
                started_at = ?,
                updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'PENDING'
                ORDER BY created_at
                LIMIT 1
            ) AND status = 'PENDING'
            RETURNING *
            "#
        } else {
            r#"
            UPDATE jobs SET
                status = 'PROCESSING',
                owner_token = ?,
                started_at = ?,
                updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'PENDING' AND scheduled_for <= ?
                ORDER BY created_at
                LIMIT 1
            ) AND status = 'PENDING'
            RETURNING *
            "#
        };

        let mut claimed = Vec::new();
        for _ in 0..limit {
            let now = time::now_db();
            let owner_token = uuid::Uuid::new_v4().to_string();

            let row = retry_on_busy("claim_next_batch", || {
                let now = now.clone();
                let owner_token = owner_token.clone();
                async move {
                    let mut query = sqlx::query_as::<_, JobDbModel>(sql)
                        .bind(owner_token)
                        .bind(now.clone())
                        .bind(now.clone());
                    if !ignore_schedule {
                        query = query.bind(now);
                    }
                    Ok(query.fetch_optional(&self.pool).await?)
                }
            })
            .await?;

            match row {
                Some(job) => claimed.push(job),
                None => break,
            }
        }
        Ok(claimed)
    }

    async fn mark_completed(
        &self,
        id: &str,
        owner_token: &str,
        result_reference: &str,
        duration_secs: f64,
    ) -> Result<()> {
        let now = time::now_db();
        let done = retry_on_busy("mark_completed", || async {
            let result = sqlx::query(
                r#"
                UPDATE jobs SET
                    status = 'COMPLETED',
                    completed_at = ?,
                    result_reference = ?,
                    duration_secs = ?,
                    owner_token = NULL,
                    updated_at = ?
                WHERE id = ? AND status = 'PROCESSING' AND owner_token = ?
                "#,
            )
            .bind(&now)
            .bind(result_reference)
            .bind(duration_secs)
            .bind(&now)
            .bind(id)
            .bind(owner_token)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if done == 0 {
            return Err(self.transition_failure(id, JobStatus::Completed).await);
        }
        Ok(())
    }

    async fn mark_failed(&self, id: &str, owner_token: &str, error: &str) -> Result<()> {
        let now = time::now_db();
        let done = retry_on_busy("mark_failed", || async {
            let result = sqlx::query(
                r#"
                UPDATE jobs SET
                    status = 'FAILED',
                    completed_at = ?,
                    error_message = ?,
                    attempt_count = MIN(attempt_count + 1, max_attempts),
                    owner_token = NULL,
                    updated_at = ?
                WHERE id = ? AND status = 'PROCESSING' AND owner_token = ?
                "#,
            )
            .bind(&now)
            .bind(error)
            .bind(&now)
            .bind(id)
            .bind(owner_token)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if done == 0 {
            return Err(self.transition_failure(id, JobStatus::Failed).await);
        }
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: &str,
        owner_token: &str,
        error: &str,
        next_scheduled_for: DateTime<Utc>,
    ) -> Result<()> {
        let now = time::now_db();
        let next = time::to_db(next_scheduled_for);
        let done = retry_on_busy("mark_retry", || async {
            let result = sqlx::query(
                r#"
                UPDATE jobs SET
                    status = 'RETRY',
                    scheduled_for = ?,
                    error_message = ?,
                    attempt_count = MIN(attempt_count + 1, max_attempts),
                    owner_token = NULL,
                    started_at = NULL,
                    updated_at = ?
                WHERE id = ? AND status = 'PROCESSING' AND owner_token = ?
                "#,
            )
            .bind(&next)
            .bind(error)
            .bind(&now)
            .bind(id)
            .bind(owner_token)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if done == 0 {
            return Err(self.transition_failure(id, JobStatus::Retry).await);
        }
        Ok(())
    }

    async fn promote_due_retries(&self) -> Result<u64> {
        let now = time::now_db();
        retry_on_busy("promote_due_retries", || async {
            let result = sqlx::query(
                "UPDATE jobs SET status = 'PENDING', updated_at = ?
                 WHERE status = 'RETRY' AND scheduled_for <= ?",
            )
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn cancel_job(&self, id: &str) -> Result<()> {
        let now = time::now_db();
        let done = retry_on_busy("cancel_job", || async {
            let result = sqlx::query(
                "UPDATE jobs SET status = 'CANCELLED', completed_at = ?, updated_at = ?
                 WHERE id = ? AND status = 'PENDING'",
            )
            .bind(&now)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if done == 0 {
            return Err(self.transition_failure(id, JobStatus::Cancelled).await);
        }
        Ok(())
    }

    async fn requeue_for_retry(&self, id: &str) -> Result<bool> {
        let now = time::now_db();
        let done = retry_on_busy("requeue_for_retry", || async {
            let result = sqlx::query(
                r#"
                UPDATE jobs SET
                    status = 'PENDING',
                    scheduled_for = ?,
                    owner_token = NULL,
                    started_at = NULL,
                    completed_at = NULL,
                    updated_at = ?
                WHERE id = ? AND status IN ('FAILED', 'RETRY')
                "#,
            )
            .bind(&now)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;
        Ok(done > 0)
    }

    async fn reset_stuck_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let now = time::now_db();
        let cutoff = time::to_db(cutoff);
        retry_on_busy("reset_stuck_jobs", || async {
            let result = sqlx::query(
                r#"
                UPDATE jobs SET
                    status = 'PENDING',
                    scheduled_for = ?,
                    attempt_count = attempt_count + 1,
                    owner_token = NULL,
                    started_at = NULL,
                    error_message = 'Reclaimed: worker exceeded the job timeout',
                    updated_at = ?
                WHERE status = 'PROCESSING'
                  AND started_at <= ?
                  AND attempt_count < max_attempts
                "#,
            )
            .bind(&now)
            .bind(&now)
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn fail_exhausted_stuck_jobs(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let now = time::now_db();
        let cutoff = time::to_db(cutoff);
        retry_on_busy("fail_exhausted_stuck_jobs", || async {
            let result = sqlx::query(
                r#"
                UPDATE jobs SET
                    status = 'FAILED',
                    completed_at = ?,
                    owner_token = NULL,
                    error_message = 'Timed out: no attempts remaining',
                    updated_at = ?
                WHERE status = 'PROCESSING'
                  AND started_at <= ?
                  AND attempt_count >= max_attempts
                "#,
            )
            .bind(&now)
            .bind(&now)
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn count_stale_pending(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE status = 'PENDING' AND created_at <= ?",
        )
        .bind(time::to_db(cutoff))
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn count_processing(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = 'PROCESSING'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn get_job_counts_by_status(&self) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = JobCounts::default();
        for (status, count) in rows {
            match JobStatus::parse(&status) {
                Some(status) => counts.record(status, count as u64),
                None => {
                    return Err(Error::Database(format!(
                        "unknown job status in table: {status}"
                    )));
                }
            }
        }
        Ok(counts)
    }

    async fn average_completed_duration_secs(&self) -> Result<Option<f64>> {
        let avg: Option<f64> = sqlx::query_scalar(
            "SELECT AVG(duration_secs) FROM jobs WHERE status = 'COMPLETED'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(avg)
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM jobs WHERE status = ? ORDER BY created_at DESC",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_recent_jobs(&self, limit: i64) -> Result<Vec<JobDbModel>> {
        let jobs =
            sqlx::query_as::<_, JobDbModel>("SELECT * FROM jobs ORDER BY created_at DESC LIMIT ?")
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
        Ok(jobs)
    }

    async fn delete_older_than(
        &self,
        cutoff: DateTime<Utc>,
        statuses: &[JobStatus],
    ) -> Result<u64> {
        if statuses.is_empty() {
            return Ok(0);
        }

        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql =
            format!("DELETE FROM jobs WHERE updated_at < ? AND status IN ({placeholders})");
        let cutoff = time::to_db(cutoff);

        retry_on_busy("delete_older_than", || {
            let sql = sql.clone();
            let cutoff = cutoff.clone();
            async move {
                let mut query = sqlx::query(&sql).bind(cutoff);
                for status in statuses {
                    query = query.bind(status.as_str());
                }
                let result = query.execute(&self.pool).await?;
                Ok(result.rows_affected())
            }
        })
        .await
    }
}
