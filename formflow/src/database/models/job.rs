//! Job database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time;

/// Job database model.
/// Represents a single unit of deferred work (AI generation or document
/// rendering) and is the sole source of truth for its state.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    /// Job type: AI_GENERATION, DOCUMENT_RENDER
    pub job_type: String,
    /// Status: PENDING, PROCESSING, COMPLETED, FAILED, RETRY, CANCELLED
    pub status: String,
    /// JSON blob describing the execution context (submission/prompt refs)
    pub payload: String,
    /// Completed executions; never exceeds max_attempts
    pub attempt_count: i64,
    pub max_attempts: i64,
    /// ISO 8601 timestamp when the job was created
    pub created_at: String,
    /// Earliest eligible dispatch time
    pub scheduled_for: String,
    /// Set when a worker claims the job
    pub started_at: Option<String>,
    /// Set on a terminal transition
    pub completed_at: Option<String>,
    /// Held by exactly one worker while PROCESSING, cleared otherwise
    pub owner_token: Option<String>,
    /// Last captured execution error
    pub error_message: Option<String>,
    /// Serialized handler result on success
    pub result_reference: Option<String>,
    /// Execution duration in seconds
    pub duration_secs: Option<f64>,
    /// ISO 8601 timestamp when the job was last updated
    pub updated_at: String,
}

impl JobDbModel {
    pub fn new(
        job_type: JobType,
        payload: impl Into<String>,
        max_attempts: u32,
        scheduled_for: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        let now = time::now_db();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: job_type.as_str().to_string(),
            status: JobStatus::Pending.as_str().to_string(),
            payload: payload.into(),
            attempt_count: 0,
            max_attempts: max_attempts as i64,
            created_at: now.clone(),
            scheduled_for: time::to_db(scheduled_for),
            started_at: None,
            completed_at: None,
            owner_token: None,
            error_message: None,
            result_reference: None,
            duration_secs: None,
            updated_at: now,
        }
    }

    /// Parsed status; `None` only if the row was written by a newer schema.
    pub fn parsed_status(&self) -> Option<JobStatus> {
        JobStatus::parse(&self.status)
    }

    pub fn parsed_job_type(&self) -> Option<JobType> {
        JobType::parse(&self.job_type)
    }
}

/// Job types.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    /// Generate a response via the AI provider collaborator.
    AiGeneration,
    /// Render a document artifact via the rendering collaborator.
    DocumentRender,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiGeneration => "AI_GENERATION",
            Self::DocumentRender => "DOCUMENT_RENDER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AI_GENERATION" => Some(Self::AiGeneration),
            "DOCUMENT_RENDER" => Some(Self::DocumentRender),
            _ => None,
        }
    }
}

/// Job status values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued and eligible for dispatch once scheduled_for is reached.
    Pending,
    /// Claimed by a worker and currently executing.
    Processing,
    /// Finished successfully. Terminal.
    Completed,
    /// Failed permanently or exhausted its attempts. Terminal for automatic
    /// dispatch; an operator may still requeue it.
    Failed,
    /// Transient failure holding state; promoted back to PENDING once the
    /// backoff deadline passes.
    Retry,
    /// Cancelled while still pending. Terminal.
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Retry => "RETRY",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            "RETRY" => Some(Self::Retry),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Check if this status admits no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JobCounts {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub retry: u64,
    pub cancelled: u64,
}

impl JobCounts {
    pub fn record(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Processing => self.processing += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Retry => self.retry += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
        self.total += count;
    }
}
