//! Database models.

pub mod job;

pub use job::{JobCounts, JobDbModel, JobStatus, JobType};
