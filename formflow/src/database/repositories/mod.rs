//! Repository layer for database access.
//!
//! All job-table access goes through `JobRepository`; callers never touch
//! SQL directly.

pub mod job;

pub use job::*;
