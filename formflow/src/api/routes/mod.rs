//! API routes.

pub mod health;
pub mod jobs;
