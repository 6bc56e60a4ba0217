//! Operational API.
//!
//! Request/response surface consumed by the dashboard: status, force-process,
//! stuck-job cleanup, retention cleanup, retry and cancel.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod server;

pub use error::{ApiError, ApiResult};
pub use server::{ApiServer, AppState};
