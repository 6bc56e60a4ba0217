//! formflow library crate.
//!
//! Background job engine for AI generation and document rendering: durable
//! job store, claim-and-dispatch scheduler, bounded per-job execution, stuck
//! job recovery and an operational control API.

pub mod api;
pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod logging;

pub use error::{Error, Result};
