//! Job handlers.
//!
//! Each job type maps to exactly one handler exposing a single capability:
//! `run(payload) -> HandlerOutput`. Handlers wrap the external execution
//! collaborators (AI provider, document renderer) and surface their failures
//! pre-classified through `ExecutionError`.

pub mod ai_generation;
pub mod document_render;

pub use ai_generation::{
    AiGenerationHandler, AiGenerationPayload, AiProvider, GeneratedText, GenerationRequest,
    HttpAiProvider,
};
pub use document_render::{
    DocumentRenderHandler, DocumentRenderPayload, DocumentRenderer, HttpDocumentRenderer,
    RenderedDocument,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::database::models::JobType;

/// Errors surfaced by job execution.
///
/// The variant determines retry classification (see `engine::retry`):
/// timeouts, network faults, rate limits and upstream 5xx-class failures are
/// transient; everything else is permanent.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("execution timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by downstream service")]
    RateLimited,

    #[error("downstream service error (status {status})")]
    Upstream { status: u16 },

    #[error("authentication rejected by downstream service: {0}")]
    Auth(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("render rejected: {0}")]
    Render(String),

    #[error("no handler registered for job type {0}")]
    UnknownJobType(String),
}

/// Result of a successful execution.
#[derive(Debug, Clone)]
pub struct HandlerOutput {
    /// Serialized reference to the produced result (generated text summary,
    /// rendered artifact location).
    pub result_reference: String,
}

/// A job-type handler.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The job type this handler executes.
    fn job_type(&self) -> JobType;

    /// Execute the job payload.
    async fn run(&self, payload: &str) -> Result<HandlerOutput, ExecutionError>;
}

/// Registry mapping job types to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.job_type(), handler);
    }

    pub fn resolve(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
