//! Document rendering handler and renderer contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::ai_generation::{map_status_error, map_transport_error};
use super::{ExecutionError, HandlerOutput, JobHandler};
use crate::database::models::JobType;

/// Payload for a document rendering job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRenderPayload {
    pub submission_id: String,
    /// Template identifier understood by the rendering collaborator.
    pub template: String,
    /// Data context merged into the template.
    pub context: serde_json::Value,
}

/// Rendered artifact reference. The renderer persists the binary itself and
/// hands back a location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedDocument {
    pub uri: String,
    #[serde(default)]
    pub size_bytes: u64,
}

/// The document rendering collaborator.
///
/// Implementations must respect the caller-supplied timeout and return
/// failures pre-classified through `ExecutionError`.
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(
        &self,
        template: &str,
        context: &serde_json::Value,
        timeout: Duration,
    ) -> Result<RenderedDocument, ExecutionError>;
}

/// Handler for `DOCUMENT_RENDER` jobs.
pub struct DocumentRenderHandler {
    renderer: Arc<dyn DocumentRenderer>,
    call_timeout: Duration,
}

impl DocumentRenderHandler {
    pub fn new(renderer: Arc<dyn DocumentRenderer>, call_timeout: Duration) -> Self {
        Self {
            renderer,
            call_timeout,
        }
    }
}

#[async_trait]
impl JobHandler for DocumentRenderHandler {
    fn job_type(&self) -> JobType {
        JobType::DocumentRender
    }

    async fn run(&self, payload: &str) -> Result<HandlerOutput, ExecutionError> {
        let payload: DocumentRenderPayload = serde_json::from_str(payload)
            .map_err(|e| ExecutionError::InvalidPayload(e.to_string()))?;

        let document = self
            .renderer
            .render(&payload.template, &payload.context, self.call_timeout)
            .await?;
        debug!(
            submission_id = %payload.submission_id,
            uri = %document.uri,
            "document rendered"
        );

        let reference = serde_json::json!({
            "submission_id": payload.submission_id,
            "uri": document.uri,
            "size_bytes": document.size_bytes,
        });
        Ok(HandlerOutput {
            result_reference: reference.to_string(),
        })
    }
}

/// HTTP-backed document renderer.
pub struct HttpDocumentRenderer {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpDocumentRenderer {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl DocumentRenderer for HttpDocumentRenderer {
    async fn render(
        &self,
        template: &str,
        context: &serde_json::Value,
        timeout: Duration,
    ) -> Result<RenderedDocument, ExecutionError> {
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(timeout)
            .json(&serde_json::json!({
                "template": template,
                "context": context,
            }))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            // Template/data rejections are permanent render errors, not
            // generic payload problems.
            return Err(match status.as_u16() {
                400 | 422 => ExecutionError::Render(format!("renderer rejected input ({status})")),
                other => map_status_error(other),
            });
        }

        response
            .json::<RenderedDocument>()
            .await
            .map_err(|e| ExecutionError::Render(format!("malformed renderer response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_parses() {
        let raw = r#"{
            "submission_id": "sub-9",
            "template": "quote-letter",
            "context": {"customer": "Acme"}
        }"#;
        let payload: DocumentRenderPayload = serde_json::from_str(raw).unwrap();
        assert_eq!(payload.template, "quote-letter");
        assert_eq!(payload.context["customer"], "Acme");
    }
}
