//! AI generation handler and provider contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{ExecutionError, HandlerOutput, JobHandler};
use crate::database::models::JobType;

/// Payload for an AI generation job: references into the submission that
/// triggered it plus the rendered prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiGenerationPayload {
    pub submission_id: String,
    pub prompt: String,
    pub model: String,
}

/// A prompt sent to the provider.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model: String,
}

/// Provider response: generated text plus usage metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedText {
    pub text: String,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

/// The AI provider collaborator.
///
/// Implementations must respect the caller-supplied timeout and return
/// failures pre-classified through `ExecutionError`.
#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn generate(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<GeneratedText, ExecutionError>;
}

/// Handler for `AI_GENERATION` jobs.
pub struct AiGenerationHandler {
    provider: Arc<dyn AiProvider>,
    call_timeout: Duration,
}

impl AiGenerationHandler {
    pub fn new(provider: Arc<dyn AiProvider>, call_timeout: Duration) -> Self {
        Self {
            provider,
            call_timeout,
        }
    }
}

#[async_trait]
impl JobHandler for AiGenerationHandler {
    fn job_type(&self) -> JobType {
        JobType::AiGeneration
    }

    async fn run(&self, payload: &str) -> Result<HandlerOutput, ExecutionError> {
        let payload: AiGenerationPayload = serde_json::from_str(payload)
            .map_err(|e| ExecutionError::InvalidPayload(e.to_string()))?;

        let request = GenerationRequest {
            prompt: payload.prompt,
            model: payload.model,
        };

        let generated = self.provider.generate(&request, self.call_timeout).await?;
        debug!(
            submission_id = %payload.submission_id,
            completion_tokens = generated.completion_tokens,
            "AI generation finished"
        );

        let reference = serde_json::json!({
            "submission_id": payload.submission_id,
            "text": generated.text,
            "prompt_tokens": generated.prompt_tokens,
            "completion_tokens": generated.completion_tokens,
        });
        Ok(HandlerOutput {
            result_reference: reference.to_string(),
        })
    }
}

/// HTTP-backed AI provider.
pub struct HttpAiProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpAiProvider {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl AiProvider for HttpAiProvider {
    async fn generate(
        &self,
        request: &GenerationRequest,
        timeout: Duration,
    ) -> Result<GeneratedText, ExecutionError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status_error(status.as_u16()));
        }

        response
            .json::<GeneratedText>()
            .await
            .map_err(|e| ExecutionError::InvalidPayload(format!("malformed provider response: {e}")))
    }
}

/// Map a reqwest transport failure onto the execution taxonomy.
pub(crate) fn map_transport_error(err: reqwest::Error) -> ExecutionError {
    if err.is_timeout() {
        ExecutionError::Timeout
    } else {
        ExecutionError::Network(err.to_string())
    }
}

/// Map a non-success HTTP status onto the execution taxonomy.
pub(crate) fn map_status_error(status: u16) -> ExecutionError {
    match status {
        401 | 403 => ExecutionError::Auth(format!("downstream returned status {status}")),
        408 => ExecutionError::Timeout,
        429 => ExecutionError::RateLimited,
        500..=599 => ExecutionError::Upstream { status },
        _ => ExecutionError::InvalidPayload(format!("downstream rejected request ({status})")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::retry::{ErrorClass, classify};

    #[test]
    fn test_status_mapping() {
        assert!(matches!(map_status_error(401), ExecutionError::Auth(_)));
        assert!(matches!(map_status_error(429), ExecutionError::RateLimited));
        assert!(matches!(
            map_status_error(502),
            ExecutionError::Upstream { status: 502 }
        ));
        assert!(matches!(
            map_status_error(422),
            ExecutionError::InvalidPayload(_)
        ));
    }

    #[test]
    fn test_rate_limit_is_transient_and_auth_is_not() {
        assert_eq!(classify(&map_status_error(429)), ErrorClass::Transient);
        assert_eq!(classify(&map_status_error(403)), ErrorClass::Permanent);
    }
}
