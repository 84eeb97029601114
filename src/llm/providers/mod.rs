//! Provider adapter contract.
//!
//! One adapter per backend family translates the canonical shapes to and
//! from that backend's wire protocol. Adapters implement only the
//! operations the backend supports; everything else falls through to the
//! default "unsupported" implementations.

pub mod anthropic;
pub mod azure;
pub mod openai;

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{
    ChatRequest, ChatResponse, CompletionRequest, CompletionResponse, EmbeddingsRequest,
    EmbeddingsResponse, ImageGenerationRequest, ImageGenerationResponse, SpeechAudio,
    SpeechRequest, StreamChunk, TranscriptionRequest, TranscriptionResponse,
};
use crate::config::ProviderParams;
use crate::error::GatewayError;

/// Supported backend families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "azure")]
    AzureOpenAi,
    Anthropic,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAi => write!(f, "openai"),
            ProviderKind::AzureOpenAi => write!(f, "azure"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamErrorKind {
    /// Transport failure or HTTP >= 500; worth trying another instance.
    Transient,
    /// Deadline exceeded; opens the circuit breaker immediately.
    Timeout,
    /// HTTP 429 (or 408) from the backend.
    RateLimited,
    /// HTTP 4xx other than 408/429; retrying elsewhere cannot help.
    Permanent,
    /// The caller went away mid-call.
    Canceled,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
    /// Seconds, from a Retry-After hint when the backend supplied one.
    pub retry_after: Option<u64>,
}

impl UpstreamError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::Transient,
            status_code: None,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::Timeout,
            status_code: Some(408),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<u64>) -> Self {
        Self {
            kind: UpstreamErrorKind::RateLimited,
            status_code: Some(429),
            message: message.into(),
            retry_after,
        }
    }

    pub fn permanent(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::Permanent,
            status_code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn canceled() -> Self {
        Self {
            kind: UpstreamErrorKind::Canceled,
            status_code: None,
            message: "request canceled by caller".to_string(),
            retry_after: None,
        }
    }

    pub fn unsupported(kind: ProviderKind, operation: &str) -> Self {
        Self::permanent(
            Some(400),
            format!("operation '{operation}' is not supported by {kind} backends"),
        )
    }

    /// Classify an HTTP error status per the failover contract: 5xx is
    /// transient, 408 is a timeout, 429 is rate-limited, other 4xx final.
    pub fn from_status(status: u16, body: String, retry_after: Option<u64>) -> Self {
        match status {
            408 => Self::timeout(body),
            429 => Self::rate_limited(body, retry_after),
            s if s >= 500 => Self {
                kind: UpstreamErrorKind::Transient,
                status_code: Some(s),
                message: body,
                retry_after: None,
            },
            s => Self::permanent(Some(s), body),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            UpstreamErrorKind::Transient | UpstreamErrorKind::Timeout | UpstreamErrorKind::RateLimited
        )
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::timeout(err.to_string())
        } else {
            UpstreamError::transient(err.to_string())
        }
    }
}

/// Per-attempt deadline and cancellation signal, threaded through every
/// adapter call.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub deadline: Duration,
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new(deadline: Duration, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }
}

/// Race a provider call against its deadline and the caller's cancellation.
/// Dropping the inner future closes the upstream connection.
pub async fn bounded<T, F>(ctx: &CallContext, operation: &str, fut: F) -> Result<T, UpstreamError>
where
    F: std::future::Future<Output = Result<T, UpstreamError>> + Send,
{
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(UpstreamError::canceled()),
        outcome = tokio::time::timeout(ctx.deadline, fut) => match outcome {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::timeout(format!(
                "{operation} exceeded deadline of {:?}",
                ctx.deadline
            ))),
        },
    }
}

/// Lazy, finite, non-restartable chunk sequence. Ends naturally or with an
/// error item; either way the stream is done.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, UpstreamError>> + Send>>;

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Whether the adapter recognizes the (upstream) model name. Used by the
    /// models listing and by configuration validation, never by routing.
    fn supports_model(&self, _model: &str) -> bool {
        true
    }

    /// Adapter-level preference hint; lower is preferred when instance
    /// priorities tie.
    fn priority_hint(&self) -> u8 {
        100
    }

    async fn chat(
        &self,
        _request: &ChatRequest,
        _ctx: &CallContext,
    ) -> Result<ChatResponse, UpstreamError> {
        Err(UpstreamError::unsupported(self.kind(), "chat"))
    }

    async fn chat_stream(
        &self,
        _request: &ChatRequest,
        _ctx: &CallContext,
    ) -> Result<ChunkStream, UpstreamError> {
        Err(UpstreamError::unsupported(self.kind(), "chat-stream"))
    }

    async fn completion(
        &self,
        _request: &CompletionRequest,
        _ctx: &CallContext,
    ) -> Result<CompletionResponse, UpstreamError> {
        Err(UpstreamError::unsupported(self.kind(), "completion"))
    }

    async fn completion_stream(
        &self,
        _request: &CompletionRequest,
        _ctx: &CallContext,
    ) -> Result<ChunkStream, UpstreamError> {
        Err(UpstreamError::unsupported(self.kind(), "completion-stream"))
    }

    async fn embeddings(
        &self,
        _request: &EmbeddingsRequest,
        _ctx: &CallContext,
    ) -> Result<EmbeddingsResponse, UpstreamError> {
        Err(UpstreamError::unsupported(self.kind(), "embeddings"))
    }

    async fn transcription(
        &self,
        _request: &TranscriptionRequest,
        _ctx: &CallContext,
    ) -> Result<TranscriptionResponse, UpstreamError> {
        Err(UpstreamError::unsupported(self.kind(), "transcription"))
    }

    async fn speech(
        &self,
        _request: &SpeechRequest,
        _ctx: &CallContext,
    ) -> Result<SpeechAudio, UpstreamError> {
        Err(UpstreamError::unsupported(self.kind(), "speech"))
    }

    async fn image_generate(
        &self,
        _request: &ImageGenerationRequest,
        _ctx: &CallContext,
    ) -> Result<ImageGenerationResponse, UpstreamError> {
        Err(UpstreamError::unsupported(self.kind(), "image-generate"))
    }

    /// Cheap reachability probe for the background health checker.
    async fn health_check(&self, _ctx: &CallContext) -> Result<bool, UpstreamError> {
        Ok(true)
    }
}

/// Parse the `params.model` routing prefix (`azure/…`, `anthropic/…`,
/// `openai/…`; bare names default to openai) into a kind plus the model
/// name the backend expects.
pub fn split_model_ref(model: &str) -> (ProviderKind, &str) {
    match model.split_once('/') {
        Some(("openai", rest)) => (ProviderKind::OpenAi, rest),
        Some(("azure", rest)) => (ProviderKind::AzureOpenAi, rest),
        Some(("anthropic", rest)) => (ProviderKind::Anthropic, rest),
        _ => (ProviderKind::OpenAi, model),
    }
}

/// Build the adapter for one configured instance. The opaque `extra` bag is
/// decoded here, once, and never carried through the request path.
pub fn build(params: &ProviderParams, timeout: Duration) -> Result<Arc<dyn Provider>, GatewayError> {
    let (kind, upstream_model) = split_model_ref(&params.model);
    match kind {
        ProviderKind::OpenAi => Ok(Arc::new(openai::OpenAiProvider::new(
            openai::OpenAiConfig::from_params(upstream_model, params, timeout)?,
        ))),
        ProviderKind::AzureOpenAi => Ok(Arc::new(azure::AzureProvider::new(
            azure::AzureConfig::from_params(upstream_model, params, timeout)?,
        ))),
        ProviderKind::Anthropic => Ok(Arc::new(anthropic::AnthropicProvider::new(
            anthropic::AnthropicConfig::from_params(upstream_model, params, timeout)?,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_ref_prefix_selects_kind() {
        assert_eq!(split_model_ref("gpt-4").0, ProviderKind::OpenAi);
        assert_eq!(split_model_ref("openai/gpt-4"), (ProviderKind::OpenAi, "gpt-4"));
        assert_eq!(
            split_model_ref("azure/gpt4-prod"),
            (ProviderKind::AzureOpenAi, "gpt4-prod")
        );
        assert_eq!(
            split_model_ref("anthropic/claude-3-opus"),
            (ProviderKind::Anthropic, "claude-3-opus")
        );
    }

    #[test]
    fn status_classification_follows_contract() {
        assert_eq!(
            UpstreamError::from_status(503, "".into(), None).kind,
            UpstreamErrorKind::Transient
        );
        assert_eq!(
            UpstreamError::from_status(429, "".into(), Some(5)).retry_after,
            Some(5)
        );
        assert_eq!(
            UpstreamError::from_status(408, "".into(), None).kind,
            UpstreamErrorKind::Timeout
        );
        assert_eq!(
            UpstreamError::from_status(404, "".into(), None).kind,
            UpstreamErrorKind::Permanent
        );
        assert!(!UpstreamError::from_status(404, "".into(), None).is_retryable());
    }

    #[tokio::test]
    async fn bounded_honors_cancellation() {
        let ctx = CallContext::new(Duration::from_secs(5), CancellationToken::new());
        ctx.cancel.cancel();
        let result: Result<(), _> = bounded(&ctx, "test", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert_eq!(result.unwrap_err().kind, UpstreamErrorKind::Canceled);
    }

    #[tokio::test]
    async fn bounded_times_out() {
        let ctx = CallContext::new(Duration::from_millis(10), CancellationToken::new());
        let result: Result<(), _> = bounded(&ctx, "test", async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert_eq!(result.unwrap_err().kind, UpstreamErrorKind::Timeout);
    }
}
