//! OpenAI adapter client. The canonical layer already speaks this wire
//! shape, so request translation is limited to model substitution and the
//! token-field rename the reasoning models require.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::config::{uses_completion_token_field, OpenAiConfig};
use super::types::{parse_error_body, read_retry_after};
use crate::llm::providers::{
    bounded, CallContext, ChunkStream, Provider, ProviderKind, UpstreamError,
};
use crate::llm::sse;
use crate::llm::{
    ChatRequest, ChatResponse, CompletionRequest, CompletionResponse, EmbeddingsRequest,
    EmbeddingsResponse, ImageGenerationRequest, ImageGenerationResponse, SpeechAudio,
    SpeechRequest, StreamChunk, TranscriptionRequest, TranscriptionResponse,
};

pub struct OpenAiProvider {
    http: Client,
    cfg: OpenAiConfig,
}

impl OpenAiProvider {
    pub fn new(cfg: OpenAiConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.cfg.api_base, path)
    }

    fn headers(&self) -> Result<HeaderMap, UpstreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.cfg.api_key))
                .map_err(|_| UpstreamError::permanent(None, "api key is not a valid header"))?,
        );
        if let Some(org) = &self.cfg.organization {
            headers.insert(
                "OpenAI-Organization",
                HeaderValue::from_str(org)
                    .map_err(|_| UpstreamError::permanent(None, "invalid organization header"))?,
            );
        }
        for (name, value) in &self.cfg.custom_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| UpstreamError::permanent(None, format!("invalid header '{name}'")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| UpstreamError::permanent(None, "invalid header value"))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let retry_after = read_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(UpstreamError::from_status(
            status,
            parse_error_body(&body),
            retry_after,
        ))
    }

    async fn post_json(
        &self,
        path: &str,
        body: &Value,
        ctx: &CallContext,
    ) -> Result<reqwest::Response, UpstreamError> {
        debug!(path, model = %self.cfg.model, "forwarding request upstream");
        let response = self
            .http
            .post(self.url(path))
            .headers(self.headers()?)
            .json(body)
            .timeout(ctx.deadline)
            .send()
            .await?;
        Self::check_status(response).await
    }

    /// Serialize the canonical request and apply the backend-specific
    /// adjustments without disturbing message ordering or content blocks.
    fn chat_body(&self, request: &ChatRequest, stream: bool) -> Result<Value, UpstreamError> {
        let mut body = serde_json::to_value(request)
            .map_err(|err| UpstreamError::permanent(None, err.to_string()))?;
        let object = body
            .as_object_mut()
            .ok_or_else(|| UpstreamError::permanent(None, "request did not serialize to object"))?;

        object.insert("model".into(), json!(self.cfg.model));
        object.insert("stream".into(), json!(stream));
        if stream {
            // Ask for the terminal usage chunk so billing can trust it.
            object.insert("stream_options".into(), json!({ "include_usage": true }));
        } else {
            object.remove("stream_options");
        }
        if uses_completion_token_field(&self.cfg.model) {
            if let Some(max) = object.remove("max_tokens") {
                object.insert("max_completion_tokens".into(), max);
            }
        }
        Ok(body)
    }

    fn payload_with_model<T: serde::Serialize>(&self, request: &T) -> Result<Value, UpstreamError> {
        let mut body = serde_json::to_value(request)
            .map_err(|err| UpstreamError::permanent(None, err.to_string()))?;
        if let Some(object) = body.as_object_mut() {
            object.insert("model".into(), json!(self.cfg.model));
        }
        Ok(body)
    }

    /// Open an SSE response and hand back the canonical chunk stream.
    async fn open_stream(
        &self,
        path: &str,
        body: Value,
        ctx: &CallContext,
    ) -> Result<ChunkStream, UpstreamError> {
        let url = self.url(path);
        let headers = self.headers()?;
        let http = self.http.clone();
        // The attempt deadline bounds connection establishment; the body is
        // read for as long as the stream lives.
        let response = bounded(ctx, path, async move {
            let response = http.post(&url).headers(headers).json(&body).send().await?;
            Self::check_status(response).await
        })
        .await?;

        let cancel = ctx.cancel.clone();
        let chunks = sse::event_stream(response)
            .take_until(Box::pin(cancel.cancelled_owned()))
            .take_while(|event| {
                futures::future::ready(!matches!(event, Ok(event) if event.is_done()))
            })
            .filter_map(|event| async move {
                match event {
                    Ok(event) => {
                        if event.data.is_empty() {
                            return None;
                        }
                        match serde_json::from_str::<StreamChunk>(&event.data) {
                            Ok(chunk) => Some(Ok(chunk)),
                            Err(err) => Some(Err(UpstreamError::transient(format!(
                                "malformed stream chunk: {err}"
                            )))),
                        }
                    }
                    Err(err) => Some(Err(err)),
                }
            });
        Ok(Box::pin(chunks))
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn supports_model(&self, model: &str) -> bool {
        model == self.cfg.model
            || ["gpt-", "o1", "o3", "o4", "text-embedding-", "dall-e", "whisper-", "tts-"]
                .iter()
                .any(|prefix| model.starts_with(prefix))
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChatResponse, UpstreamError> {
        let body = self.chat_body(request, false)?;
        bounded(ctx, "chat", async {
            let response = self.post_json("chat/completions", &body, ctx).await?;
            response
                .json::<ChatResponse>()
                .await
                .map_err(|err| UpstreamError::transient(format!("malformed response: {err}")))
        })
        .await
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChunkStream, UpstreamError> {
        let body = self.chat_body(request, true)?;
        self.open_stream("chat/completions", body, ctx).await
    }

    async fn completion(
        &self,
        request: &CompletionRequest,
        ctx: &CallContext,
    ) -> Result<CompletionResponse, UpstreamError> {
        let mut body = self.payload_with_model(request)?;
        if let Some(object) = body.as_object_mut() {
            object.insert("stream".into(), json!(false));
        }
        bounded(ctx, "completion", async {
            let response = self.post_json("completions", &body, ctx).await?;
            response
                .json::<CompletionResponse>()
                .await
                .map_err(|err| UpstreamError::transient(format!("malformed response: {err}")))
        })
        .await
    }

    async fn completion_stream(
        &self,
        request: &CompletionRequest,
        ctx: &CallContext,
    ) -> Result<ChunkStream, UpstreamError> {
        let mut body = self.payload_with_model(request)?;
        if let Some(object) = body.as_object_mut() {
            object.insert("stream".into(), json!(true));
        }
        self.open_stream("completions", body, ctx).await
    }

    async fn embeddings(
        &self,
        request: &EmbeddingsRequest,
        ctx: &CallContext,
    ) -> Result<EmbeddingsResponse, UpstreamError> {
        let body = self.payload_with_model(request)?;
        bounded(ctx, "embeddings", async {
            let response = self.post_json("embeddings", &body, ctx).await?;
            response
                .json::<EmbeddingsResponse>()
                .await
                .map_err(|err| UpstreamError::transient(format!("malformed response: {err}")))
        })
        .await
    }

    async fn transcription(
        &self,
        request: &TranscriptionRequest,
        ctx: &CallContext,
    ) -> Result<TranscriptionResponse, UpstreamError> {
        let mut form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(request.audio.to_vec())
                    .file_name(request.file_name.clone()),
            )
            .text("model", self.cfg.model.clone())
            .text("response_format", "json");
        if let Some(language) = &request.language {
            form = form.text("language", language.clone());
        }
        if let Some(prompt) = &request.prompt {
            form = form.text("prompt", prompt.clone());
        }
        if let Some(temperature) = request.temperature {
            form = form.text("temperature", temperature.to_string());
        }

        let mut headers = self.headers()?;
        // The multipart boundary sets its own content type.
        headers.remove(CONTENT_TYPE);

        bounded(ctx, "transcription", async {
            let response = self
                .http
                .post(self.url("audio/transcriptions"))
                .headers(headers)
                .multipart(form)
                .timeout(ctx.deadline)
                .send()
                .await?;
            let response = Self::check_status(response).await?;
            response
                .json::<TranscriptionResponse>()
                .await
                .map_err(|err| UpstreamError::transient(format!("malformed response: {err}")))
        })
        .await
    }

    async fn speech(
        &self,
        request: &SpeechRequest,
        ctx: &CallContext,
    ) -> Result<SpeechAudio, UpstreamError> {
        let body = self.payload_with_model(request)?;
        bounded(ctx, "speech", async {
            let response = self.post_json("audio/speech", &body, ctx).await?;
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("audio/mpeg")
                .to_string();
            let audio = response
                .bytes()
                .await
                .map_err(|err| UpstreamError::transient(err.to_string()))?;
            Ok(SpeechAudio {
                content_type,
                audio,
            })
        })
        .await
    }

    async fn image_generate(
        &self,
        request: &ImageGenerationRequest,
        ctx: &CallContext,
    ) -> Result<ImageGenerationResponse, UpstreamError> {
        let body = self.payload_with_model(request)?;
        bounded(ctx, "image-generate", async {
            let response = self.post_json("images/generations", &body, ctx).await?;
            response
                .json::<ImageGenerationResponse>()
                .await
                .map_err(|err| UpstreamError::transient(format!("malformed response: {err}")))
        })
        .await
    }

    async fn health_check(&self, ctx: &CallContext) -> Result<bool, UpstreamError> {
        let response = bounded(ctx, "health-check", async {
            self.http
                .get(self.url("models"))
                .headers(self.headers()?)
                .timeout(ctx.deadline)
                .send()
                .await
                .map_err(UpstreamError::from)
        })
        .await?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, Role};
    use std::time::Duration;

    fn provider(model: &str) -> OpenAiProvider {
        OpenAiProvider::new(OpenAiConfig {
            model: model.to_string(),
            api_key: "sk-test".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            organization: None,
            custom_headers: Vec::new(),
            timeout: Duration::from_secs(30),
        })
    }

    fn request() -> ChatRequest {
        serde_json::from_value(serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 64
        }))
        .unwrap()
    }

    #[test]
    fn chat_body_substitutes_configured_model() {
        let body = provider("gpt-4o-deployed").chat_body(&request(), false).unwrap();
        assert_eq!(body["model"], "gpt-4o-deployed");
        assert_eq!(body["stream"], false);
        assert_eq!(body["max_tokens"], 64);
    }

    #[test]
    fn reasoning_models_get_completion_token_field() {
        let body = provider("o4-mini").chat_body(&request(), false).unwrap();
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["max_completion_tokens"], 64);
    }

    #[test]
    fn streaming_requests_ask_for_usage() {
        let body = provider("gpt-4").chat_body(&request(), true).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn message_order_survives_serialization() {
        let mut req = request();
        req.messages = vec![
            ChatMessage::text(Role::System, "first"),
            ChatMessage::text(Role::User, "second"),
            ChatMessage::text(Role::Assistant, "third"),
        ];
        let body = provider("gpt-4").chat_body(&req, false).unwrap();
        let contents: Vec<&str> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["content"].as_str().unwrap())
            .collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }
}
