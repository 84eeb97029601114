use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde_json::{json, Value};

use super::config::AzureConfig;
use crate::llm::providers::openai::{parse_error_body, read_retry_after};
use crate::llm::providers::{
    bounded, CallContext, ChunkStream, Provider, ProviderKind, UpstreamError,
};
use crate::llm::sse;
use crate::llm::{
    ChatRequest, ChatResponse, CompletionRequest, CompletionResponse, EmbeddingsRequest,
    EmbeddingsResponse, StreamChunk,
};

pub struct AzureProvider {
    http: Client,
    cfg: AzureConfig,
}

impl AzureProvider {
    pub fn new(cfg: AzureConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }

    fn url(&self, operation: &str) -> String {
        format!(
            "{}/openai/deployments/{}/{}?api-version={}",
            self.cfg.endpoint, self.cfg.deployment, operation, self.cfg.api_version
        )
    }

    fn headers(&self) -> Result<HeaderMap, UpstreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "api-key",
            HeaderValue::from_str(&self.cfg.api_key)
                .map_err(|_| UpstreamError::permanent(None, "api key is not a valid header"))?,
        );
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

    fn body_from<T: serde::Serialize>(
        &self,
        request: &T,
        stream: bool,
    ) -> Result<Value, UpstreamError> {
        let mut body = serde_json::to_value(request)
            .map_err(|err| UpstreamError::permanent(None, err.to_string()))?;
        if let Some(object) = body.as_object_mut() {
            // Azure addresses the deployment through the URL.
            object.remove("model");
            object.insert("stream".into(), json!(stream));
            if stream {
                object.insert("stream_options".into(), json!({ "include_usage": true }));
            } else {
                object.remove("stream_options");
            }
            if self.cfg.uses_completion_tokens() {
                if let Some(max) = object.remove("max_tokens") {
                    object.insert("max_completion_tokens".into(), max);
                }
            }
        }
        Ok(body)
    }

    async fn open_stream(
        &self,
        operation: &str,
        body: Value,
        ctx: &CallContext,
    ) -> Result<ChunkStream, UpstreamError> {
        let url = self.url(operation);
        let headers = self.headers()?;
        let http = self.http.clone();
        let response = bounded(ctx, operation, async move {
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

    async fn post(
        &self,
        operation: &str,
        body: &Value,
        ctx: &CallContext,
    ) -> Result<reqwest::Response, UpstreamError> {
        let response = self
            .http
            .post(self.url(operation))
            .headers(self.headers()?)
            .json(body)
            .timeout(ctx.deadline)
            .send()
            .await?;
        Self::check_status(response).await
    }
}

#[async_trait]
impl Provider for AzureProvider {
    fn name(&self) -> &str {
        "azure"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::AzureOpenAi
    }

    fn supports_model(&self, model: &str) -> bool {
        model == self.cfg.deployment
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChatResponse, UpstreamError> {
        let body = self.body_from(request, false)?;
        bounded(ctx, "chat", async {
            let response = self.post("chat/completions", &body, ctx).await?;
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
        let body = self.body_from(request, true)?;
        self.open_stream("chat/completions", body, ctx).await
    }

    async fn completion(
        &self,
        request: &CompletionRequest,
        ctx: &CallContext,
    ) -> Result<CompletionResponse, UpstreamError> {
        let body = self.body_from(request, false)?;
        bounded(ctx, "completion", async {
            let response = self.post("completions", &body, ctx).await?;
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
        let body = self.body_from(request, true)?;
        self.open_stream("completions", body, ctx).await
    }

    async fn embeddings(
        &self,
        request: &EmbeddingsRequest,
        ctx: &CallContext,
    ) -> Result<EmbeddingsResponse, UpstreamError> {
        let mut body = serde_json::to_value(request)
            .map_err(|err| UpstreamError::permanent(None, err.to_string()))?;
        if let Some(object) = body.as_object_mut() {
            object.remove("model");
        }
        bounded(ctx, "embeddings", async {
            let response = self.post("embeddings", &body, ctx).await?;
            response
                .json::<EmbeddingsResponse>()
                .await
                .map_err(|err| UpstreamError::transient(format!("malformed response: {err}")))
        })
        .await
    }

    async fn health_check(&self, ctx: &CallContext) -> Result<bool, UpstreamError> {
        // A deliberately tiny completion; Azure has no cheap list endpoint
        // scoped to a deployment.
        let probe = json!({
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1
        });
        let response = bounded(ctx, "health-check", async {
            self.http
                .post(self.url("chat/completions"))
                .headers(self.headers()?)
                .json(&probe)
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
    use std::time::Duration;

    fn provider() -> AzureProvider {
        provider_for(None)
    }

    fn provider_for(base_model: Option<&str>) -> AzureProvider {
        AzureProvider::new(AzureConfig {
            deployment: "gpt4-prod".into(),
            api_key: "azure-key".into(),
            endpoint: "https://acme.openai.azure.com".into(),
            api_version: "2024-06-01".into(),
            region: None,
            base_model: base_model.map(str::to_string),
            timeout: Duration::from_secs(30),
        })
    }

    #[test]
    fn url_addresses_the_deployment() {
        assert_eq!(
            provider().url("chat/completions"),
            "https://acme.openai.azure.com/openai/deployments/gpt4-prod/chat/completions?api-version=2024-06-01"
        );
    }

    #[test]
    fn body_drops_model_in_favor_of_url() {
        let request: ChatRequest = serde_json::from_value(serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        let body = provider().body_from(&request, false).unwrap();
        assert!(body.get("model").is_none());
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn reasoning_deployments_get_completion_token_field() {
        let request: ChatRequest = serde_json::from_value(serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}],
            "max_tokens": 64
        }))
        .unwrap();

        let body = provider_for(Some("o4-mini")).body_from(&request, false).unwrap();
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["max_completion_tokens"], 64);

        // Plain deployments keep the standard field.
        let body = provider().body_from(&request, false).unwrap();
        assert_eq!(body["max_tokens"], 64);
        assert!(body.get("max_completion_tokens").is_none());
    }
}
