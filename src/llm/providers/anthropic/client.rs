use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;

use super::config::{AnthropicConfig, API_VERSION};
use super::types::{
    map_stop_reason, to_chat_response, to_messages_request, BlockDelta, MessagesResponse,
    StreamEvent,
};
use crate::llm::providers::openai::read_retry_after;
use crate::llm::providers::{
    bounded, CallContext, ChunkStream, Provider, ProviderKind, UpstreamError,
};
use crate::llm::sse::{self, SseEvent};
use crate::llm::{
    completion_id, ChatRequest, ChatResponse, MessageDelta, Role, StreamChoice, StreamChunk,
    Usage,
};

pub struct AnthropicProvider {
    http: Client,
    cfg: AnthropicConfig,
}

/// Accumulated stream identity and token counts, filled in as the named
/// events arrive and flushed into the terminal chunk.
struct StreamState {
    id: String,
    model: String,
    created: i64,
    input_tokens: u32,
    output_tokens: u32,
    stop_reason: Option<String>,
}

impl AnthropicProvider {
    pub fn new(cfg: AnthropicConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }

    fn headers(&self) -> Result<HeaderMap, UpstreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.cfg.api_key)
                .map_err(|_| UpstreamError::permanent(None, "api key is not a valid header"))?,
        );
        Ok(headers)
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.cfg.api_base)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let retry_after = read_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|value| {
                value
                    .get("error")
                    .and_then(|error| error.get("message"))
                    .and_then(|message| message.as_str())
                    .map(str::to_string)
            })
            .unwrap_or(body);
        Err(UpstreamError::from_status(status, message, retry_after))
    }

    fn translate_event(
        state: &mut StreamState,
        event: SseEvent,
    ) -> Vec<Result<StreamChunk, UpstreamError>> {
        let parsed: StreamEvent = match serde_json::from_str(&event.data) {
            Ok(parsed) => parsed,
            // Unknown event shapes are forward-compatible noise.
            Err(_) => return Vec::new(),
        };

        match parsed {
            StreamEvent::MessageStart { message } => {
                state.id = message.id;
                state.input_tokens = message.usage.input_tokens;
                vec![Ok(StreamChunk {
                    id: state.id.clone(),
                    object: "chat.completion.chunk".to_string(),
                    created: state.created,
                    model: state.model.clone(),
                    choices: vec![StreamChoice {
                        index: 0,
                        delta: Some(MessageDelta {
                            role: Some(Role::Assistant),
                            content: Some(String::new()),
                            tool_calls: None,
                        }),
                        text: None,
                        finish_reason: None,
                    }],
                    usage: None,
                })]
            }
            StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                BlockDelta::TextDelta { text } => vec![Ok(StreamChunk {
                    id: state.id.clone(),
                    object: "chat.completion.chunk".to_string(),
                    created: state.created,
                    model: state.model.clone(),
                    choices: vec![StreamChoice {
                        index: 0,
                        delta: Some(MessageDelta {
                            role: None,
                            content: Some(text),
                            tool_calls: None,
                        }),
                        text: None,
                        finish_reason: None,
                    }],
                    usage: None,
                })],
                BlockDelta::InputJsonDelta { .. } => Vec::new(),
            },
            StreamEvent::MessageDelta { delta, usage } => {
                state.stop_reason = delta.stop_reason;
                if let Some(usage) = usage {
                    state.output_tokens = usage.output_tokens;
                }
                Vec::new()
            }
            StreamEvent::MessageStop => {
                let finish = state
                    .stop_reason
                    .as_deref()
                    .map(map_stop_reason)
                    .unwrap_or("stop");
                vec![Ok(StreamChunk {
                    id: state.id.clone(),
                    object: "chat.completion.chunk".to_string(),
                    created: state.created,
                    model: state.model.clone(),
                    choices: vec![StreamChoice {
                        index: 0,
                        delta: Some(MessageDelta::default()),
                        text: None,
                        finish_reason: Some(finish.to_string()),
                    }],
                    usage: Some(Usage {
                        prompt_tokens: state.input_tokens,
                        completion_tokens: state.output_tokens,
                        total_tokens: state.input_tokens + state.output_tokens,
                    }),
                })]
            }
            StreamEvent::Error { error } => {
                vec![Err(UpstreamError::transient(error.message))]
            }
            StreamEvent::Ping
            | StreamEvent::ContentBlockStart { .. }
            | StreamEvent::ContentBlockStop { .. }
            | StreamEvent::Unknown => Vec::new(),
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn supports_model(&self, model: &str) -> bool {
        model == self.cfg.model || model.starts_with("claude-")
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChatResponse, UpstreamError> {
        let wire = to_messages_request(&self.cfg.model, request, false);
        let logical_model = request.model.clone();
        bounded(ctx, "chat", async {
            let response = self
                .http
                .post(self.messages_url())
                .headers(self.headers()?)
                .json(&wire)
                .timeout(ctx.deadline)
                .send()
                .await?;
            let response = Self::check_status(response).await?;
            let parsed: MessagesResponse = response
                .json()
                .await
                .map_err(|err| UpstreamError::transient(format!("malformed response: {err}")))?;
            Ok(to_chat_response(&logical_model, parsed))
        })
        .await
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        ctx: &CallContext,
    ) -> Result<ChunkStream, UpstreamError> {
        let wire = to_messages_request(&self.cfg.model, request, true);
        let url = self.messages_url();
        let headers = self.headers()?;
        let http = self.http.clone();
        let response = bounded(ctx, "chat-stream", async move {
            let response = http.post(&url).headers(headers).json(&wire).send().await?;
            Self::check_status(response).await
        })
        .await?;

        let state = StreamState {
            id: completion_id(),
            model: request.model.clone(),
            created: chrono::Utc::now().timestamp(),
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: None,
        };

        let cancel = ctx.cancel.clone();
        let chunks = sse::event_stream(response)
            .take_until(Box::pin(cancel.cancelled_owned()))
            .scan(state, |state, event| {
                let out = match event {
                    Ok(event) => Self::translate_event(state, event),
                    Err(err) => vec![Err(err)],
                };
                futures::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter);
        Ok(Box::pin(chunks))
    }

    async fn health_check(&self, ctx: &CallContext) -> Result<bool, UpstreamError> {
        let response = bounded(ctx, "health-check", async {
            self.http
                .get(format!("{}/v1/models", self.cfg.api_base))
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

    fn state() -> StreamState {
        StreamState {
            id: "chatcmpl-x".into(),
            model: "claude-3-opus".into(),
            created: 0,
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: None,
        }
    }

    fn event(data: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: data.to_string(),
            id: None,
        }
    }

    #[test]
    fn message_start_emits_role_chunk_and_captures_usage() {
        let mut s = state();
        let chunks = AnthropicProvider::translate_event(
            &mut s,
            event(r#"{"type":"message_start","message":{"id":"msg_1","model":"claude-3-opus-20240229","usage":{"input_tokens":12,"output_tokens":0}}}"#),
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(s.input_tokens, 12);
        assert_eq!(s.id, "msg_1");
    }

    #[test]
    fn text_deltas_become_content_chunks() {
        let mut s = state();
        let chunks = AnthropicProvider::translate_event(
            &mut s,
            event(r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"hel"}}"#),
        );
        let chunk = chunks[0].as_ref().unwrap();
        assert_eq!(chunk.choices[0].content(), Some("hel"));
    }

    #[test]
    fn message_stop_flushes_finish_reason_and_usage() {
        let mut s = state();
        s.input_tokens = 10;
        AnthropicProvider::translate_event(
            &mut s,
            event(r#"{"type":"message_delta","delta":{"stop_reason":"max_tokens"},"usage":{"output_tokens":42}}"#),
        );
        let chunks = AnthropicProvider::translate_event(&mut s, event(r#"{"type":"message_stop"}"#));
        let chunk = chunks[0].as_ref().unwrap();
        assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("length"));
        assert_eq!(chunk.usage.as_ref().unwrap().total_tokens, 52);
    }

    #[test]
    fn pings_are_silent() {
        let mut s = state();
        assert!(AnthropicProvider::translate_event(&mut s, event(r#"{"type":"ping"}"#)).is_empty());
    }
}
