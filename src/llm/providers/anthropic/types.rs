//! Anthropic wire types and the canonical <-> messages-API translation.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::llm::{
    completion_id, ChatChoice, ChatMessage, ChatRequest, ChatResponse, ContentPart,
    FunctionCall, MessageContent, Role, StringOrList, ToolCall, Usage,
};

use super::config::DEFAULT_MAX_TOKENS;

#[derive(Debug, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<WireTool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: String,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Url { url: String },
}

#[derive(Debug, Serialize)]
pub struct WireTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub usage: WireUsage,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

/// Streaming events, tagged by `type`. Unknown events are ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Ping,
    MessageStart {
        message: StreamMessageStart,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    MessageStop,
    Error {
        error: StreamError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct StreamMessageStart {
    pub id: String,
    pub model: String,
    #[serde(default)]
    pub usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamError {
    pub message: String,
}

/// Map a stop reason onto the OpenAI vocabulary.
pub fn map_stop_reason(reason: &str) -> &'static str {
    match reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

/// Build a messages-API request from the canonical chat request. System
/// messages are folded into the top-level `system` field in order; the
/// remaining messages keep their relative order.
pub fn to_messages_request(model: &str, request: &ChatRequest, stream: bool) -> MessagesRequest {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();

    for message in &request.messages {
        match message.role {
            Role::System => {
                if let Some(content) = &message.content {
                    system_parts.push(content.text());
                }
            }
            Role::Assistant => {
                let mut blocks = content_blocks(message.content.as_ref());
                if let Some(tool_calls) = &message.tool_calls {
                    for call in tool_calls {
                        blocks.push(ContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.function.name.clone(),
                            input: serde_json::from_str(&call.function.arguments)
                                .unwrap_or_else(|_| json!({})),
                        });
                    }
                }
                messages.push(WireMessage {
                    role: "assistant".to_string(),
                    content: blocks,
                });
            }
            Role::Tool => {
                messages.push(WireMessage {
                    role: "user".to_string(),
                    content: vec![ContentBlock::ToolResult {
                        tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                        content: message
                            .content
                            .as_ref()
                            .map(MessageContent::text)
                            .unwrap_or_default(),
                    }],
                });
            }
            Role::User | Role::Function => {
                messages.push(WireMessage {
                    role: "user".to_string(),
                    content: content_blocks(message.content.as_ref()),
                });
            }
        }
    }

    let tools = request
        .tools
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|tool| WireTool {
            name: tool.function.name.clone(),
            description: tool.function.description.clone(),
            input_schema: tool
                .function
                .parameters
                .clone()
                .unwrap_or_else(|| json!({ "type": "object" })),
        })
        .collect();

    MessagesRequest {
        model: model.to_string(),
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
        temperature: request.temperature,
        top_p: request.top_p,
        stop_sequences: request
            .stop
            .clone()
            .map(StringOrList::into_vec)
            .unwrap_or_default(),
        stream,
        tools,
    }
}

fn content_blocks(content: Option<&MessageContent>) -> Vec<ContentBlock> {
    match content {
        None => Vec::new(),
        Some(MessageContent::Text(text)) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![ContentBlock::Text { text: text.clone() }]
            }
        }
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .map(|part| match part {
                ContentPart::Text { text } => ContentBlock::Text { text: text.clone() },
                ContentPart::ImageUrl { image_url } => ContentBlock::Image {
                    source: ImageSource::Url {
                        url: image_url.url.clone(),
                    },
                },
            })
            .collect(),
    }
}

/// Fold a messages-API response back into the canonical chat shape.
pub fn to_chat_response(logical_model: &str, response: MessagesResponse) -> ChatResponse {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for block in response.content {
        match block {
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                kind: "function".to_string(),
                function: FunctionCall {
                    name,
                    arguments: input.to_string(),
                },
            }),
            _ => {}
        }
    }

    let finish_reason = response
        .stop_reason
        .as_deref()
        .map(map_stop_reason)
        .unwrap_or("stop")
        .to_string();

    ChatResponse {
        id: if response.id.is_empty() {
            completion_id()
        } else {
            response.id
        },
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: logical_model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: Role::Assistant,
                content: (!text.is_empty()).then(|| MessageContent::Text(text)),
                name: None,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
            },
            finish_reason: Some(finish_reason),
            logprobs: None,
        }],
        usage: Some(Usage {
            prompt_tokens: response.usage.input_tokens,
            completion_tokens: response.usage.output_tokens,
            total_tokens: response.usage.input_tokens + response.usage.output_tokens,
        }),
        system_fingerprint: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: serde_json::Value) -> ChatRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn system_messages_move_to_top_level() {
        let req = request(json!({
            "model": "claude-3-opus",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"}
            ]
        }));
        let wire = to_messages_request("claude-3-opus-20240229", &req, false);
        assert_eq!(wire.system.as_deref(), Some("be terse"));
        assert_eq!(wire.messages.len(), 1);
        assert_eq!(wire.messages[0].role, "user");
    }

    #[test]
    fn vision_blocks_survive_translation() {
        let req = request(json!({
            "model": "claude-3-opus",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "describe"},
                {"type": "image_url", "image_url": {"url": "https://example.com/x.png"}}
            ]}]
        }));
        let wire = to_messages_request("claude-3-opus-20240229", &req, false);
        assert_eq!(wire.messages[0].content.len(), 2);
        assert!(matches!(wire.messages[0].content[1], ContentBlock::Image { .. }));
    }

    #[test]
    fn stop_reasons_map_to_openai_vocabulary() {
        assert_eq!(map_stop_reason("end_turn"), "stop");
        assert_eq!(map_stop_reason("max_tokens"), "length");
        assert_eq!(map_stop_reason("tool_use"), "tool_calls");
    }

    #[test]
    fn response_folds_tool_use_into_tool_calls() {
        let response = MessagesResponse {
            id: "msg_1".into(),
            model: "claude-3-opus-20240229".into(),
            content: vec![
                ContentBlock::Text { text: "calling".into() },
                ContentBlock::ToolUse {
                    id: "toolu_1".into(),
                    name: "get_weather".into(),
                    input: json!({"city": "Berlin"}),
                },
            ],
            stop_reason: Some("tool_use".into()),
            usage: WireUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
        };
        let chat = to_chat_response("claude-3-opus", response);
        let message = &chat.choices[0].message;
        assert_eq!(message.tool_calls.as_ref().unwrap().len(), 1);
        assert_eq!(chat.choices[0].finish_reason.as_deref(), Some("tool_calls"));
        assert_eq!(chat.usage.as_ref().unwrap().total_tokens, 15);
    }
}
