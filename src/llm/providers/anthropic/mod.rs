//! Anthropic messages-API adapter. Unlike the OpenAI family this backend
//! needs a real translation layer: system prompts move to a top-level
//! field, content becomes typed blocks, and streaming uses named events.

mod client;
mod config;
mod types;

pub use client::AnthropicProvider;
pub use config::AnthropicConfig;
