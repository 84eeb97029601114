//! OpenAI-compatible backend adapter.

mod client;
mod config;
mod types;

pub use client::OpenAiProvider;
pub use config::{uses_completion_token_field, OpenAiConfig};
pub use types::{parse_error_body, read_retry_after};
