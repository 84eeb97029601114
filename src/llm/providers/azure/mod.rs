//! Azure OpenAI backend adapter. Same wire shapes as OpenAI, different
//! addressing: per-deployment URLs, `api-key` auth and an api-version
//! query parameter.

mod client;
mod config;

pub use client::AzureProvider;
pub use config::AzureConfig;
