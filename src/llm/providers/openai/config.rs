//! Adapter configuration, decoded once from the instance's provider params.

use std::time::Duration;

use crate::config::ProviderParams;
use crate::error::GatewayError;

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    /// Model name sent to the backend (routing prefix already stripped).
    pub model: String,
    pub api_key: String,
    pub api_base: String,
    pub organization: Option<String>,
    pub custom_headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn from_params(
        model: &str,
        params: &ProviderParams,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let api_key = params.api_key.clone().ok_or_else(|| {
            GatewayError::BadRequest(format!("model '{model}': api_key is required"))
        })?;

        let api_base = params
            .api_base
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
            .trim_end_matches('/')
            .to_string();

        // The open `extra` bag is decoded here and nowhere else.
        let organization = params
            .extra
            .get("organization")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let custom_headers = params
            .extra
            .get("headers")
            .and_then(|v| v.as_object())
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            model: model.to_string(),
            api_key,
            api_base,
            organization,
            custom_headers,
            timeout,
        })
    }
}

/// Reasoning-family models reject `max_tokens` and want
/// `max_completion_tokens` instead.
pub fn uses_completion_token_field(model: &str) -> bool {
    model.starts_with("o1") || model.starts_with("o3") || model.starts_with("o4")
}
