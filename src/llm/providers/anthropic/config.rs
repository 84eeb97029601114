use std::time::Duration;

use crate::config::ProviderParams;
use crate::error::GatewayError;

pub const DEFAULT_API_BASE: &str = "https://api.anthropic.com";
pub const API_VERSION: &str = "2023-06-01";

/// Messages API requires max_tokens; used when the caller omits it.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub model: String,
    pub api_key: String,
    pub api_base: String,
    pub timeout: Duration,
}

impl AnthropicConfig {
    pub fn from_params(
        model: &str,
        params: &ProviderParams,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let api_key = params.api_key.clone().ok_or_else(|| {
            GatewayError::BadRequest(format!("model '{model}': api_key is required"))
        })?;
        Ok(Self {
            model: model.to_string(),
            api_key,
            api_base: params
                .api_base
                .clone()
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            timeout,
        })
    }
}
