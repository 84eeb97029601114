use std::time::Duration;

use crate::config::ProviderParams;
use crate::error::GatewayError;

pub const DEFAULT_API_VERSION: &str = "2024-06-01";

#[derive(Debug, Clone)]
pub struct AzureConfig {
    /// Azure deployment name (the `azure/...` suffix of `params.model`).
    pub deployment: String,
    pub api_key: String,
    /// Resource endpoint, e.g. `https://my-resource.openai.azure.com`.
    pub endpoint: String,
    pub api_version: String,
    pub region: Option<String>,
    /// Underlying model family when the deployment name does not reveal
    /// it (`extra.base_model`). Reasoning-family deployments reject
    /// `max_tokens` and want `max_completion_tokens`.
    pub base_model: Option<String>,
    pub timeout: Duration,
}

impl AzureConfig {
    pub fn from_params(
        deployment: &str,
        params: &ProviderParams,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let api_key = params.api_key.clone().ok_or_else(|| {
            GatewayError::BadRequest(format!("deployment '{deployment}': api_key is required"))
        })?;
        let endpoint = params
            .api_base
            .clone()
            .ok_or_else(|| {
                GatewayError::BadRequest(format!(
                    "deployment '{deployment}': api_base (resource endpoint) is required"
                ))
            })?
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            deployment: deployment.to_string(),
            api_key,
            endpoint,
            api_version: params
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            region: params.region.clone(),
            base_model: params
                .extra
                .get("base_model")
                .and_then(|value| value.as_str())
                .map(str::to_string),
            timeout,
        })
    }

    /// Whether this deployment needs the `max_completion_tokens` field,
    /// judged by the base-model hint or, failing that, the deployment
    /// name itself.
    pub fn uses_completion_tokens(&self) -> bool {
        let model = self.base_model.as_deref().unwrap_or(&self.deployment);
        crate::llm::providers::openai::uses_completion_token_field(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_model_hint_decides_token_field() {
        let mut params = ProviderParams {
            model: "azure/prod-reasoner".into(),
            api_key: Some("k".into()),
            api_base: Some("https://acme.openai.azure.com".into()),
            ..Default::default()
        };
        params.extra.insert(
            "base_model".into(),
            serde_json::Value::String("o4-mini".into()),
        );
        let cfg =
            AzureConfig::from_params("prod-reasoner", &params, Duration::from_secs(30)).unwrap();
        assert!(cfg.uses_completion_tokens());

        params.extra.clear();
        let cfg = AzureConfig::from_params("prod-reasoner", &params, Duration::from_secs(30))
            .unwrap();
        assert!(!cfg.uses_completion_tokens());
    }
}
