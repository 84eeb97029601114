//! Gateway configuration: YAML schema, environment expansion and the
//! legacy-shape rewrite.
//!
//! The file is loaded at startup and again on SIGHUP; a successful reload
//! produces a fresh registry snapshot, so a broken edit never takes down
//! in-flight traffic.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::router::strategy::RoutingStrategy;

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Opaque per-backend parameters. `model` carries the routing prefix
/// (`azure/…`, `anthropic/…`); everything the adapter family understands
/// beyond the common fields goes into `extra` and is decoded once at
/// adapter construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderParams {
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub model_name: String,
    pub params: ProviderParams,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// 0 means uncapped.
    #[serde(default)]
    pub rpm: u32,
    #[serde(default)]
    pub tpm: u32,
    /// Per-instance base timeout in seconds; falls back to the router-wide
    /// default.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default = "crate::config::default_enabled")]
    pub enabled: bool,
}

pub(crate) fn default_enabled() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_timeout_multiple() -> f64 {
    1.5
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown() -> u64 {
    30
}

fn default_health_interval() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    120
}

fn default_max_attempt_timeout() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub routing_strategy: RoutingStrategy,
    #[serde(default = "default_true")]
    pub enable_failover: bool,
    #[serde(default = "default_retry_attempts")]
    pub instance_retry_attempts: u32,
    #[serde(default = "default_true")]
    pub enable_model_fallback: bool,
    #[serde(default = "default_timeout_multiple")]
    pub failover_timeout_multiple: f64,
    /// Logical model -> fallback logical model.
    #[serde(default)]
    pub model_fallbacks: HashMap<String, String>,
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    /// Seconds.
    #[serde(default = "default_breaker_cooldown")]
    pub circuit_breaker_cooldown: u64,
    /// Seconds; 0 disables the background prober.
    #[serde(default = "default_health_interval")]
    pub health_check_interval: u64,
    /// Base per-attempt timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Hard cap on the compounded attempt timeout, in seconds.
    #[serde(default = "default_max_attempt_timeout")]
    pub max_attempt_timeout: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty router config deserializes")
    }
}

impl RouterConfig {
    pub fn base_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_secs(self.max_attempt_timeout)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_cooldown)
    }
}

fn default_pool_size() -> u32 {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_check_timeout_ms() -> u64 {
    1000
}

fn default_alert_thresholds() -> Vec<f64> {
    vec![0.8, 1.0]
}

fn default_alert_channel() -> String {
    "budget:alerts".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetGuardConfig {
    /// Seconds the cached budget state stays fresh. Capped at five minutes.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
    /// Shared-store budget operations time out after this long and fall
    /// back to the authoritative path.
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
    /// Fractions of max budget that trigger an alert when first crossed.
    #[serde(default = "default_alert_thresholds")]
    pub alert_thresholds: Vec<f64>,
    #[serde(default = "default_alert_channel")]
    pub alert_channel: String,
}

impl Default for BudgetGuardConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty budget config deserializes")
    }
}

impl BudgetGuardConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl.min(300))
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms.min(1000))
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_usage_interval() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_usage_stream() -> String {
    "usage:stream".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds between forced drains; a full batch triggers earlier.
    #[serde(default = "default_usage_interval")]
    pub interval: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_usage_stream")]
    pub stream: String,
}

impl Default for UsageConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty usage config deserializes")
    }
}

impl UsageConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub model_list: Vec<ModelEntry>,
    #[serde(default)]
    pub model_aliases: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub budget: BudgetGuardConfig,
    #[serde(default)]
    pub usage: UsageConfig,
}

impl GatewayConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|err| {
            GatewayError::Internal(format!(
                "cannot read config {}: {err}",
                path.as_ref().display()
            ))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        let expanded = expand_env(raw);
        let mut value: serde_yaml::Value = serde_yaml::from_str(&expanded)
            .map_err(|err| GatewayError::BadRequest(format!("invalid config yaml: {err}")))?;
        rewrite_legacy_shapes(&mut value);
        let config: GatewayConfig = serde_yaml::from_value(value)
            .map_err(|err| GatewayError::BadRequest(format!("invalid config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), GatewayError> {
        if self.model_list.is_empty() {
            return Err(GatewayError::BadRequest(
                "model_list must contain at least one entry".into(),
            ));
        }
        for entry in &self.model_list {
            if entry.weight == 0 {
                return Err(GatewayError::BadRequest(format!(
                    "model '{}': weight must be positive",
                    entry.model_name
                )));
            }
            if entry.params.model.is_empty() {
                return Err(GatewayError::BadRequest(format!(
                    "model '{}': params.model is required",
                    entry.model_name
                )));
            }
            if let Some(api_base) = &entry.params.api_base {
                url::Url::parse(api_base).map_err(|err| {
                    GatewayError::BadRequest(format!(
                        "model '{}': api_base '{api_base}' is not a valid url: {err}",
                        entry.model_name
                    ))
                })?;
            }
        }

        let model_names: std::collections::HashSet<&str> = self
            .model_list
            .iter()
            .map(|entry| entry.model_name.as_str())
            .collect();
        for (alias, targets) in &self.model_aliases {
            if model_names.contains(alias.as_str()) {
                return Err(GatewayError::BadRequest(format!(
                    "alias '{alias}' collides with a configured model name"
                )));
            }
            for target in targets {
                if self.model_aliases.contains_key(target) {
                    return Err(GatewayError::BadRequest(format!(
                        "alias '{alias}' points at alias '{target}'; aliases resolve one level only"
                    )));
                }
                if !model_names.contains(target.as_str()) {
                    return Err(GatewayError::BadRequest(format!(
                        "alias '{alias}' points at unknown model '{target}'"
                    )));
                }
            }
        }
        for (model, fallback) in &self.router.model_fallbacks {
            if !model_names.contains(fallback.as_str()) && !self.model_aliases.contains_key(fallback)
            {
                return Err(GatewayError::BadRequest(format!(
                    "fallback for '{model}' points at unknown model '{fallback}'"
                )));
            }
        }
        Ok(())
    }
}

/// Replace `${VAR}` with the environment value. Missing variables keep the
/// literal text; validating is the caller's choice.
pub fn expand_env(raw: &str) -> String {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex compiles");
    pattern
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Accept the legacy `provider: {…}` key on model entries and rewrite it
/// into the canonical `params: {…}` before typed deserialization.
fn rewrite_legacy_shapes(value: &mut serde_yaml::Value) {
    let Some(entries) = value
        .get_mut("model_list")
        .and_then(serde_yaml::Value::as_sequence_mut)
    else {
        return;
    };
    for entry in entries {
        let Some(mapping) = entry.as_mapping_mut() else {
            continue;
        };
        let legacy_key = serde_yaml::Value::from("provider");
        let params_key = serde_yaml::Value::from("params");
        if !mapping.contains_key(&params_key) {
            if let Some(legacy) = mapping.remove(&legacy_key) {
                mapping.insert(params_key, legacy);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
model_list:
  - model_name: gpt-4
    params:
      model: openai/gpt-4
      api_key: sk-test
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = GatewayConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.router.instance_retry_attempts, 3);
        assert!(config.router.enable_failover);
        assert_eq!(config.model_list[0].weight, 1);
        assert!(config.model_list[0].enabled);
        assert_eq!(config.usage.batch_size, 100);
        assert_eq!(config.budget.alert_thresholds, vec![0.8, 1.0]);
    }

    #[test]
    fn env_expansion_leaves_missing_vars_literal() {
        std::env::set_var("SWITCHGATE_TEST_KEY", "sk-expanded");
        let raw = "key: ${SWITCHGATE_TEST_KEY}\nother: ${SWITCHGATE_MISSING_VAR}";
        let expanded = expand_env(raw);
        assert!(expanded.contains("sk-expanded"));
        assert!(expanded.contains("${SWITCHGATE_MISSING_VAR}"));
    }

    #[test]
    fn legacy_provider_shape_is_rewritten() {
        let raw = r#"
model_list:
  - model_name: gpt-4
    provider:
      model: openai/gpt-4
      api_key: sk-test
"#;
        let config = GatewayConfig::parse(raw).unwrap();
        assert_eq!(config.model_list[0].params.model, "openai/gpt-4");
    }

    #[test]
    fn alias_pointing_at_alias_is_rejected() {
        let raw = r#"
model_list:
  - model_name: gpt-4
    params: { model: openai/gpt-4, api_key: sk-test }
model_aliases:
  smart: [gpt-4]
  smarter: [smart]
"#;
        let err = GatewayConfig::parse(raw).unwrap_err();
        assert!(err.to_string().contains("one level"));
    }

    #[test]
    fn zero_weight_is_rejected() {
        let raw = r#"
model_list:
  - model_name: gpt-4
    weight: 0
    params: { model: openai/gpt-4, api_key: sk-test }
"#;
        assert!(GatewayConfig::parse(raw).is_err());
    }

    #[test]
    fn empty_model_list_is_rejected() {
        assert!(GatewayConfig::parse("model_list: []").is_err());
    }

    #[test]
    fn malformed_api_base_is_rejected() {
        let raw = r#"
model_list:
  - model_name: gpt-4
    params: { model: openai/gpt-4, api_key: sk-test, api_base: "not a url" }
"#;
        let err = GatewayConfig::parse(raw).unwrap_err();
        assert!(err.to_string().contains("api_base"));
    }
}
