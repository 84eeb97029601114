//! Logical model registry: name -> instances, alias expansion, fallback
//! chains, and the atomically swappable snapshot that configuration
//! reloads publish.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::info;

use super::breaker::BreakerConfig;
use super::instance::Instance;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::llm::providers;

#[derive(Default)]
struct ModelGroup {
    instances: Vec<Arc<Instance>>,
}

/// Immutable view of the configured model topology. Handlers read whatever
/// snapshot was current when their request began; a reload swaps the
/// pointer and in-flight requests finish against the old world.
pub struct RegistrySnapshot {
    models: HashMap<String, ModelGroup>,
    aliases: HashMap<String, Vec<String>>,
    fallbacks: HashMap<String, String>,
    /// Listing order for the models endpoint.
    names: Vec<String>,
}

impl RegistrySnapshot {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let mut models: HashMap<String, ModelGroup> = HashMap::new();
        let mut names = Vec::new();
        let breaker_config = BreakerConfig {
            failure_threshold: config.router.circuit_breaker_threshold,
            cooldown: config.router.breaker_cooldown(),
            ..Default::default()
        };

        for (index, entry) in config.model_list.iter().enumerate() {
            let timeout = entry
                .timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.router.base_timeout());
            let provider = providers::build(&entry.params, timeout)?;
            let instance = Arc::new(Instance::new(
                format!("{}:{}:{}", entry.model_name, provider.kind(), index),
                entry.model_name.clone(),
                provider,
                entry.priority,
                entry.weight,
                entry.enabled,
                entry.rpm,
                entry.tpm,
                timeout,
                breaker_config.clone(),
            ));

            if !models.contains_key(&entry.model_name) {
                names.push(entry.model_name.clone());
            }
            models
                .entry(entry.model_name.clone())
                .or_default()
                .instances
                .push(instance);
        }

        info!(
            models = names.len(),
            aliases = config.model_aliases.len(),
            "registry snapshot built"
        );
        Ok(Self {
            models,
            aliases: config.model_aliases.clone(),
            fallbacks: config.router.model_fallbacks.clone(),
            names,
        })
    }

    /// Assemble a snapshot straight from instances, bypassing provider
    /// construction. Embedders and tests wire custom providers this way.
    pub fn from_instances(
        groups: Vec<(String, Vec<Arc<Instance>>)>,
        aliases: HashMap<String, Vec<String>>,
        fallbacks: HashMap<String, String>,
    ) -> Self {
        let mut models: HashMap<String, ModelGroup> = HashMap::new();
        let mut names = Vec::new();
        for (name, instances) in groups {
            if !models.contains_key(&name) {
                names.push(name.clone());
            }
            models.entry(name).or_default().instances.extend(instances);
        }
        Self {
            models,
            aliases,
            fallbacks,
            names,
        }
    }

    /// Expand a caller-supplied name into logical names. Aliases resolve
    /// exactly one level; plain names pass through.
    pub fn expand(&self, name: &str) -> Vec<String> {
        match self.aliases.get(name) {
            Some(targets) => targets.clone(),
            None => vec![name.to_string()],
        }
    }

    /// Enabled instances of every logical name in the expansion, in order.
    /// Duplicates are permitted; the orchestrator skips tried instances.
    pub fn resolve(&self, name: &str) -> Result<Vec<Arc<Instance>>, GatewayError> {
        let mut pool = Vec::new();
        for logical in self.expand(name) {
            if let Some(group) = self.models.get(&logical) {
                pool.extend(
                    group
                        .instances
                        .iter()
                        .filter(|instance| instance.enabled)
                        .cloned(),
                );
            }
        }
        if pool.is_empty() {
            return Err(GatewayError::ModelNotFound(name.to_string()));
        }
        Ok(pool)
    }

    /// The fallback chain for a name: follow `model_fallbacks` links from
    /// each expanded logical, skipping repeats.
    pub fn fallback_chain(&self, name: &str) -> Vec<String> {
        let expansion = self.expand(name);
        let mut seen: HashSet<String> = expansion.iter().cloned().collect();
        seen.insert(name.to_string());
        let mut chain = Vec::new();
        let mut frontier = expansion;
        frontier.push(name.to_string());

        for start in frontier {
            let mut current = start;
            while let Some(next) = self.fallbacks.get(&current) {
                if !seen.insert(next.clone()) {
                    break;
                }
                chain.push(next.clone());
                current = next.clone();
            }
        }
        chain
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name) || self.aliases.contains_key(name)
    }

    /// Logical names plus aliases, in configuration order, for listing.
    pub fn model_names(&self) -> Vec<String> {
        let mut names = self.names.clone();
        let mut aliases: Vec<String> = self.aliases.keys().cloned().collect();
        aliases.sort();
        names.extend(aliases);
        names
    }

    pub fn instances_of(&self, logical: &str) -> Vec<Arc<Instance>> {
        self.models
            .get(logical)
            .map(|group| group.instances.clone())
            .unwrap_or_default()
    }

    pub fn all_instances(&self) -> Vec<Arc<Instance>> {
        self.names
            .iter()
            .flat_map(|name| self.instances_of(name))
            .collect()
    }
}

pub struct ModelRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
}

impl ModelRegistry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self, GatewayError> {
        Ok(Self::new(RegistrySnapshot::from_config(config)?))
    }

    pub fn load(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Atomically publish a new snapshot; existing requests keep the old
    /// one until they finish.
    pub fn reload(&self, snapshot: RegistrySnapshot) {
        self.snapshot.store(Arc::new(snapshot));
        info!("registry snapshot swapped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(yaml: &str) -> GatewayConfig {
        GatewayConfig::parse(yaml).unwrap()
    }

    const TOPOLOGY: &str = r#"
model_list:
  - model_name: gpt-4-openai
    params: { model: openai/gpt-4, api_key: sk-a }
  - model_name: gpt-4-azure
    params: { model: azure/gpt4-prod, api_key: az-b, api_base: "https://acme.openai.azure.com" }
  - model_name: gpt-35
    params: { model: openai/gpt-3.5-turbo, api_key: sk-a }
  - model_name: gpt-4-openai
    params: { model: openai/gpt-4, api_key: sk-backup }
    priority: 2
model_aliases:
  smart: [gpt-4-openai, gpt-4-azure]
router:
  model_fallbacks:
    gpt-4-openai: gpt-35
"#;

    #[test]
    fn plain_names_resolve_to_their_instances() {
        let snapshot = RegistrySnapshot::from_config(&config(TOPOLOGY)).unwrap();
        let pool = snapshot.resolve("gpt-4-openai").unwrap();
        assert_eq!(pool.len(), 2);
        assert!(pool.iter().all(|inst| inst.logical_model == "gpt-4-openai"));
    }

    #[test]
    fn alias_expands_in_order_and_only_one_level() {
        let snapshot = RegistrySnapshot::from_config(&config(TOPOLOGY)).unwrap();
        assert_eq!(snapshot.expand("smart"), vec!["gpt-4-openai", "gpt-4-azure"]);
        let pool = snapshot.resolve("smart").unwrap();
        assert_eq!(pool.len(), 3);
        // Expansion order is preserved: openai instances first.
        assert_eq!(pool[0].logical_model, "gpt-4-openai");
        assert_eq!(pool[2].logical_model, "gpt-4-azure");
    }

    #[test]
    fn unknown_model_is_not_found() {
        let snapshot = RegistrySnapshot::from_config(&config(TOPOLOGY)).unwrap();
        assert!(matches!(
            snapshot.resolve("nope"),
            Err(GatewayError::ModelNotFound(_))
        ));
    }

    #[test]
    fn fallback_chain_follows_links_without_repeats() {
        let snapshot = RegistrySnapshot::from_config(&config(TOPOLOGY)).unwrap();
        assert_eq!(snapshot.fallback_chain("gpt-4-openai"), vec!["gpt-35"]);
        assert!(snapshot.fallback_chain("gpt-35").is_empty());
    }

    #[test]
    fn disabled_instances_are_excluded_from_resolution() {
        let yaml = r#"
model_list:
  - model_name: gpt-4
    enabled: false
    params: { model: openai/gpt-4, api_key: sk-a }
"#;
        let snapshot = RegistrySnapshot::from_config(&config(yaml)).unwrap();
        assert!(matches!(
            snapshot.resolve("gpt-4"),
            Err(GatewayError::ModelNotFound(_))
        ));
    }

    #[test]
    fn reload_swaps_the_snapshot_atomically() {
        let registry = ModelRegistry::from_config(&config(TOPOLOGY)).unwrap();
        let before = registry.load();
        assert!(before.contains("smart"));

        let smaller = r#"
model_list:
  - model_name: gpt-35
    params: { model: openai/gpt-3.5-turbo, api_key: sk-a }
"#;
        registry.reload(RegistrySnapshot::from_config(&config(smaller)).unwrap());
        assert!(!registry.load().contains("smart"));
        // The old snapshot stays valid for holders.
        assert!(before.contains("smart"));
    }

    #[test]
    fn model_names_list_models_then_aliases() {
        let snapshot = RegistrySnapshot::from_config(&config(TOPOLOGY)).unwrap();
        let names = snapshot.model_names();
        assert_eq!(names[0], "gpt-4-openai");
        assert!(names.contains(&"smart".to_string()));
    }
}
