//! Pluggable instance selection. Every policy is stateless, O(n) in the
//! candidate count, and never mutates an instance.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::instance::Instance;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// Ascending priority, insertion order breaking ties.
    #[default]
    Priority,
    /// Random, proportional to instance weight.
    Weighted,
    /// Ascending shared average latency of the owning logical model;
    /// unmeasured instances are tried eagerly.
    LeastLatency,
    /// Fewest in-flight requests.
    LeastBusy,
    /// Uniform random.
    Random,
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RoutingStrategy::Priority => "priority",
            RoutingStrategy::Weighted => "weighted",
            RoutingStrategy::LeastLatency => "least-latency",
            RoutingStrategy::LeastBusy => "least-busy",
            RoutingStrategy::Random => "random",
        };
        write!(f, "{name}")
    }
}

impl RoutingStrategy {
    /// Pick one instance from a non-empty candidate set. `latencies` maps
    /// logical model names to shared average latency in milliseconds; only
    /// `LeastLatency` consults it.
    pub fn select(
        &self,
        candidates: &[Arc<Instance>],
        latencies: &HashMap<String, f64>,
    ) -> Option<Arc<Instance>> {
        if candidates.is_empty() {
            return None;
        }
        let selected = match self {
            RoutingStrategy::Priority => select_priority(candidates),
            RoutingStrategy::Weighted => select_weighted(candidates),
            RoutingStrategy::LeastLatency => select_least_latency(candidates, latencies),
            RoutingStrategy::LeastBusy => select_least_busy(candidates),
            RoutingStrategy::Random => {
                candidates[rand::thread_rng().gen_range(0..candidates.len())].clone()
            }
        };
        Some(selected)
    }
}

fn select_priority(candidates: &[Arc<Instance>]) -> Arc<Instance> {
    let mut best = &candidates[0];
    for candidate in &candidates[1..] {
        if candidate.priority < best.priority {
            best = candidate;
        }
    }
    best.clone()
}

fn select_weighted(candidates: &[Arc<Instance>]) -> Arc<Instance> {
    let total: u64 = candidates.iter().map(|inst| inst.weight as u64).sum();
    if total == 0 {
        return candidates[0].clone();
    }
    let mut roll = rand::thread_rng().gen_range(0..total);
    for candidate in candidates {
        let weight = candidate.weight as u64;
        if roll < weight {
            return candidate.clone();
        }
        roll -= weight;
    }
    candidates[candidates.len() - 1].clone()
}

fn select_least_latency(
    candidates: &[Arc<Instance>],
    latencies: &HashMap<String, f64>,
) -> Arc<Instance> {
    let mut best = &candidates[0];
    let mut best_latency = latencies.get(&best.logical_model).copied();
    for candidate in &candidates[1..] {
        let latency = latencies.get(&candidate.logical_model).copied();
        let better = match (latency, best_latency) {
            // No samples yet sorts before any measurement.
            (None, Some(_)) => true,
            (Some(a), Some(b)) => a < b,
            _ => false,
        };
        if better {
            best = candidate;
            best_latency = latency;
        }
    }
    best.clone()
}

fn select_least_busy(candidates: &[Arc<Instance>]) -> Arc<Instance> {
    let mut best = &candidates[0];
    let mut best_active = best.active_requests();
    for candidate in &candidates[1..] {
        let active = candidate.active_requests();
        if active < best_active {
            best = candidate;
            best_active = active;
        }
    }
    best.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::instance::test_support::instance;

    #[test]
    fn strategy_names_round_trip_through_serde() {
        let parsed: RoutingStrategy = serde_yaml::from_str("least-latency").unwrap();
        assert_eq!(parsed, RoutingStrategy::LeastLatency);
        assert_eq!(parsed.to_string(), "least-latency");
        let parsed: RoutingStrategy = serde_yaml::from_str("priority").unwrap();
        assert_eq!(parsed, RoutingStrategy::Priority);
    }

    #[test]
    fn priority_prefers_lowest_and_keeps_insertion_order_on_ties() {
        let candidates = vec![
            instance("a", "gpt-4", 2, 1),
            instance("b", "gpt-4", 1, 1),
            instance("c", "gpt-4", 1, 1),
        ];
        let selected = RoutingStrategy::Priority
            .select(&candidates, &HashMap::new())
            .unwrap();
        assert_eq!(selected.id, "b");
    }

    #[test]
    fn least_latency_prefers_faster_model() {
        let candidates = vec![
            instance("openai-1", "gpt-4-openai", 1, 1),
            instance("azure-1", "gpt-4-azure", 1, 1),
        ];
        let mut latencies = HashMap::new();
        latencies.insert("gpt-4-openai".to_string(), 800.0);
        latencies.insert("gpt-4-azure".to_string(), 300.0);
        let selected = RoutingStrategy::LeastLatency
            .select(&candidates, &latencies)
            .unwrap();
        assert_eq!(selected.id, "azure-1");
    }

    #[test]
    fn least_latency_tries_unmeasured_instances_first() {
        let candidates = vec![
            instance("measured", "gpt-4-a", 1, 1),
            instance("fresh", "gpt-4-b", 1, 1),
        ];
        let mut latencies = HashMap::new();
        latencies.insert("gpt-4-a".to_string(), 50.0);
        let selected = RoutingStrategy::LeastLatency
            .select(&candidates, &latencies)
            .unwrap();
        assert_eq!(selected.id, "fresh");
    }

    #[test]
    fn least_busy_prefers_idle_instances() {
        let busy = instance("busy", "gpt-4", 1, 1);
        let idle = instance("idle", "gpt-4", 1, 1);
        let _guard = busy.begin_request();
        let selected = RoutingStrategy::LeastBusy
            .select(&[busy.clone(), idle.clone()], &HashMap::new())
            .unwrap();
        assert_eq!(selected.id, "idle");
    }

    #[test]
    fn weighted_respects_weights_statistically() {
        let candidates = vec![
            instance("heavy", "gpt-4", 1, 9),
            instance("light", "gpt-4", 1, 1),
        ];
        let mut heavy_hits = 0;
        for _ in 0..500 {
            let selected = RoutingStrategy::Weighted
                .select(&candidates, &HashMap::new())
                .unwrap();
            if selected.id == "heavy" {
                heavy_hits += 1;
            }
        }
        // Expectation is 450; anything above 300 is decisive.
        assert!(heavy_hits > 300, "heavy selected only {heavy_hits}/500");
    }

    #[test]
    fn empty_candidates_select_nothing() {
        assert!(RoutingStrategy::Random.select(&[], &HashMap::new()).is_none());
    }
}
