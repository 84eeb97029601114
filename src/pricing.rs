//! Cost lookup for a (model, token counts) pair.
//!
//! Pricing is an external concern; the gateway only needs a pure function
//! from usage to dollars. The bundled table covers the common models and
//! callers can plug their own implementation.

use std::collections::HashMap;

pub trait CostTable: Send + Sync {
    /// Cost in USD for one completed call.
    fn cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64;
}

/// Static per-token rates (USD), matched on the longest model prefix.
pub struct StaticCostTable {
    rates: Vec<(String, f64, f64)>,
    fallback: (f64, f64),
}

impl StaticCostTable {
    pub fn new(rates: HashMap<String, (f64, f64)>) -> Self {
        let mut rates: Vec<(String, f64, f64)> = rates
            .into_iter()
            .map(|(model, (input, output))| (model, input, output))
            .collect();
        // Longest prefix first so "gpt-4o-mini" beats "gpt-4".
        rates.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self {
            rates,
            fallback: (0.00003, 0.00006),
        }
    }

    fn lookup(&self, model: &str) -> (f64, f64) {
        self.rates
            .iter()
            .find(|(prefix, _, _)| model.starts_with(prefix.as_str()))
            .map(|(_, input, output)| (*input, *output))
            .unwrap_or(self.fallback)
    }
}

impl Default for StaticCostTable {
    fn default() -> Self {
        let mut rates = HashMap::new();
        rates.insert("gpt-4o-mini".to_string(), (0.00000015, 0.0000006));
        rates.insert("gpt-4o".to_string(), (0.0000025, 0.00001));
        rates.insert("gpt-4-turbo".to_string(), (0.00001, 0.00003));
        rates.insert("gpt-4".to_string(), (0.00003, 0.00006));
        rates.insert("gpt-3.5-turbo".to_string(), (0.0000005, 0.0000015));
        rates.insert("o1".to_string(), (0.000015, 0.00006));
        rates.insert("o3-mini".to_string(), (0.0000011, 0.0000044));
        rates.insert("claude-3-opus".to_string(), (0.000015, 0.000075));
        rates.insert("claude-3-5-sonnet".to_string(), (0.000003, 0.000015));
        rates.insert("claude-3-sonnet".to_string(), (0.000003, 0.000015));
        rates.insert("claude-3-haiku".to_string(), (0.00000025, 0.00000125));
        rates.insert("text-embedding-3-small".to_string(), (0.00000002, 0.0));
        rates.insert("text-embedding-3-large".to_string(), (0.00000013, 0.0));
        Self::new(rates)
    }
}

impl CostTable for StaticCostTable {
    fn cost(&self, model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
        let (input_rate, output_rate) = self.lookup(model);
        input_tokens as f64 * input_rate + output_tokens as f64 * output_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins() {
        let table = StaticCostTable::default();
        let mini = table.cost("gpt-4o-mini", 1_000_000, 0);
        let full = table.cost("gpt-4o", 1_000_000, 0);
        assert!(mini < full);
    }

    #[test]
    fn unknown_model_uses_fallback_rate() {
        let table = StaticCostTable::default();
        let cost = table.cost("mystery-model", 1000, 1000);
        assert!((cost - (1000.0 * 0.00003 + 1000.0 * 0.00006)).abs() < 1e-9);
    }
}
