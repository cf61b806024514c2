//! Model price table.
//!
//! Costs are `tokens × per-token USD price`. Registry models are priced in
//! the global table keyed `provider/model` (with a bare `model` fallback);
//! custom providers declare their pricing in their provider config.

use std::collections::HashMap;

use crate::config::{GatewayConfig, ModelPricing};
use crate::types::Usage;

/// Immutable price lookup, built per config snapshot.
#[derive(Debug, Default)]
pub struct PriceTable {
    global: HashMap<String, ModelPricing>,
    per_provider: HashMap<String, HashMap<String, ModelPricing>>,
}

impl PriceTable {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let per_provider = config
            .providers
            .iter()
            .filter(|p| !p.pricing.is_empty())
            .map(|p| (p.name.clone(), p.pricing.clone()))
            .collect();
        Self {
            global: config.pricing.clone(),
            per_provider,
        }
    }

    fn lookup(&self, provider: &str, model: &str) -> Option<ModelPricing> {
        if let Some(models) = self.per_provider.get(provider) {
            if let Some(pricing) = models.get(model) {
                return Some(*pricing);
            }
        }
        self.global
            .get(&format!("{}/{}", provider, model))
            .or_else(|| self.global.get(model))
            .copied()
    }

    /// USD cost of a completed request. Unknown models cost zero (and are
    /// logged once per request at commit).
    pub fn cost(&self, provider: &str, model: &str, usage: &Usage) -> f64 {
        match self.lookup(provider, model) {
            Some(pricing) => {
                usage.prompt_tokens as f64 * pricing.input_cost_per_token
                    + usage.completion_tokens as f64 * pricing.output_cost_per_token
            }
            None => {
                tracing::debug!(
                    target: "bifrost::governance",
                    "no pricing for {}/{}, charging 0",
                    provider,
                    model
                );
                0.0
            }
        }
    }
}
