//! Per-model pricing and the cost arithmetic behind trace aggregation.

use serde::{Deserialize, Serialize};

use crate::trace::CostInfo;

const TOKENS_PER_UNIT: f64 = 1_000_000.0;

/// USD rates per million tokens for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRates {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    /// Rate applied to prompt tokens served from cache.
    #[serde(default)]
    pub cached_input_per_mtok: f64,
}

impl ModelRates {
    /// Price a call. `input_tokens` counts uncached prompt tokens;
    /// `cached_tokens` are billed at the cached rate.
    pub fn cost(&self, input_tokens: u32, output_tokens: u32, cached_tokens: u32) -> CostInfo {
        let input_cost = f64::from(input_tokens) * self.input_per_mtok / TOKENS_PER_UNIT;
        let output_cost = f64::from(output_tokens) * self.output_per_mtok / TOKENS_PER_UNIT;
        let cached_cost = f64::from(cached_tokens) * self.cached_input_per_mtok / TOKENS_PER_UNIT;
        CostInfo {
            input_tokens,
            output_tokens,
            cached_tokens,
            input_cost,
            output_cost,
            cached_cost,
            total_cost: input_cost + output_cost + cached_cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_is_linear_in_tokens() {
        let rates = ModelRates {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
            cached_input_per_mtok: 0.3,
        };

        let cost = rates.cost(1_000_000, 2_000_000, 500_000);
        assert!((cost.input_cost - 3.0).abs() < 1e-9);
        assert!((cost.output_cost - 30.0).abs() < 1e-9);
        assert!((cost.cached_cost - 0.15).abs() < 1e-9);
        assert!((cost.total_cost - 33.15).abs() < 1e-9);
    }

    #[test]
    fn zero_rates_price_to_zero() {
        let cost = ModelRates::default().cost(100, 100, 100);
        assert_eq!(cost.total_cost, 0.0);
        assert_eq!(cost.input_tokens, 100);
    }
}
