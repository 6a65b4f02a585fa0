//! Static model pricing table.
//!
//! Maps a model identifier to the provider's cost per 1K tokens and the
//! markup applied on top. Pure functions, no state; unknown models fall
//! back to a conservative default so a new model never bills at zero.

use serde::Serialize;

/// Markup multiplier applied to provider cost for all models.
const DEFAULT_MARKUP: f64 = 1.2;

/// Conservative per-1K-token cost estimate used by the admission-control
/// limiter when it cannot know the blended input/output split up front.
pub const DEFAULT_COST_ESTIMATE_PER_1K: f64 = 0.06;

/// Pricing for a single model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ModelPricing {
    /// Provider cost per 1K tokens (USD, blended input/output).
    pub provider_cost_per_1k: f64,
    /// Markup multiplier applied to the provider cost.
    pub markup: f64,
}

impl ModelPricing {
    /// Cost per 1K tokens as billed to the user.
    pub fn billed_cost_per_1k(&self) -> f64 {
        self.provider_cost_per_1k * self.markup
    }

    /// Billed cost for a token count.
    pub fn cost_for_tokens(&self, tokens: i64) -> f64 {
        (tokens.max(0) as f64 / 1000.0) * self.billed_cost_per_1k()
    }
}

/// Look up pricing for a model identifier.
pub fn pricing_for_model(model: &str) -> ModelPricing {
    let provider_cost_per_1k = match model {
        "gpt-4" => 0.045,
        "gpt-4-turbo" => 0.02,
        "gpt-4o" => 0.0075,
        "gpt-4o-mini" => 0.000375,
        "gpt-3.5-turbo" => 0.001,
        "claude-3-opus" => 0.045,
        "claude-3-sonnet" => 0.009,
        "claude-3-haiku" => 0.00075,
        // Unknown models bill at the conservative estimate rather than zero.
        _ => DEFAULT_COST_ESTIMATE_PER_1K,
    };

    ModelPricing {
        provider_cost_per_1k,
        markup: DEFAULT_MARKUP,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_model_pricing() {
        let pricing = pricing_for_model("gpt-4");
        assert_eq!(pricing.provider_cost_per_1k, 0.045);
        assert!((pricing.billed_cost_per_1k() - 0.054).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_model_uses_default_estimate() {
        let pricing = pricing_for_model("some-future-model");
        assert_eq!(pricing.provider_cost_per_1k, DEFAULT_COST_ESTIMATE_PER_1K);
    }

    #[test]
    fn test_cost_for_tokens() {
        let pricing = ModelPricing {
            provider_cost_per_1k: 0.05,
            markup: 1.0,
        };
        assert!((pricing.cost_for_tokens(2000) - 0.10).abs() < 1e-12);
        assert_eq!(pricing.cost_for_tokens(0), 0.0);
        // Negative counts are clamped, not billed as credit.
        assert_eq!(pricing.cost_for_tokens(-500), 0.0);
    }
}
