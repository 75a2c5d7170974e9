//! Token pricing.
//!
//! Prices are expressed in US dollars per million tokens. Lookups match the
//! longest configured prefix of the model name, so dated model snapshots
//! (`gpt-4o-mini-2024-07-18`) share the price of their family.

use crate::backend::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Rough characters-per-token ratio used when estimating prompt size.
const CHARS_PER_TOKEN: usize = 4;

/// Price of one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    /// Dollars per million prompt tokens.
    pub input_per_million: f64,
    /// Dollars per million completion tokens.
    pub output_per_million: f64,
}

impl ModelPrice {
    /// Creates a price entry.
    #[must_use]
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Dollar cost of the given usage.
    #[must_use]
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (f64::from(usage.input_tokens) * self.input_per_million
            + f64::from(usage.output_tokens) * self.output_per_million)
            / 1_000_000.0
    }
}

/// Price lookup by model name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingTable {
    prices: HashMap<String, ModelPrice>,
    fallback: ModelPrice,
}

impl PricingTable {
    /// Creates an empty table that prices everything at `fallback`.
    #[must_use]
    pub fn new(fallback: ModelPrice) -> Self {
        Self {
            prices: HashMap::new(),
            fallback,
        }
    }

    /// The built-in table of commonly routed models.
    #[must_use]
    pub fn standard() -> Self {
        Self::new(ModelPrice::new(2.50, 10.00))
            .with_price("gpt-4o-mini", ModelPrice::new(0.15, 0.60))
            .with_price("gpt-4o", ModelPrice::new(2.50, 10.00))
            .with_price("gpt-4.1-mini", ModelPrice::new(0.40, 1.60))
            .with_price("gpt-4.1", ModelPrice::new(2.00, 8.00))
            .with_price("claude-3-5-haiku", ModelPrice::new(0.80, 4.00))
            .with_price("claude-3-5-sonnet", ModelPrice::new(3.00, 15.00))
    }

    /// Adds or replaces the price for a model prefix.
    #[must_use]
    pub fn with_price(mut self, model_prefix: impl Into<String>, price: ModelPrice) -> Self {
        self.prices.insert(model_prefix.into(), price);
        self
    }

    /// Returns the price that applies to `model`.
    #[must_use]
    pub fn price(&self, model: &str) -> ModelPrice {
        self.prices
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map_or(self.fallback, |(_, price)| *price)
    }

    /// Dollar cost of a completed request.
    #[must_use]
    pub fn cost(&self, model: &str, usage: &TokenUsage) -> f64 {
        self.price(model).cost(usage)
    }

    /// Upper-bound estimate for a request that has not run yet.
    ///
    /// Assumes the completion uses its full `max_output_tokens` allowance.
    #[must_use]
    pub fn estimate(&self, model: &str, prompt: &str, max_output_tokens: u32) -> f64 {
        let input_tokens = prompt.len().div_ceil(CHARS_PER_TOKEN);
        let usage = TokenUsage {
            input_tokens: u32::try_from(input_tokens).unwrap_or(u32::MAX),
            output_tokens: max_output_tokens,
        };
        self.cost(model, &usage)
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::standard()
    }
}
