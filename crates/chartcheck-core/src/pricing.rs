use serde::{Deserialize, Serialize};

/// Cache writes are billed 25% above plain input.
pub const CACHE_WRITE_MULTIPLIER: f64 = 1.25;
/// Cache reads are billed at 10% of plain input.
pub const CACHE_READ_MULTIPLIER: f64 = 0.10;

/// Per-1K-token base rates. Cache-write and cache-read rates are derived from
/// `input_per_1k`, never configured separately.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_per_1k: 0.003,
            output_per_1k: 0.015,
        }
    }
}

/// Raw token counts reported by one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
    }

    pub fn is_zero(&self) -> bool {
        *self == TokenUsage::default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_write_cost: f64,
    pub cache_read_cost: f64,
    pub total_cost: f64,
}

impl Pricing {
    pub fn cache_write_per_1k(&self) -> f64 {
        self.input_per_1k * CACHE_WRITE_MULTIPLIER
    }

    pub fn cache_read_per_1k(&self) -> f64 {
        self.input_per_1k * CACHE_READ_MULTIPLIER
    }

    /// The single pricing function. Every cost figure in the crate comes from here.
    pub fn price(&self, tokens: &TokenUsage) -> CostBreakdown {
        let input_cost = tokens.input_tokens as f64 / 1000.0 * self.input_per_1k;
        let output_cost = tokens.output_tokens as f64 / 1000.0 * self.output_per_1k;
        let cache_write_cost = tokens.cache_write_tokens as f64 / 1000.0 * self.cache_write_per_1k();
        let cache_read_cost = tokens.cache_read_tokens as f64 / 1000.0 * self.cache_read_per_1k();
        CostBreakdown {
            input_cost,
            output_cost,
            cache_write_cost,
            cache_read_cost,
            total_cost: input_cost + output_cost + cache_write_cost + cache_read_cost,
        }
    }

    /// What the server-side prompt cache saved compared to paying full input
    /// price for the tokens it served.
    pub fn prompt_cache_savings(&self, tokens: &TokenUsage) -> f64 {
        tokens.cache_read_tokens as f64 / 1000.0 * (self.input_per_1k - self.cache_read_per_1k())
    }
}

/// Usage of one call: token counts, the model that actually served it, and
/// costs derived from the counts.
///
/// Costs are private to construction: the only way to obtain a record is
/// [`UsageRecord::priced`], so costs cannot drift from the counts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageRecord {
    pub tokens: TokenUsage,
    pub model_id: String,
    costs: CostBreakdown,
}

impl UsageRecord {
    pub fn priced(tokens: TokenUsage, model_id: impl Into<String>, pricing: &Pricing) -> Self {
        Self {
            costs: pricing.price(&tokens),
            tokens,
            model_id: model_id.into(),
        }
    }

    pub fn zeroed(model_id: impl Into<String>) -> Self {
        Self::priced(TokenUsage::default(), model_id, &Pricing::default())
    }

    pub fn costs(&self) -> &CostBreakdown {
        &self.costs
    }

    pub fn total_cost(&self) -> f64 {
        self.costs.total_cost
    }

    pub fn cache_hit(&self) -> bool {
        self.tokens.cache_read_tokens > 0
    }

    pub fn cache_created(&self) -> bool {
        self.tokens.cache_write_tokens > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_formula() {
        let p = Pricing::default();
        let c = p.price(&TokenUsage {
            input_tokens: 1000,
            output_tokens: 1000,
            cache_write_tokens: 1000,
            cache_read_tokens: 1000,
        });
        assert!((c.input_cost - 0.003).abs() < 1e-12);
        assert!((c.output_cost - 0.015).abs() < 1e-12);
        assert!((c.cache_write_cost - 0.00375).abs() < 1e-12);
        assert!((c.cache_read_cost - 0.0003).abs() < 1e-12);
    }

    #[test]
    fn total_is_sum_of_components_across_inputs() {
        let p = Pricing {
            input_per_1k: 0.0008,
            output_per_1k: 0.004,
        };
        let samples = [0u64, 1, 7, 999, 1000, 1001, 123_456, 9_999_999];
        for &a in &samples {
            for &b in &samples {
                let c = p.price(&TokenUsage {
                    input_tokens: a,
                    output_tokens: b,
                    cache_write_tokens: b / 3,
                    cache_read_tokens: a / 2,
                });
                assert_eq!(
                    c.total_cost,
                    c.input_cost + c.output_cost + c.cache_write_cost + c.cache_read_cost
                );
            }
        }
    }

    #[test]
    fn savings_are_ninety_percent_of_input_rate() {
        let p = Pricing::default();
        let s = p.prompt_cache_savings(&TokenUsage {
            cache_read_tokens: 2000,
            ..Default::default()
        });
        assert!((s - 0.0054).abs() < 1e-12);
    }
}
