//! Thread-safe rollup of token usage across model calls.

use crate::pricing::{CostBreakdown, Pricing, TokenUsage, UsageRecord};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct Totals {
    calls: u64,
    tokens: TokenUsage,
    by_model: BTreeMap<String, ModelTotals>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelTotals {
    pub calls: u64,
    pub tokens: TokenUsage,
}

/// Immutable copy of the accumulator at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub calls: u64,
    pub tokens: TokenUsage,
    pub costs: CostBreakdown,
    pub by_model: BTreeMap<String, ModelTotals>,
}

/// Shared running totals. Clones share state.
///
/// Only token counts are summed; costs in a snapshot are re-derived from the
/// summed counts with the same [`Pricing`] the gateway uses.
#[derive(Debug, Clone)]
pub struct UsageAccumulator {
    pricing: Pricing,
    totals: Arc<Mutex<Totals>>,
}

impl UsageAccumulator {
    pub fn new(pricing: Pricing) -> Self {
        Self {
            pricing,
            totals: Arc::new(Mutex::new(Totals::default())),
        }
    }

    pub fn accumulate(&self, record: &UsageRecord) {
        let mut t = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        t.calls += 1;
        t.tokens.add(&record.tokens);
        let m = t.by_model.entry(record.model_id.clone()).or_default();
        m.calls += 1;
        m.tokens.add(&record.tokens);
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        let t = self.totals.lock().unwrap_or_else(|e| e.into_inner());
        UsageSnapshot {
            calls: t.calls,
            tokens: t.tokens,
            costs: self.pricing.price(&t.tokens),
            by_model: t.by_model.clone(),
        }
    }

    /// Usage added since `earlier` was taken from this accumulator.
    pub fn since(&self, earlier: &UsageSnapshot) -> UsageSnapshot {
        let now = self.snapshot();
        let tokens = token_delta(&now.tokens, &earlier.tokens);
        let by_model = now
            .by_model
            .into_iter()
            .filter_map(|(model, m)| {
                let (calls, tokens) = match earlier.by_model.get(&model) {
                    Some(e) => (m.calls.saturating_sub(e.calls), token_delta(&m.tokens, &e.tokens)),
                    None => (m.calls, m.tokens),
                };
                (calls > 0).then_some((model, ModelTotals { calls, tokens }))
            })
            .collect();
        UsageSnapshot {
            calls: now.calls.saturating_sub(earlier.calls),
            tokens,
            costs: self.pricing.price(&tokens),
            by_model,
        }
    }

    pub fn pricing(&self) -> &Pricing {
        &self.pricing
    }
}

fn token_delta(now: &TokenUsage, earlier: &TokenUsage) -> TokenUsage {
    TokenUsage {
        input_tokens: now.input_tokens.saturating_sub(earlier.input_tokens),
        output_tokens: now.output_tokens.saturating_sub(earlier.output_tokens),
        cache_write_tokens: now.cache_write_tokens.saturating_sub(earlier.cache_write_tokens),
        cache_read_tokens: now.cache_read_tokens.saturating_sub(earlier.cache_read_tokens),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(input: u64, output: u64, model: &str) -> UsageRecord {
        UsageRecord::priced(
            TokenUsage {
                input_tokens: input,
                output_tokens: output,
                ..Default::default()
            },
            model,
            &Pricing::default(),
        )
    }

    #[test]
    fn snapshot_is_a_copy() {
        let acc = UsageAccumulator::new(Pricing::default());
        acc.accumulate(&record(1000, 100, "primary"));
        let snap = acc.snapshot();
        acc.accumulate(&record(1000, 100, "fallback"));

        assert_eq!(snap.calls, 1);
        assert_eq!(acc.snapshot().calls, 2);
        assert_eq!(acc.snapshot().by_model.len(), 2);
    }

    #[test]
    fn since_reports_only_later_usage() {
        let acc = UsageAccumulator::new(Pricing::default());
        acc.accumulate(&record(1000, 100, "primary"));
        let mark = acc.snapshot();
        acc.accumulate(&record(500, 50, "fallback"));

        let delta = acc.since(&mark);
        assert_eq!(delta.calls, 1);
        assert_eq!(delta.tokens.input_tokens, 500);
        assert_eq!(delta.costs, Pricing::default().price(&delta.tokens));
        assert_eq!(delta.by_model.keys().collect::<Vec<_>>(), vec!["fallback"]);
    }

    #[test]
    fn concurrent_accumulation_is_lossless() {
        let acc = UsageAccumulator::new(Pricing::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let acc = acc.clone();
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        acc.accumulate(&record(10, 1, "m"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let snap = acc.snapshot();
        assert_eq!(snap.calls, 2000);
        assert_eq!(snap.tokens.input_tokens, 20_000);
        assert_eq!(snap.costs, Pricing::default().price(&snap.tokens));
    }
}
