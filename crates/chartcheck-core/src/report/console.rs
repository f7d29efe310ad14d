use crate::cache::CacheStats;
use crate::engine::ChartImprovement;
use crate::model::{AggregateResult, BatchResult, DocumentOutcome, UnitState};
use crate::report::RunSummary;
use crate::usage::UsageSnapshot;
use anyhow::Context;
use serde::Serialize;
use std::path::Path;

pub fn print_summary(result: &AggregateResult) {
    for u in &result.units {
        if u.state == UnitState::DoneWithError {
            eprintln!(
                "ERROR [{}]: {}",
                u.unit,
                u.error.as_deref().unwrap_or("unknown failure")
            );
        }
    }

    print_totals(&result.summary, &result.usage);
    print_cache_stats(&result.cache);
}

/// One line per document, then the batch totals.
pub fn print_batch_summary(batch: &BatchResult) {
    for doc in &batch.documents {
        match doc {
            DocumentOutcome::Completed(r) => {
                let failed = r
                    .units
                    .iter()
                    .filter(|u| u.state == UnitState::DoneWithError)
                    .count();
                eprintln!(
                    "{}: units={} failed_units={} calls={}",
                    r.document,
                    r.units.len(),
                    failed,
                    r.usage.calls
                );
            }
            DocumentOutcome::Failed { document, error } => {
                eprintln!("FAILED [{}]: {}", document, error);
            }
        }
    }
    print_totals(&batch.summary, &batch.usage);
    print_cache_stats(&batch.cache);
}

fn print_totals(summary: &RunSummary, usage: &UsageSnapshot) {
    for (target, c) in &summary.by_target {
        eprintln!(
            "{}: total={} sufficient={} ({:.2}%) insufficient={} ({:.2}%) other={} general={}",
            target,
            c.total,
            c.sufficient,
            c.sufficient_pct,
            c.insufficient,
            c.insufficient_pct,
            c.other,
            c.general
        );
    }

    let o = &summary.overall;
    eprintln!(
        "Results: total={} sufficient={} insufficient={} other={}",
        o.total, o.sufficient, o.insufficient, o.other
    );
    eprintln!(
        "Usage: calls={} input_tokens={} output_tokens={} cost=${:.4}",
        usage.calls,
        usage.tokens.input_tokens,
        usage.tokens.output_tokens,
        usage.costs.total_cost
    );
}

pub fn print_improvement(imp: &ChartImprovement) {
    eprintln!(
        "Improved [{}]: edits={} physician_inputs={} markers_added={} chars={}->{} cached={}",
        imp.document,
        imp.improvements.len(),
        imp.user_input_required.len(),
        imp.markers_added,
        imp.original_chart_chars,
        imp.improved_chart_chars,
        imp.cached
    );
    for input in &imp.user_input_required {
        eprintln!("  needs input [{}]: {}", input.section, input.field);
    }
}

pub fn print_cache_stats(stats: &CacheStats) {
    for (kind, hm) in &stats.by_kind {
        eprintln!(
            "Cache[{}]: hits={} misses={} hit_rate={:.1}%",
            kind,
            hm.hits,
            hm.misses,
            hm.hit_rate() * 100.0
        );
    }
    let pc = &stats.prompt_cache;
    eprintln!(
        "Cache: evictions={} savings=${:.4} prompt_cache_reads={} prompt_cache_savings=${:.4}",
        stats.evictions, stats.savings_usd, pc.reads, pc.savings_usd
    );
}

pub fn write_json<T: Serialize>(path: &Path, result: &T) -> anyhow::Result<()> {
    let body = serde_json::to_string_pretty(result).context("failed to serialize result")?;
    std::fs::write(path, body).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
