//! Chart rewriting driven by the documentation gaps of an evaluation.
//!
//! The model is asked for an improved chart that marks its own additions with
//! `[AI ADDED: ...]` and leaves `[NEEDS PHYSICIAN INPUT: ...]` placeholders
//! for facts only the treating physician can supply. Gaps a related chart
//! already answers are left out of the request.

use super::crossref;
use crate::document::RelatedChart;
use crate::model::{AggregateResult, Decision, RequirementStatus, VerdictSource};
use crate::pricing::UsageRecord;
use crate::targets::TargetSet;
use serde::{Deserialize, Serialize};
use std::fmt::Write;

pub const AI_ADDED_MARKER: &str = "[AI ADDED:";
pub const PHYSICIAN_INPUT_MARKER: &str = "[NEEDS PHYSICIAN INPUT:";

/// Chart characters sent with an improvement request.
pub const MAX_CHART_CHARS: usize = 8_000;

/// Lines after a section header searched for the field a placeholder is about.
const SECTION_LOOKAHEAD: usize = 14;

pub const IMPROVEMENT_SYSTEM_PROMPT: &str = "\
You are a clinical documentation improvement specialist. You revise medical \
charts so they document what coverage reviewers require, without changing \
clinical facts.

Ground rules:
- Never fabricate symptoms, findings, results or history.
- Mark every piece of text you add or rewrite with [AI ADDED: description].
- Where only the treating physician can supply a fact, put a \
[NEEDS PHYSICIAN INPUT: description] placeholder in the chart text at the \
place it belongs.
- Never name an insurer or policy authority in the chart text.
- Answer with strict JSON only: no prose, no code fences.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnmetItem {
    pub id: String,
    pub missing: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// What one target asked for on one unit, minus what related charts cover.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecommendationDigest {
    pub target: String,
    pub unit: String,
    pub decision: Decision,
    pub gaps: Vec<String>,
    pub actions: Vec<String>,
    pub unmet: Vec<UnmetItem>,
    pub reasons: Vec<String>,
    pub priority: String,
}

impl RecommendationDigest {
    pub fn is_empty(&self) -> bool {
        self.gaps.is_empty() && self.actions.is_empty() && self.unmet.is_empty()
    }
}

/// Gathers recommendations in target priority order.
///
/// Error verdicts carry no model content and are skipped. Items already
/// suppressed by cross-referencing stay out, as do reasons a related chart
/// covers.
pub fn collect_recommendations(
    result: &AggregateResult,
    targets: &TargetSet,
    related: &[RelatedChart],
) -> Vec<RecommendationDigest> {
    let mut out = Vec::new();
    for id in targets.ids() {
        let Some(list) = result.verdicts.get(id) else {
            continue;
        };
        for v in list.iter().filter(|v| v.source != VerdictSource::Error) {
            let gaps = v
                .recommendations
                .documentation_gaps
                .iter()
                .filter(|g| g.suppressed_by.is_none())
                .map(|g| g.text.clone())
                .collect();
            let unmet = v
                .requirements
                .iter()
                .filter(|r| r.status != RequirementStatus::Met && r.suppressed_by.is_none())
                .filter_map(|r| {
                    let missing = r.missing.as_deref()?.trim();
                    (!missing.is_empty()).then(|| UnmetItem {
                        id: r.id.clone(),
                        missing: missing.to_string(),
                        suggestion: r.suggestion.clone(),
                    })
                })
                .collect();
            let reasons = v
                .reasons
                .iter()
                .filter(|r| crossref::covering_chart(r, related).is_none())
                .cloned()
                .collect();
            out.push(RecommendationDigest {
                target: targets.display_name(id).to_string(),
                unit: v.unit.clone(),
                decision: v.decision,
                gaps,
                actions: v.recommendations.actions.clone(),
                unmet,
                reasons,
                priority: v
                    .recommendations
                    .priority
                    .clone()
                    .unwrap_or_else(|| "medium".to_string()),
            });
        }
    }
    out
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn summarize(digests: &[RecommendationDigest]) -> String {
    if digests.is_empty() {
        return "No specific recommendations available.\n".to_string();
    }
    let mut s = String::new();
    for (i, d) in digests.iter().enumerate() {
        let _ = writeln!(s, "### Recommendation {}: {} - {}", i + 1, d.target, d.unit);
        let _ = writeln!(s, "Decision: {}", d.decision);
        if !d.gaps.is_empty() {
            s.push_str("Documentation gaps:\n");
            for g in &d.gaps {
                let _ = writeln!(s, "  - {}", g);
            }
        }
        if !d.actions.is_empty() {
            s.push_str("Required actions:\n");
            for a in &d.actions {
                let _ = writeln!(s, "  - {}", a);
            }
        }
        if !d.unmet.is_empty() {
            s.push_str("Unmet requirements:\n");
            for u in &d.unmet {
                let _ = writeln!(s, "  - {}: {}", u.id, u.missing);
                if let Some(sug) = u.suggestion.as_deref().filter(|x| !x.trim().is_empty()) {
                    let _ = writeln!(s, "    Suggestion: {}", sug);
                }
            }
        }
        let _ = writeln!(s, "Priority: {}\n---", d.priority.to_uppercase());
    }
    s
}

/// Request for an improved chart. Deterministic for identical inputs.
pub fn improvement_prompt(
    chart: &str,
    units: &[&str],
    digests: &[RecommendationDigest],
    related: &[RelatedChart],
) -> String {
    let mut p = String::new();
    p.push_str("# MEDICAL CHART IMPROVEMENT\n\n## ORIGINAL CHART\n");
    let _ = writeln!(p, "{}\n", truncate_chars(chart, MAX_CHART_CHARS));

    p.push_str("## PROCEDURES EVALUATED\n");
    if units.is_empty() {
        p.push_str("No procedures detected\n");
    }
    for (i, u) in units.iter().enumerate() {
        let _ = writeln!(p, "  {}. {}", i + 1, u);
    }

    p.push_str("\n## RECOMMENDATIONS\n");
    p.push_str(&summarize(digests));

    if !related.is_empty() {
        p.push_str(
            "\n## RELATED CHARTS (already documented for this patient)\n\
             Do not request anything below with a physician-input placeholder.\n",
        );
        for r in related {
            let _ = writeln!(p, "### {}\n{}\n", r.source, truncate_chars(r.text.trim(), 1_500));
        }
    }

    p.push_str(
        "\n## OUTPUT\n\
         Return STRICT JSON ONLY with this shape:\n\
         {\n\
         \x20 \"improved_chart\": \"STRING (full chart, no L### prefixes, markers inline)\",\n\
         \x20 \"improvements\": [{\"section\": \"STRING\", \"original\": \"STRING\", \"improved\": \"STRING\", \"reason\": \"STRING\", \"payers_affected\": [\"STRING\"]}],\n\
         \x20 \"user_input_required\": [{\"section\": \"STRING\", \"field\": \"STRING\", \"reason\": \"STRING\", \"suggestion\": \"STRING\", \"payers_requiring\": [\"STRING\"], \"priority\": \"high | medium | low\"}],\n\
         \x20 \"recommendations\": [{\"category\": \"STRING\", \"recommendation\": \"STRING\", \"payers\": [\"STRING\"], \"priority\": \"high | medium | low\"}],\n\
         \x20 \"compliance_impact\": {\"before\": \"STRING\", \"after\": \"STRING\", \"key_changes\": [\"STRING\"]}\n\
         }\n\n\
         Every entry in user_input_required must also appear as a [NEEDS PHYSICIAN INPUT: ...] \
         placeholder inside improved_chart. Ask for clinical facts, never for policy text. \
         Payer names may appear only in the metadata arrays.\n",
    );
    p
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartEdit {
    pub section: String,
    pub original: String,
    pub improved: String,
    pub reason: String,
    pub payers_affected: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputRequest {
    pub section: String,
    pub field: String,
    pub reason: String,
    pub suggestion: String,
    pub payers_requiring: Vec<String>,
    pub priority: String,
}

impl InputRequest {
    pub fn marker(&self) -> String {
        let what = if self.suggestion.trim().is_empty() {
            self.field.trim()
        } else {
            self.suggestion.trim()
        };
        format!("{} {}]", PHYSICIAN_INPUT_MARKER, what)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImprovementAdvice {
    pub category: String,
    pub recommendation: String,
    pub payers: Vec<String>,
    pub priority: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceImpact {
    pub before: String,
    pub after: String,
    pub key_changes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImprovementResponse {
    pub improved_chart: String,
    pub improvements: Vec<ChartEdit>,
    pub user_input_required: Vec<InputRequest>,
    pub recommendations: Vec<ImprovementAdvice>,
    pub compliance_impact: Option<ComplianceImpact>,
}

/// An improved chart and the edits behind it.
#[derive(Debug, Clone, Serialize)]
pub struct ChartImprovement {
    pub document: String,
    pub improved_chart: String,
    pub improvements: Vec<ChartEdit>,
    pub user_input_required: Vec<InputRequest>,
    pub recommendations: Vec<ImprovementAdvice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compliance_impact: Option<ComplianceImpact>,
    /// Placeholders inserted after the model answered.
    pub markers_added: usize,
    pub original_chart_chars: usize,
    pub improved_chart_chars: usize,
    pub usage: UsageRecord,
    pub cached: bool,
}

fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn long_words(s: &str) -> Vec<String> {
    s.to_lowercase()
        .split_whitespace()
        .filter(|w| w.len() > 4)
        .map(str::to_string)
        .collect()
}

fn find_section(lines: &[String], section: &str) -> Option<usize> {
    let want = section.trim().to_lowercase();
    if want.is_empty() {
        return None;
    }
    lines.iter().position(|line| {
        let l = line.trim().to_lowercase();
        l.contains(&want) && (l.starts_with(&want) || line.contains(':') || squash(&l) == squash(&want))
    })
}

/// Places a placeholder for every requested input the chart text lacks.
///
/// Nothing changes when the chart already holds at least as many
/// placeholders as there are requests. Otherwise each missing placeholder
/// goes after the line about its field under the matching section header, or
/// right after the header, or after a line sharing a word with the section
/// name, or at the end of the chart. Returns the chart and how many
/// placeholders were inserted.
pub fn ensure_physician_input_markers(chart: &str, inputs: &[InputRequest]) -> (String, usize) {
    let existing = chart.matches(PHYSICIAN_INPUT_MARKER).count();
    if inputs.is_empty() || chart.trim().is_empty() || existing >= inputs.len() {
        return (chart.to_string(), 0);
    }

    let mut lines: Vec<String> = chart.split('\n').map(str::to_string).collect();
    let mut added = 0;
    for input in inputs {
        let marker = input.marker();
        if lines.iter().any(|l| l.contains(&marker)) {
            continue;
        }

        if let Some(header) = find_section(&lines, &input.section) {
            let keywords: Vec<String> = long_words(&input.field).into_iter().take(2).collect();
            let end = (header + 1 + SECTION_LOOKAHEAD).min(lines.len());
            let related_line = (header + 1..end).find(|&j| {
                let l = lines[j].to_lowercase();
                keywords.iter().any(|k| l.contains(k.as_str()))
            });
            match related_line {
                Some(j) if lines[j].contains(':') => {
                    let line = lines[j].trim_end().to_string();
                    lines[j] = format!("{} {}", line, marker);
                }
                Some(j) => lines.insert(j + 1, marker),
                None => lines.insert(header + 1, marker),
            }
            added += 1;
            continue;
        }

        let section_words = long_words(&input.section);
        let similar = lines.iter().position(|l| {
            let l = l.to_lowercase();
            section_words.iter().any(|w| l.contains(w.as_str()))
        });
        match similar {
            Some(i) => lines.insert(i + 1, marker),
            None => lines.push(marker),
        }
        added += 1;
    }
    (lines.join("\n"), added)
}

/// Target display names that leaked into the chart text.
pub fn named_targets<'a>(chart: &str, targets: &'a TargetSet) -> Vec<&'a str> {
    let lower = chart.to_lowercase();
    targets
        .iter()
        .map(|(_, t)| t.name.as_str())
        .filter(|name| name.len() > 2 && lower.contains(&name.to_lowercase()))
        .collect()
}
