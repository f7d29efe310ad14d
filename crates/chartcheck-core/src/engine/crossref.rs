//! Suppression of flags already answered by another chart of the same patient.

use crate::document::RelatedChart;
use crate::model::{RequirementStatus, TargetVerdict};
use lazy_static::lazy_static;
use regex::Regex;

struct GapCategory {
    name: &'static str,
    /// Does the flagged text talk about this category?
    flag: Regex,
    /// Does a related chart document it?
    evidence: Regex,
}

fn category(name: &'static str, flag: &str, evidence: &str) -> GapCategory {
    GapCategory {
        name,
        flag: Regex::new(&format!(r"(?i)\b(?:{})\b", flag)).unwrap(),
        evidence: Regex::new(&format!(r"(?i)\b(?:{})\b", evidence)).unwrap(),
    }
}

lazy_static! {
    static ref CATEGORIES: Vec<GapCategory> = vec![
        category(
            "conservative_treatment",
            r"conservative|treatment|therapy|(?-i:PT)|physical therapy|medications?|injections?",
            // "Pt" is the usual shorthand for patient; only uppercase PT means therapy.
            r"physical therapy|(?-i:PT)|nsaids?|medications?|injections?|conservative (?:care|management|treatment)|home exercise",
        ),
        category(
            "duration",
            r"duration|weeks?|months?|timeframe|period",
            r"\d+\s*(?:weeks?|months?)|duration|timeframe",
        ),
        category(
            "physical_exam",
            r"physical exam(?:ination)?|exam(?:ination)?|range of motion|rom|strength|tests?|impingement",
            r"exam(?:ination)?|rom|range of motion|strength|impingement|neer|hawkins",
        ),
        category(
            "functional_limitation",
            r"functional|limitations?|adls?|activities of daily living",
            r"functional|limitations?|adls?|activit(?:y|ies)|daily living",
        ),
        category(
            "pain_assessment",
            r"pain|scale|vas|nrs|score",
            r"pain|vas|nrs|\d+\s*/\s*10",
        ),
        category(
            "imaging",
            r"imaging|mri|x-?ray|ct|radiology|radiograph",
            r"mri|x-?rays?|ct|imaging|radiographs?|ultrasound",
        ),
    ];
}

/// First related chart documenting a category the flag text is about.
pub fn covering_chart<'a>(
    flag_text: &str,
    related: &'a [RelatedChart],
) -> Option<(&'a RelatedChart, &'static str)> {
    if flag_text.trim().is_empty() {
        return None;
    }
    for cat in CATEGORIES.iter().filter(|c| c.flag.is_match(flag_text)) {
        if let Some(chart) = related.iter().find(|r| cat.evidence.is_match(&r.text)) {
            return Some((chart, cat.name));
        }
    }
    None
}

fn label(chart: &RelatedChart, category: &str) -> String {
    format!("{} ({})", chart.source, category)
}

/// Marks unmet or unclear requirements and documentation gaps that a related
/// chart already covers. Returns how many items were annotated.
pub fn annotate(verdict: &mut TargetVerdict, related: &[RelatedChart]) -> usize {
    if related.is_empty() {
        return 0;
    }
    let mut annotated = 0;
    for req in verdict
        .requirements
        .iter_mut()
        .filter(|r| r.status != RequirementStatus::Met && r.suppressed_by.is_none())
    {
        let flag = req.missing.as_deref().unwrap_or(&req.id).to_string();
        if let Some((chart, cat)) = covering_chart(&flag, related) {
            req.suppressed_by = Some(label(chart, cat));
            annotated += 1;
        }
    }
    for gap in verdict
        .recommendations
        .documentation_gaps
        .iter_mut()
        .filter(|g| g.suppressed_by.is_none())
    {
        if let Some((chart, cat)) = covering_chart(&gap.text, related) {
            gap.suppressed_by = Some(label(chart, cat));
            annotated += 1;
        }
    }
    if annotated > 0 {
        tracing::debug!(
            event = "cross_reference",
            target = %verdict.target,
            unit = %verdict.unit,
            annotated,
        );
    }
    annotated
}
