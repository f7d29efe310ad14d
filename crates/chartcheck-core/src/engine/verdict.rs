//! Construction of [`TargetVerdict`]s: from model output, from the generic
//! template, and for failures.

use crate::document::chart_references;
use crate::errors::RecoveryFailure;
use crate::model::{
    CodingImplications, Decision, DocumentationGap, GuidelineAvailability, GuidelineStatus,
    Recommendations, Requirement, RequirementStatus, TargetVerdict, VerdictSource,
};
use crate::retrieval::TargetContext;
use crate::targets::TargetId;
use serde_json::Value;

fn strings(v: Option<&Value>) -> Vec<String> {
    match v {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| match i {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn text(v: Option<&Value>) -> Option<String> {
    match v {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn first<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k))
}

/// Evidence entries are either bare references or `{"line_reference": ..}`.
fn evidence_refs(v: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(items)) = v else {
        return strings(v);
    };
    items
        .iter()
        .filter_map(|e| match e {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Object(o) => o
                .get("line_reference")
                .or_else(|| o.get("line"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn requirement(v: &Value, idx: usize) -> Option<Requirement> {
    if !v.is_object() {
        return None;
    }
    Some(Requirement {
        id: text(first(v, &["requirement_id", "id", "name"]))
            .unwrap_or_else(|| format!("requirement_{}", idx + 1)),
        status: first(v, &["status"])
            .and_then(Value::as_str)
            .map(RequirementStatus::parse)
            .unwrap_or(RequirementStatus::Unclear),
        evidence: evidence_refs(v.get("evidence")),
        missing: text(first(v, &["missing_to_meet", "missing"])),
        suggestion: text(v.get("suggestion")),
        suppressed_by: None,
    })
}

pub fn availability(ctx: &TargetContext, display_name: &str) -> GuidelineAvailability {
    GuidelineAvailability {
        status: if ctx.has_relevant {
            GuidelineStatus::Available
        } else {
            GuidelineStatus::NotFound
        },
        search_hits: ctx.hits,
        max_score: ctx.max_score,
        message: format!("Found {} guideline(s) for {}", ctx.hits, display_name),
    }
}

/// Builds a verdict from one target's object in the model response.
pub fn from_model(
    target: &TargetId,
    display_name: &str,
    unit: &str,
    value: &Value,
    ctx: &TargetContext,
) -> Result<TargetVerdict, RecoveryFailure> {
    let decision_raw = value.get("decision").and_then(Value::as_str).ok_or_else(|| {
        RecoveryFailure::InvalidStructure(format!("'{}' has no decision", target))
    })?;
    let decision = Decision::parse(decision_raw).ok_or_else(|| {
        RecoveryFailure::InvalidStructure(format!(
            "'{}' has unrecognized decision '{}'",
            target, decision_raw
        ))
    })?;

    let requirements = match first(value, &["requirement_checklist", "requirements"]) {
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, r)| requirement(r, i))
            .collect(),
        _ => Vec::new(),
    };

    let coding_v = first(value, &["coding_implications", "coding"]);
    let coding = CodingImplications {
        eligible_codes: strings(
            coding_v.and_then(|c| first(c, &["eligible_codes_if_sufficient", "eligible_codes"])),
        ),
        notes: text(coding_v.and_then(|c| c.get("notes"))),
    };

    let rec_v = first(value, &["improvement_recommendations", "recommendations"]);
    let recommendations = Recommendations {
        documentation_gaps: strings(rec_v.and_then(|r| r.get("documentation_gaps")))
            .into_iter()
            .map(|text| DocumentationGap {
                text,
                suppressed_by: None,
            })
            .collect(),
        actions: strings(rec_v.and_then(|r| first(r, &["compliance_actions", "actions"]))),
        priority: text(rec_v.and_then(|r| r.get("priority"))),
    };

    Ok(TargetVerdict {
        target: target.clone(),
        unit: unit.to_string(),
        decision,
        source: VerdictSource::Model,
        policy_name: text(value.get("policy_name")),
        reasons: strings(first(value, &["primary_reasons", "reasons"])),
        requirements,
        coding,
        recommendations,
        error: None,
        guideline_availability: availability(ctx, display_name),
        sources: ctx.sources.clone(),
        chart_references: chart_references(value),
    })
}

/// Template used when no guideline context exists for a target.
pub fn general(target: &TargetId, display_name: &str, unit: &str, ctx: &TargetContext) -> TargetVerdict {
    general_with_status(target, display_name, unit, ctx, GuidelineStatus::GeneralFallback, None)
}

/// Template used when retrieval for a target failed outright.
pub fn general_after_retrieval_error(
    target: &TargetId,
    display_name: &str,
    unit: &str,
    error: &str,
) -> TargetVerdict {
    general_with_status(
        target,
        display_name,
        unit,
        &TargetContext::default(),
        GuidelineStatus::Error,
        Some(error),
    )
}

fn general_with_status(
    target: &TargetId,
    display_name: &str,
    unit: &str,
    ctx: &TargetContext,
    status: GuidelineStatus,
    retrieval_error: Option<&str>,
) -> TargetVerdict {
    let message = match retrieval_error {
        Some(e) => format!("Guideline retrieval failed for {}: {}", display_name, e),
        None => format!(
            "Using general medical necessity guidelines - no {}-specific policy found",
            display_name
        ),
    };
    TargetVerdict {
        target: target.clone(),
        unit: unit.to_string(),
        decision: Decision::Sufficient,
        source: VerdictSource::General,
        policy_name: Some(format!("{} - General Medical Necessity Guidelines", display_name)),
        reasons: vec![
            "Evaluated using general medical necessity guidelines".to_string(),
            format!("No {}-specific policy found for {}", display_name, unit),
        ],
        requirements: Vec::new(),
        coding: CodingImplications {
            eligible_codes: Vec::new(),
            notes: Some(format!(
                "Evaluated using general medical necessity guidelines - {}-specific policy not available",
                display_name
            )),
        },
        recommendations: Recommendations {
            documentation_gaps: vec![DocumentationGap {
                text: format!("No {}-specific guidelines available for {}", display_name, unit),
                suppressed_by: None,
            }],
            actions: vec![
                format!("Submit to {} using general medical necessity criteria", display_name),
                format!("Consider requesting specific {} policy for {}", display_name, unit),
            ],
            priority: Some("medium".to_string()),
        },
        error: None,
        guideline_availability: GuidelineAvailability {
            status,
            search_hits: ctx.hits,
            max_score: ctx.max_score,
            message,
        },
        sources: ctx.sources.clone(),
        chart_references: Vec::new(),
    }
}

/// Synthesized outcome for a failed (unit, target) pair.
pub fn error(
    target: &TargetId,
    display_name: &str,
    unit: &str,
    reason: &str,
    ctx: Option<&TargetContext>,
) -> TargetVerdict {
    let guideline_availability = match ctx {
        Some(c) => availability(c, display_name),
        None => GuidelineAvailability {
            status: GuidelineStatus::Error,
            search_hits: 0,
            max_score: 0.0,
            message: format!("No guidelines evaluated for {}", display_name),
        },
    };
    TargetVerdict {
        target: target.clone(),
        unit: unit.to_string(),
        decision: Decision::Insufficient,
        source: VerdictSource::Error,
        policy_name: Some(format!("{} - Error", display_name)),
        reasons: vec![format!("Error processing procedure: {}", reason)],
        requirements: Vec::new(),
        coding: CodingImplications {
            eligible_codes: Vec::new(),
            notes: Some(format!("{} - Processing error", display_name)),
        },
        recommendations: Recommendations {
            documentation_gaps: vec![DocumentationGap {
                text: "Processing error occurred".to_string(),
                suppressed_by: None,
            }],
            actions: vec!["Retry processing or review manually".to_string()],
            priority: Some("high".to_string()),
        },
        error: Some(reason.to_string()),
        guideline_availability,
        sources: ctx.map(|c| c.sources.clone()).unwrap_or_default(),
        chart_references: Vec::new(),
    }
}
