//! Parsing of the model-driven unit extraction and code-to-unit linkage.

use crate::errors::RecoveryFailure;
use crate::model::EvaluationUnit;
use serde::Serialize;
use serde_json::Value;

/// How codes were attached to extracted units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeLinkage {
    /// The response tied codes to procedures itself.
    Explicit,
    /// Parallel lists of equal length, linked index by index.
    Positional,
    /// One unit, so every code belongs to it.
    SingleUnit,
    /// Counts differ; no code is linked and units use semantic retrieval.
    Unlinked,
    NoCodes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedChart {
    pub patient_name: Option<String>,
    pub patient_age: Option<String>,
    pub specialty: Option<String>,
    pub summary: Option<String>,
    pub units: Vec<EvaluationUnit>,
    pub linkage: CodeLinkage,
}

fn opt_str(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| v.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("unknown"))
        .map(str::to_string)
}

fn code_list(v: Option<&Value>) -> Vec<String> {
    match v {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|c| match c {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect(),
        Some(Value::String(s)) => s
            .split(',')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// One entry of the `procedures` list: a bare name or `{name, codes, evidence}`.
struct ProcedureEntry {
    unit: EvaluationUnit,
    explicit_codes: bool,
}

fn procedure_entry(v: &Value) -> Option<ProcedureEntry> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(ProcedureEntry {
            unit: EvaluationUnit::new(s.trim()),
            explicit_codes: false,
        }),
        Value::Object(_) => {
            let name = opt_str(v, &["name", "procedure"])?;
            let explicit_codes = v.get("codes").is_some() || v.get("cpt").is_some();
            let mut unit = EvaluationUnit::new(name);
            unit.codes = code_list(v.get("codes").or_else(|| v.get("cpt")));
            unit.evidence = opt_str(v, &["evidence"]).unwrap_or_default();
            Some(ProcedureEntry {
                unit,
                explicit_codes,
            })
        }
        _ => None,
    }
}

/// Attaches a flat code list to units that carry no explicit linkage.
///
/// Codes are linked by position only when the counts match exactly. A single
/// unit receives every code. Any other mismatch links nothing.
pub fn link_codes(units: &mut [EvaluationUnit], codes: &[String]) -> CodeLinkage {
    if codes.is_empty() {
        return CodeLinkage::NoCodes;
    }
    match units.len() {
        0 => CodeLinkage::NoCodes,
        1 => {
            units[0].codes = codes.to_vec();
            CodeLinkage::SingleUnit
        }
        n if n == codes.len() => {
            for (unit, code) in units.iter_mut().zip(codes) {
                unit.codes = vec![code.clone()];
            }
            CodeLinkage::Positional
        }
        n => {
            tracing::warn!(
                event = "code_linkage_ambiguous",
                units = n,
                codes = codes.len(),
                "cannot link codes to units; falling back to semantic retrieval"
            );
            CodeLinkage::Unlinked
        }
    }
}

pub fn parse_extraction(value: &Value) -> Result<ExtractedChart, RecoveryFailure> {
    if !value.is_object() {
        return Err(RecoveryFailure::InvalidStructure(
            "extraction response is not an object".into(),
        ));
    }
    let list = ["procedures", "procedure"]
        .iter()
        .find_map(|k| value.get(*k))
        .ok_or_else(|| RecoveryFailure::TargetMissing("procedures".into()))?;
    let entries: Vec<ProcedureEntry> = match list {
        Value::Array(items) => items.iter().filter_map(procedure_entry).collect(),
        single => procedure_entry(single).into_iter().collect(),
    };

    let explicit = entries.iter().any(|e| e.explicit_codes);
    let mut units: Vec<EvaluationUnit> = entries.into_iter().map(|e| e.unit).collect();
    let linkage = if explicit {
        CodeLinkage::Explicit
    } else {
        let flat = code_list(value.get("cpt").or_else(|| value.get("codes")));
        link_codes(&mut units, &flat)
    };

    Ok(ExtractedChart {
        patient_name: opt_str(value, &["patient_name"]),
        patient_age: opt_str(value, &["patient_age"]),
        specialty: opt_str(value, &["chart_specialty", "specialty"]),
        summary: opt_str(value, &["summary"]),
        units,
        linkage,
    })
}
