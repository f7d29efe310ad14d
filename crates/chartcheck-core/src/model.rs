use crate::cache::CacheStats;
use crate::document::{Document, RelatedChart};
use crate::report::RunSummary;
use crate::targets::TargetId;
use crate::usage::UsageSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One item under review within a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationUnit {
    pub name: String,
    #[serde(default)]
    pub evidence: String,
    /// Structured codes explicitly linked to this unit.
    #[serde(default)]
    pub codes: Vec<String>,
}

impl EvaluationUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            evidence: String::new(),
            codes: Vec::new(),
        }
    }

    pub fn with_codes(mut self, codes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.codes = codes.into_iter().map(Into::into).collect();
        self
    }
}

/// Input to one evaluation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationJob {
    pub document: Document,
    /// When empty, units are extracted from the document by the model.
    #[serde(default)]
    pub units: Vec<EvaluationUnit>,
    #[serde(default)]
    pub related_charts: Vec<RelatedChart>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    Sufficient,
    Insufficient,
}

impl Decision {
    /// Accepts any casing and surrounding whitespace.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sufficient" => Some(Decision::Sufficient),
            "insufficient" => Some(Decision::Insufficient),
            _ => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Sufficient => f.write_str("Sufficient"),
            Decision::Insufficient => f.write_str("Insufficient"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementStatus {
    Met,
    Unmet,
    Unclear,
}

impl RequirementStatus {
    /// Unknown values are treated as `Unclear`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "met" => RequirementStatus::Met,
            "unmet" | "not_met" | "not met" => RequirementStatus::Unmet,
            _ => RequirementStatus::Unclear,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub status: RequirementStatus,
    /// Line references into the numbered document (`L012`, `L013-L015`).
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Set when a related chart already documents what this item flags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppressed_by: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodingImplications {
    #[serde(default)]
    pub eligible_codes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentationGap {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppressed_by: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recommendations {
    #[serde(default)]
    pub documentation_gaps: Vec<DocumentationGap>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

/// Where a verdict's content came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    /// Parsed from the model's answer against retrieved guidelines.
    Model,
    /// Generic template: no guideline context was found for this target.
    General,
    /// Synthesized after a failure; `error` carries the reason.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidelineStatus {
    Available,
    NotFound,
    GeneralFallback,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidelineAvailability {
    pub status: GuidelineStatus,
    pub search_hits: usize,
    pub max_score: f64,
    pub message: String,
}

/// Provenance of one guideline fragment that went into a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub target: String,
    pub file: String,
    pub record_id: String,
    pub chunk: usize,
    pub score: f64,
    pub preview: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
}

/// The outcome for one (unit, target) pair.
///
/// Built exactly once by the orchestrator; later stages only annotate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetVerdict {
    pub target: TargetId,
    pub unit: String,
    pub decision: Decision,
    pub source: VerdictSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_name: Option<String>,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub coding: CodingImplications,
    #[serde(default)]
    pub recommendations: Recommendations,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub guideline_availability: GuidelineAvailability,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    #[serde(default)]
    pub chart_references: Vec<String>,
}

impl TargetVerdict {
    pub fn is_error(&self) -> bool {
        self.source == VerdictSource::Error
    }
}

/// Per-unit evaluation progress. `Done` and `DoneWithError` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    RetrievingContext,
    AwaitingModel,
    Parsing,
    Done,
    DoneWithError,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitState::Done | UnitState::DoneWithError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::RetrievingContext => "retrieving_context",
            UnitState::AwaitingModel => "awaiting_model",
            UnitState::Parsing => "parsing",
            UnitState::Done => "done",
            UnitState::DoneWithError => "done_with_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub unit: String,
    pub state: UnitState,
    pub attempts: u32,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything one run produced.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateResult {
    pub document: String,
    pub verdicts: BTreeMap<TargetId, Vec<TargetVerdict>>,
    pub units: Vec<UnitOutcome>,
    pub usage: UsageSnapshot,
    pub cache: CacheStats,
    pub summary: RunSummary,
}

impl AggregateResult {
    pub fn has_errors(&self) -> bool {
        self.verdicts.values().flatten().any(TargetVerdict::is_error)
    }

    pub fn verdict(&self, target: &str, unit: &str) -> Option<&TargetVerdict> {
        self.verdicts
            .iter()
            .find(|(id, _)| id.as_str() == target)
            .and_then(|(_, vs)| vs.iter().find(|v| v.unit == unit))
    }
}

/// What happened to one document of a batch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DocumentOutcome {
    Completed(Box<AggregateResult>),
    /// The document could not be evaluated at all (unreadable job, failed
    /// unit extraction). Other documents are unaffected.
    Failed { document: String, error: String },
}

impl DocumentOutcome {
    pub fn document(&self) -> &str {
        match self {
            DocumentOutcome::Completed(r) => &r.document,
            DocumentOutcome::Failed { document, .. } => document,
        }
    }

    pub fn result(&self) -> Option<&AggregateResult> {
        match self {
            DocumentOutcome::Completed(r) => Some(r),
            DocumentOutcome::Failed { .. } => None,
        }
    }
}

/// Results of evaluating several documents with one orchestrator.
///
/// `usage` covers the whole batch; each completed document also carries its
/// own share.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub documents: Vec<DocumentOutcome>,
    pub usage: UsageSnapshot,
    pub cache: CacheStats,
    pub summary: RunSummary,
}

impl BatchResult {
    pub fn completed(&self) -> impl Iterator<Item = &AggregateResult> {
        self.documents.iter().filter_map(DocumentOutcome::result)
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &str)> {
        self.documents.iter().filter_map(|d| match d {
            DocumentOutcome::Failed { document, error } => Some((document.as_str(), error.as_str())),
            DocumentOutcome::Completed(_) => None,
        })
    }

    /// A failed document or any error verdict.
    pub fn has_errors(&self) -> bool {
        self.failed().next().is_some() || self.completed().any(AggregateResult::has_errors)
    }

    pub fn record_failure(&mut self, document: impl Into<String>, error: impl Into<String>) {
        self.documents.push(DocumentOutcome::Failed {
            document: document.into(),
            error: error.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_parse_is_lenient_on_case() {
        assert_eq!(Decision::parse(" SUFFICIENT "), Some(Decision::Sufficient));
        assert_eq!(Decision::parse("insufficient"), Some(Decision::Insufficient));
        assert_eq!(Decision::parse("maybe"), None);
    }

    #[test]
    fn unknown_requirement_status_is_unclear() {
        assert_eq!(RequirementStatus::parse("Met"), RequirementStatus::Met);
        assert_eq!(RequirementStatus::parse("partially"), RequirementStatus::Unclear);
    }

    #[test]
    fn unit_deserializes_without_codes() {
        let u: EvaluationUnit = serde_json::from_str(r#"{"name":"Knee arthroscopy"}"#).unwrap();
        assert!(u.codes.is_empty());
        assert!(u.evidence.is_empty());
    }
}
