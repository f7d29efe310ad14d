//! Guideline retrieval seam.
//!
//! The orchestrator only sees [`GuidelineRetriever`]. The bundled
//! [`JsonGuidelineIndex`] serves local JSON guideline files; other backends
//! implement the same trait.

pub mod context;
pub mod json_index;

pub use context::{build_context, TargetContext};
pub use json_index::{normalize_code, JsonGuidelineIndex};

use crate::targets::TargetId;
use async_trait::async_trait;

/// One ranked guideline fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct GuidelineHit {
    pub record_id: String,
    pub file: String,
    pub score: f64,
    pub source: serde_json::Value,
    pub matched_codes: Vec<String>,
}

#[async_trait]
pub trait GuidelineRetriever: Send + Sync {
    /// Every fragment mentioning any of `codes`, best first. Not truncated.
    async fn search_by_codes(
        &self,
        target: &TargetId,
        codes: &[String],
    ) -> anyhow::Result<Vec<GuidelineHit>>;

    /// At most `top_k` fragments relevant to free text, best first.
    async fn search_semantic(
        &self,
        target: &TargetId,
        query: &str,
        top_k: usize,
    ) -> anyhow::Result<Vec<GuidelineHit>>;
}
