use super::GuidelineHit;
use crate::model::SourceRef;
use crate::targets::TargetId;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    /// Inline guideline citations such as `(Evidence: pg no: 2, L73)`.
    static ref INLINE_EVIDENCE: Regex =
        Regex::new(r"\(Evidence:\s*pg\s+no:\s*\d+,?\s*L\d+(?:-L\d+)?\)").unwrap();
}

const PREVIEW_CHARS: usize = 300;

/// Guideline context packed for one target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetContext {
    pub text: String,
    pub sources: Vec<SourceRef>,
    /// Any hit scored at or above the relevance threshold.
    pub has_relevant: bool,
    pub hits: usize,
    pub max_score: f64,
    /// Context came from exhaustive code lookup.
    pub code_based: bool,
}

impl TargetContext {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Packs `hits` into at most `max_chars` characters, one headed block per hit.
/// The first block is always kept even when it alone exceeds the budget.
pub fn build_context(
    target: &TargetId,
    unit_name: &str,
    hits: &[GuidelineHit],
    max_chars: usize,
    min_relevance: f64,
) -> TargetContext {
    let mut blocks: Vec<String> = Vec::new();
    let mut sources = Vec::new();
    let mut used = 0usize;
    let mut has_relevant = false;

    for (rank, hit) in hits.iter().enumerate().map(|(i, h)| (i + 1, h)) {
        let src = &hit.source;
        let procedure = src
            .get("procedure")
            .and_then(Value::as_str)
            .unwrap_or(unit_name);
        let header = format!(
            "[{} | {} | Chunk {} | score={:.3} | file={} | id={}{}]",
            target.as_str().to_uppercase(),
            procedure,
            rank,
            hit.score,
            hit.file,
            hit.record_id,
            evidence_reference(src.get("evidence")),
        );
        let block = format!("{}\n{}\n", header, chunk_body(src));

        if hit.score >= min_relevance {
            has_relevant = true;
        }
        if used + block.len() > max_chars && !blocks.is_empty() {
            break;
        }
        used += block.len();
        blocks.push(block);

        sources.push(SourceRef {
            target: target.to_string(),
            file: hit.file.clone(),
            record_id: hit.record_id.clone(),
            chunk: rank,
            score: hit.score,
            preview: preview(src),
            references: inline_references(src),
        });
    }

    TargetContext {
        text: blocks.join("\n\n"),
        sources,
        has_relevant,
        hits: hits.len(),
        max_score: hits.iter().map(|h| h.score).fold(0.0, f64::max),
        code_based: false,
    }
}

fn evidence_reference(evidence: Option<&Value>) -> String {
    match evidence {
        Some(Value::Object(e)) => {
            let file = ["pdf_file", "file", "source_file"]
                .iter()
                .find_map(|k| e.get(*k).and_then(Value::as_str));
            let page = ["page", "page_number", "page_num"]
                .iter()
                .find_map(|k| e.get(*k).filter(|v| !v.is_null()));
            match (file, page) {
                (Some(f), Some(p)) => format!(" | PDF: {} (Page {})", f, scalar(p)),
                (Some(f), None) => format!(" | PDF: {}", f),
                _ => String::new(),
            }
        }
        Some(Value::String(s)) if !s.is_empty() => {
            format!(" | Evidence: {}", s.chars().take(100).collect::<String>())
        }
        _ => String::new(),
    }
}

fn scalar(v: &Value) -> String {
    v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())
}

fn chunk_body(src: &Value) -> String {
    let s = |k: &str| src.get(k).and_then(Value::as_str).filter(|s| !s.is_empty());
    let mut parts: Vec<String> = Vec::new();

    if let Some(main) = s("text").or_else(|| s("content")).or_else(|| s("description")) {
        parts.push(main.to_string());
    }
    if let Some(c) = s("category") {
        parts.push(format!("Category: {}", c));
    }
    if let Some(t) = s("section_title") {
        parts.push(format!("Section: {}", t));
    }
    if let Some(names) = src.get("names").and_then(Value::as_array) {
        let names: Vec<String> = names.iter().map(scalar).collect();
        parts.push(format!("Names: {}", names.join(", ")));
    }
    if let Some(docs) = src
        .pointer("/general_requirements/documentation")
        .and_then(Value::as_array)
    {
        parts.push("Documentation Requirements:".to_string());
        parts.extend(docs.iter().map(|d| format!("  - {}", scalar(d))));
    }
    if let Some(codes) = src.get("codes").and_then(Value::as_array) {
        parts.push("Codes:".to_string());
        for code in codes.iter().filter(|c| c.is_object()) {
            parts.push(format!(
                "  {}: {}",
                code.get("code").map(scalar).unwrap_or_default(),
                code.get("description").map(scalar).unwrap_or_default()
            ));
        }
    }
    if let Some(notes) = src.get("notes").filter(|n| !n.is_null()) {
        parts.push(format!("Notes: {}", scalar(notes)));
    }

    let mut body = parts.join("\n");
    let excerpt = src.get("evidence").and_then(|e| {
        ["text", "evidence_text", "excerpt"]
            .iter()
            .find_map(|k| e.get(*k).and_then(Value::as_str))
    });
    if let Some(ex) = excerpt {
        body.push_str("\n\n[PDF Evidence]: ");
        body.push_str(ex);
    }
    body
}

fn preview(src: &Value) -> String {
    let text = ["text", "content", "description"]
        .iter()
        .find_map(|k| src.get(*k).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| src.to_string());
    text.chars().take(PREVIEW_CHARS).collect()
}

fn inline_references(src: &Value) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    walk_strings(src, &mut |s: &str| {
        for m in INLINE_EVIDENCE.find_iter(s) {
            if !out.iter().any(|r| r == m.as_str()) {
                out.push(m.as_str().to_string());
            }
        }
    });
    out
}

fn walk_strings(v: &Value, f: &mut dyn FnMut(&str)) {
    match v {
        Value::String(s) => f(s),
        Value::Array(items) => items.iter().for_each(|i| walk_strings(i, f)),
        Value::Object(map) => map.values().for_each(|i| walk_strings(i, f)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::{EvaluationTarget, TargetSet};
    use serde_json::json;

    fn uhc() -> TargetId {
        let set = TargetSet::new(vec![EvaluationTarget {
            id: "uhc".into(),
            name: "UnitedHealthcare".into(),
            priority: 1,
            filter_terms: vec![],
            guideline_path: None,
        }])
        .unwrap();
        let id = set.ids().next().unwrap().clone();
        id
    }

    fn hit(score: f64, source: Value) -> GuidelineHit {
        GuidelineHit {
            record_id: "uhc_0".into(),
            file: "knee.json".into(),
            score,
            source,
            matched_codes: vec![],
        }
    }

    #[test]
    fn header_carries_provenance() {
        let ctx = build_context(
            &uhc(),
            "Knee scope",
            &[hit(
                12.5,
                json!({
                    "text": "Six weeks of PT required (Evidence: pg no: 2, L73)",
                    "evidence": {"pdf_file": "uhc-knee.pdf", "page": 4, "excerpt": "PT >= 6 weeks"}
                }),
            )],
            10_000,
            10.0,
        );
        assert!(ctx.text.starts_with(
            "[UHC | Knee scope | Chunk 1 | score=12.500 | file=knee.json | id=uhc_0 | PDF: uhc-knee.pdf (Page 4)]"
        ));
        assert!(ctx.text.contains("[PDF Evidence]: PT >= 6 weeks"));
        assert!(ctx.has_relevant);
        assert_eq!(ctx.sources[0].references, vec!["(Evidence: pg no: 2, L73)"]);
    }

    #[test]
    fn budget_keeps_first_block_and_stops() {
        let long = "x".repeat(500);
        let hits = vec![hit(3.0, json!({"text": long})), hit(2.0, json!({"text": "short"}))];
        let ctx = build_context(&uhc(), "p", &hits, 100, 10.0);
        assert_eq!(ctx.sources.len(), 1);
        assert_eq!(ctx.hits, 2);
        assert_eq!(ctx.max_score, 3.0);
        assert!(!ctx.has_relevant);
    }

    #[test]
    fn no_hits_is_empty_context() {
        let ctx = build_context(&uhc(), "p", &[], 100, 10.0);
        assert!(ctx.is_empty());
        assert_eq!(ctx.max_score, 0.0);
    }
}
