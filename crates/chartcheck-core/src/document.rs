//! Chart text helpers: numbered rendering, windows, truncation and line
//! reference extraction.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref LINE_REF: Regex = Regex::new(r"L\d{3,}(?:-L\d{3,})?").unwrap();
    static ref LINE_PREFIX: Regex = Regex::new(r"(?m)^L\d{3,}:\s?").unwrap();
}

/// Headings that usually open the procedure section of an operative note.
const PROCEDURE_HEADINGS: &[&str] = &[
    "PROCEDURE",
    "OPERATIVE PROCEDURE",
    "PROCEDURES PERFORMED",
    "SURGICAL PROCEDURE",
    "OPERATION",
];

/// A chart under review. Lines are addressable as `L001`, `L002`, ...
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub name: String,
    pub text: String,
}

/// Another chart for the same patient, consulted for cross-references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedChart {
    pub source: String,
    pub text: String,
}

impl Document {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.split('\n')
    }

    pub fn line_count(&self) -> usize {
        self.lines().count()
    }

    /// Every line prefixed with its reference, e.g. `L007: Plan: MRI`.
    pub fn numbered(&self) -> String {
        self.lines()
            .enumerate()
            .map(|(i, line)| format!("L{:03}: {}", i + 1, line))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Up to `max_chars` bytes of text centred on the first case-insensitive
    /// mention of `needle`, or the head of the document when there is none.
    pub fn window_around(&self, needle: &str, max_chars: usize) -> &str {
        let text = self.text.as_str();
        if text.len() <= max_chars {
            return text;
        }
        let hay = text.to_ascii_lowercase();
        let needle = needle.trim().to_ascii_lowercase();
        let Some(pos) = (!needle.is_empty()).then(|| hay.find(&needle)).flatten() else {
            return &text[..floor_boundary(text, max_chars)];
        };
        let half = max_chars.saturating_sub(needle.len()) / 2;
        let start = floor_boundary(text, pos.saturating_sub(half));
        let end = floor_boundary(text, (start + max_chars).min(text.len()));
        &text[start..end]
    }
}

fn floor_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Removes `L001:` prefixes added by [`Document::numbered`].
pub fn strip_line_numbers(text: &str) -> String {
    LINE_PREFIX.replace_all(text, "").into_owned()
}

/// Word-bounded truncation that keeps the procedure section.
///
/// When a procedure heading is found, up to `context_words` words before it
/// are kept, followed by as much of the section as fits in `max_words`.
/// Otherwise the first `max_words` words are returned. Whitespace is
/// normalized to single spaces whenever truncation happens.
pub fn smart_truncate_by_words(text: &str, max_words: usize, context_words: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max_words {
        return text.to_string();
    }

    let upper = text.to_ascii_uppercase();
    let heading = PROCEDURE_HEADINGS
        .iter()
        .filter_map(|h| upper.find(h))
        .min();

    if let Some(idx) = heading {
        let before = text[..idx].split_whitespace().count();
        let available = max_words.saturating_sub(context_words.min(before));
        if available > 0 {
            let ctx_start = before.saturating_sub(context_words);
            let mut kept: Vec<&str> = words[ctx_start..before].to_vec();
            kept.extend(text[idx..].split_whitespace().take(available));
            tracing::debug!(
                event = "chart_truncated",
                from_words = words.len(),
                to_words = kept.len(),
                procedure_section = true,
            );
            return kept.join(" ");
        }
    }

    tracing::debug!(
        event = "chart_truncated",
        from_words = words.len(),
        to_words = max_words,
        procedure_section = false,
    );
    words[..max_words].join(" ")
}

/// Line references found in any string of `value`, first occurrence order,
/// without duplicates.
pub fn chart_references(value: &serde_json::Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_refs(value, &mut out);
    out
}

fn collect_refs(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => {
            for m in LINE_REF.find_iter(s) {
                if !out.iter().any(|r| r == m.as_str()) {
                    out.push(m.as_str().to_string());
                }
            }
        }
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_refs(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_refs(v, out)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbering_is_zero_padded_and_reversible() {
        let doc = Document::new("op-note", "Patient: A\nPlan: MRI");
        assert_eq!(doc.numbered(), "L001: Patient: A\nL002: Plan: MRI");
        assert_eq!(strip_line_numbers(&doc.numbered()), doc.text);
    }

    #[test]
    fn window_centres_on_mention_or_falls_back_to_head() {
        let text = format!("{}Knee arthroscopy performed{}", "a".repeat(500), "b".repeat(500));
        let doc = Document::new("d", text);
        let w = doc.window_around("KNEE ARTHROSCOPY", 100);
        assert!(w.contains("Knee arthroscopy"));
        assert_eq!(w.len(), 100);

        let head = doc.window_around("hip replacement", 50);
        assert_eq!(head, &doc.text[..50]);
    }

    #[test]
    fn window_respects_char_boundaries() {
        let doc = Document::new("d", "é".repeat(100));
        let w = doc.window_around("x", 51);
        assert_eq!(w.len(), 50);
    }

    #[test]
    fn truncation_keeps_procedure_section() {
        let intro = (0..50).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let text = format!("{intro} PROCEDURE: knee scope with debridement and lavage done");
        let out = smart_truncate_by_words(&text, 10, 3);
        assert!(out.starts_with("w47 w48 w49 PROCEDURE:"));
        assert_eq!(out.split_whitespace().count(), 10);
    }

    #[test]
    fn truncation_without_heading_takes_head() {
        let text = "one two three four five";
        assert_eq!(smart_truncate_by_words(text, 2, 10), "one two");
        assert_eq!(smart_truncate_by_words(text, 10, 10), text);
    }

    #[test]
    fn references_are_unique_and_ordered() {
        let v = json!({
            "reasons": ["see L012 and L003-L005"],
            "requirements": [{"evidence": [{"line_reference": "L012"}], "note": "L0 is not a ref"}]
        });
        let refs = chart_references(&v);
        assert_eq!(refs, vec!["L012", "L003-L005"]);
    }
}
