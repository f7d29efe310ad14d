use crate::targets::{TargetId, TargetSet};
use serde_json::{Map, Value};

/// Upper bound on opening braces tried as candidate starts.
pub const MAX_CANDIDATE_STARTS: usize = 256;

/// End (exclusive) of the brace-balanced span opening at `start`.
///
/// Quoted strings are opaque: braces inside them never change depth, and a
/// backslash escapes the next byte. Returns `None` when the span never closes.
pub fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(start) != Some(&b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escape {
                escape = false;
            } else if b == b'\\' {
                escape = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Every brace-balanced span in `text`, one per opening brace, in order of
/// their start. Nested objects appear both inside their parent's span and
/// on their own.
pub fn balanced_spans(text: &str) -> Vec<&str> {
    text.match_indices('{')
        .take(MAX_CANDIDATE_STARTS)
        .filter_map(|(start, _)| balanced_end(text, start).map(|end| &text[start..end]))
        .collect()
}

/// Top-level keys of `obj` resolved to configured targets.
pub fn matched_targets<'a>(obj: &Map<String, Value>, targets: &'a TargetSet) -> Vec<&'a TargetId> {
    let mut found: Vec<&TargetId> = Vec::new();
    for key in obj.keys() {
        if let Some(id) = targets.resolve(key) {
            if !found.contains(&id) {
                found.push(id);
            }
        }
    }
    found
}

pub struct Candidate<'t> {
    pub text: &'t str,
    pub object: Map<String, Value>,
    pub score: usize,
}

/// How many of `expected` appear as top-level keys of `obj`. Keys naming
/// other configured targets do not count.
pub fn count_expected(obj: &Map<String, Value>, targets: &TargetSet, expected: &[TargetId]) -> usize {
    matched_targets(obj, targets)
        .into_iter()
        .filter(|id| expected.contains(id))
        .count()
}

/// Parses every balanced span and keeps the object naming the most expected
/// targets. Ties go to the longer span. Objects with no expected key are
/// never selected.
pub fn best_candidate<'t>(
    text: &'t str,
    targets: &TargetSet,
    expected: &[TargetId],
) -> Option<Candidate<'t>> {
    let mut best: Option<Candidate<'t>> = None;
    for span in balanced_spans(text) {
        let Ok(Value::Object(object)) = serde_json::from_str::<Value>(span) else {
            continue;
        };
        let score = count_expected(&object, targets, expected);
        if score == 0 {
            continue;
        }
        let better = match &best {
            None => true,
            Some(b) => score > b.score || (score == b.score && span.len() > b.text.len()),
        };
        if better {
            best = Some(Candidate {
                text: span,
                object,
                score,
            });
        }
    }
    best
}
