//! Structured-object recovery from imperfect model output.
//!
//! Recovery is an ordered list of pure `&str -> Option<Value>` strategies.
//! The first strategy yielding a JSON object wins. When one response must
//! answer for several targets, [`recover_for_targets`] additionally scores
//! every balanced span so wrapper envelopes and partial duplicates in the
//! model's narration do not shadow the real answer.

pub mod candidates;

use crate::errors::RecoveryFailure;
use crate::targets::{TargetId, TargetSet};
use candidates::{balanced_end, best_candidate, count_expected};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;

pub type Strategy = fn(&str) -> Option<Value>;

/// Strategies in the order they are tried.
pub const STRATEGIES: &[(&str, Strategy)] = &[
    ("strict", strict_parse),
    ("primary_span", primary_span),
    ("rescan", rescan),
    ("sanitized", sanitized),
];

/// Drops a leading code fence line (```json) and a trailing fence.
pub fn strip_fences(text: &str) -> &str {
    let mut s = text.trim();
    if s.starts_with("```") {
        s = match s.split_once('\n') {
            Some((_, rest)) => rest,
            None => s.trim_start_matches('`'),
        };
        s = s.trim_end();
        if let Some(inner) = s.strip_suffix("```") {
            s = inner;
        }
        s = s.trim();
    }
    s
}

/// The first brace-balanced object span after fence stripping.
pub fn extract_primary(text: &str) -> Option<&str> {
    let s = strip_fences(text);
    let start = s.find('{')?;
    balanced_end(s, start).map(|end| &s[start..end])
}

fn as_object(v: Value) -> Option<Value> {
    v.is_object().then_some(v)
}

pub fn strict_parse(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text.trim()).ok().and_then(as_object)
}

pub fn primary_span(text: &str) -> Option<Value> {
    extract_primary(text).and_then(strict_parse)
}

/// Tries each opening brace in turn until a span parses. Catches output where
/// an unbalanced or invalid fragment precedes the real object.
pub fn rescan(text: &str) -> Option<Value> {
    text.match_indices('{')
        .take(candidates::MAX_CANDIDATE_STARTS)
        .filter_map(|(start, _)| balanced_end(text, start).map(|end| &text[start..end]))
        .find_map(strict_parse)
}

pub fn sanitized(text: &str) -> Option<Value> {
    match sanitize_control_chars(text) {
        Cow::Borrowed(_) => None,
        Cow::Owned(clean) => strict_parse(&clean).or_else(|| primary_span(&clean)),
    }
}

/// Removes control characters other than newline, tab and carriage return,
/// and escapes those three when they occur raw inside a string literal.
pub fn sanitize_control_chars(text: &str) -> Cow<'_, str> {
    let dirty = text.chars().any(|c| {
        matches!(c, '\u{00}'..='\u{1f}' | '\u{7f}'..='\u{9f}') && !matches!(c, '\n' | '\t' | '\r')
    }) || has_raw_whitespace_in_string(text);
    if !dirty {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escape = false;
    for c in text.chars() {
        match c {
            '\n' | '\t' | '\r' if in_string => {
                out.push_str(match c {
                    '\n' => "\\n",
                    '\t' => "\\t",
                    _ => "\\r",
                });
                escape = false;
                continue;
            }
            '\n' | '\t' | '\r' => {}
            '\u{00}'..='\u{1f}' | '\u{7f}'..='\u{9f}' => continue,
            _ => {}
        }
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
        }
        out.push(c);
    }
    Cow::Owned(out)
}

fn has_raw_whitespace_in_string(text: &str) -> bool {
    let mut in_string = false;
    let mut escape = false;
    for c in text.chars() {
        if in_string {
            if escape {
                escape = false;
            } else {
                match c {
                    '\\' => escape = true,
                    '"' => in_string = false,
                    '\n' | '\t' | '\r' => return true,
                    _ => {}
                }
            }
        } else if c == '"' {
            in_string = true;
        }
    }
    false
}

/// Runs the strategies in order. Returns the object and the strategy name.
pub fn recover_object(text: &str) -> Result<(Value, &'static str), RecoveryFailure> {
    STRATEGIES
        .iter()
        .find_map(|(name, strategy)| strategy(text).map(|v| (v, *name)))
        .ok_or(RecoveryFailure::NoCandidate)
}

/// Per-target outcome of recovering one multi-target response.
#[derive(Debug, Clone)]
pub struct TargetRecovery {
    pub results: BTreeMap<TargetId, Result<Value, RecoveryFailure>>,
    /// Strategy that produced the winning object, `multi_candidate` when the
    /// scored scan was needed, `None` when nothing parsed.
    pub strategy: Option<&'static str>,
}

/// Recovers one verdict object per expected target.
///
/// The returned map always holds exactly one entry per target in `expected`.
/// `expected` must be a subset of `targets`.
pub fn recover_for_targets(text: &str, targets: &TargetSet, expected: &[TargetId]) -> TargetRecovery {
    let primary = recover_object(text).ok();
    let primary_score = primary
        .as_ref()
        .and_then(|(v, _)| v.as_object())
        .map(|o| count_expected(o, targets, expected))
        .unwrap_or(0);

    let winner: Option<(Map<String, Value>, &'static str)> = if primary_score == expected.len() {
        primary.and_then(|(v, name)| match v {
            Value::Object(o) => Some((o, name)),
            _ => None,
        })
    } else {
        match best_candidate(text, targets, expected) {
            Some(c) if c.score > primary_score => {
                tracing::debug!(
                    event = "recovery_multi_candidate",
                    score = c.score,
                    span_len = c.text.len(),
                );
                Some((c.object, "multi_candidate"))
            }
            _ => primary.and_then(|(v, name)| match v {
                Value::Object(o) => Some((o, name)),
                _ => None,
            }),
        }
    };

    let Some((object, strategy)) = winner else {
        return TargetRecovery {
            results: expected
                .iter()
                .map(|id| (id.clone(), Err(RecoveryFailure::NoCandidate)))
                .collect(),
            strategy: None,
        };
    };

    let results = expected
        .iter()
        .map(|id| (id.clone(), take_target(&object, targets, id)))
        .collect();
    TargetRecovery {
        results,
        strategy: Some(strategy),
    }
}

fn take_target(
    obj: &Map<String, Value>,
    targets: &TargetSet,
    id: &TargetId,
) -> Result<Value, RecoveryFailure> {
    let value = obj
        .iter()
        .find(|(k, _)| targets.resolve(k) == Some(id))
        .map(|(_, v)| v)
        .ok_or_else(|| RecoveryFailure::TargetMissing(id.to_string()))?;
    match value {
        Value::Object(_) => Ok(value.clone()),
        other => Err(RecoveryFailure::InvalidStructure(format!(
            "expected an object for '{}', found {}",
            id,
            json_kind(other)
        ))),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn each_strategy_is_independent() {
        assert!(strict_parse("{\"a\":1}").is_some());
        assert!(strict_parse("[1,2]").is_none());
        assert!(primary_span("Here you go: {\"a\":1} thanks").is_some());
        assert!(primary_span("{broken {\"a\":1}").is_none());
        assert_eq!(rescan("{broken {\"a\":1}"), Some(serde_json::json!({"a": 1})));
        assert_eq!(
            sanitized("{\"a\":\"line\u{0}one\nline two\"}"),
            Some(serde_json::json!({"a": "lineone\nline two"}))
        );
        assert!(sanitized("{\"a\":1}").is_none());
    }

    #[test]
    fn truncated_output_has_no_candidate() {
        assert_eq!(
            recover_object("{\"a\": {\"b\": 1").unwrap_err(),
            RecoveryFailure::NoCandidate
        );
    }
}
