use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Folds case and drops whitespace, hyphens and underscores.
///
/// Used on both sides of every target lookup: when the prompt names target
/// keys and when response keys are matched back.
pub fn normalize_key(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

/// One policy authority, as configured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationTarget {
    pub id: String,
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub filter_terms: Vec<String>,
    /// Guideline file or directory for the local JSON index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guideline_path: Option<String>,
}

fn default_priority() -> u32 {
    999
}

/// Identifier of a configured target. Only obtainable from a [`TargetSet`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(Arc<str>);

impl TargetId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The closed set of targets a run evaluates against, in priority order.
#[derive(Debug, Clone)]
pub struct TargetSet {
    entries: Vec<(TargetId, EvaluationTarget)>,
    by_key: BTreeMap<String, usize>,
}

impl TargetSet {
    pub fn new(mut targets: Vec<EvaluationTarget>) -> Result<Self, ConfigError> {
        if targets.is_empty() {
            return Err(ConfigError("at least one evaluation target is required".into()));
        }
        targets.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

        let mut entries = Vec::with_capacity(targets.len());
        let mut by_key = BTreeMap::new();
        for (idx, t) in targets.into_iter().enumerate() {
            let key = normalize_key(&t.id);
            if key.is_empty() {
                return Err(ConfigError(format!("target '{}' has an empty id", t.id)));
            }
            if by_key.insert(key, idx).is_some() {
                return Err(ConfigError(format!(
                    "duplicate target id '{}' (ids are compared case/punctuation-insensitively)",
                    t.id
                )));
            }
            entries.push((TargetId(Arc::from(t.id.as_str())), t));
        }
        // Display names are accepted as aliases unless they collide with an id.
        for idx in 0..entries.len() {
            let alias = normalize_key(&entries[idx].1.name);
            if !alias.is_empty() {
                by_key.entry(alias).or_insert(idx);
            }
        }
        Ok(Self { entries, by_key })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TargetId> {
        self.entries.iter().map(|(id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TargetId, &EvaluationTarget)> {
        self.entries.iter().map(|(id, t)| (id, t))
    }

    pub fn get(&self, id: &TargetId) -> Option<&EvaluationTarget> {
        self.entries.iter().find(|(i, _)| i == id).map(|(_, t)| t)
    }

    /// Resolves a free-form key (response key, CLI argument) to a target.
    pub fn resolve(&self, raw: &str) -> Option<&TargetId> {
        self.by_key
            .get(&normalize_key(raw))
            .map(|&idx| &self.entries[idx].0)
    }

    pub fn display_name<'a>(&'a self, id: &'a TargetId) -> &'a str {
        self.get(id).map(|t| t.name.as_str()).unwrap_or(id.as_str())
    }
}
