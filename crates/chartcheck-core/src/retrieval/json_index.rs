use super::{GuidelineHit, GuidelineRetriever};
use crate::targets::{TargetId, TargetSet};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

const CODE_MATCH_SCORE: f64 = 100.0;
const CODE_FIELD_BONUS: f64 = 50.0;
const PHRASE_SCORE: f64 = 10.0;
const TERM_SCORE: f64 = 2.0;
const CODE_MENTION_SCORE: f64 = 15.0;
const PROCEDURE_SCORE: f64 = 12.0;

/// Trims, drops spaces and hyphens, uppercases.
pub fn normalize_code(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| *c != ' ' && *c != '-')
        .flat_map(char::to_uppercase)
        .collect()
}

#[derive(Debug, Clone)]
struct Record {
    file: String,
    value: Value,
    /// Whole record as uppercase JSON, for code lookups.
    upper: String,
}

/// In-memory index over per-target JSON guideline files.
#[derive(Debug, Clone, Default)]
pub struct JsonGuidelineIndex {
    records: BTreeMap<TargetId, Vec<Record>>,
}

impl JsonGuidelineIndex {
    /// Loads each target's guideline file or directory of `*.json` files.
    ///
    /// `paths` overrides a target's own `guideline_path`. Targets without a
    /// readable path get an empty index and a warning. Records that mention
    /// none of a target's `filter_terms` are dropped when terms are set.
    pub fn load(targets: &TargetSet, paths: &BTreeMap<String, PathBuf>) -> anyhow::Result<Self> {
        let mut index = Self::default();
        for (id, target) in targets.iter() {
            let path = paths
                .get(id.as_str())
                .cloned()
                .or_else(|| target.guideline_path.as_ref().map(PathBuf::from));
            let Some(path) = path else {
                tracing::warn!(event = "guidelines_missing", target = %id, "no guideline path configured");
                index.records.insert(id.clone(), Vec::new());
                continue;
            };
            let mut loaded = load_path(&path)?;
            if !target.filter_terms.is_empty() {
                let terms: Vec<String> = target
                    .filter_terms
                    .iter()
                    .map(|t| t.to_uppercase())
                    .collect();
                loaded.retain(|(_, v)| {
                    let upper = v.to_string().to_uppercase();
                    terms.iter().any(|t| upper.contains(t))
                });
            }
            tracing::info!(
                event = "guidelines_loaded",
                target = %id,
                path = %path.display(),
                records = loaded.len(),
            );
            index.insert(id.clone(), loaded);
        }
        Ok(index)
    }

    /// Builds an index from already-parsed records, `(file, record)` pairs.
    pub fn from_records(records: impl IntoIterator<Item = (TargetId, Vec<(String, Value)>)>) -> Self {
        let mut index = Self::default();
        for (id, recs) in records {
            index.insert(id, recs);
        }
        index
    }

    fn insert(&mut self, id: TargetId, recs: Vec<(String, Value)>) {
        let recs = recs
            .into_iter()
            .map(|(file, value)| Record {
                upper: value.to_string().to_uppercase(),
                file,
                value,
            })
            .collect();
        self.records.insert(id, recs);
    }

    pub fn record_count(&self, target: &TargetId) -> usize {
        self.records.get(target).map_or(0, Vec::len)
    }

    fn hit(&self, target: &TargetId, idx: usize, rec: &Record, score: f64, codes: Vec<String>) -> GuidelineHit {
        GuidelineHit {
            record_id: format!("{}_{}", target, idx),
            file: rec.file.clone(),
            score,
            source: rec.value.clone(),
            matched_codes: codes,
        }
    }

    /// Exhaustive code lookup: 100 per code found anywhere in a record, plus
    /// 50 when it also sits in a dedicated `cpt_codes` or `codes` field.
    pub fn codes_search(&self, target: &TargetId, codes: &[String]) -> Vec<GuidelineHit> {
        let Some(records) = self.records.get(target) else {
            return Vec::new();
        };
        let wanted: Vec<(String, &String)> = codes
            .iter()
            .map(|c| (normalize_code(c), c))
            .filter(|(n, _)| !n.is_empty())
            .collect();

        let mut hits = Vec::new();
        for (idx, rec) in records.iter().enumerate() {
            let mut score = 0.0;
            let mut matched = Vec::new();
            for (norm, original) in &wanted {
                if !rec.upper.contains(norm.as_str()) {
                    continue;
                }
                score += CODE_MATCH_SCORE;
                matched.push((*original).clone());
                for field in ["cpt_codes", "codes"] {
                    if let Some(v) = rec.value.get(field) {
                        if v.to_string().to_uppercase().contains(norm.as_str()) {
                            score += CODE_FIELD_BONUS;
                        }
                    }
                }
            }
            if !matched.is_empty() {
                hits.push(self.hit(target, idx, rec, score, matched));
            }
        }
        sort_hits(&mut hits);
        hits
    }

    /// Keyword relevance: whole query as a phrase, shared terms, code
    /// mentions and procedure-name containment. Zero scores are dropped.
    pub fn semantic_search(&self, target: &TargetId, query: &str, top_k: usize) -> Vec<GuidelineHit> {
        let Some(records) = self.records.get(target) else {
            return Vec::new();
        };
        let query = query.to_lowercase();
        let terms: BTreeSet<&str> = query.split_whitespace().collect();

        let mut hits: Vec<GuidelineHit> = records
            .iter()
            .enumerate()
            .filter_map(|(idx, rec)| {
                let score = relevance(&rec.value, &query, &terms);
                (score > 0.0).then(|| self.hit(target, idx, rec, score, Vec::new()))
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(top_k);
        hits
    }
}

fn sort_hits(hits: &mut [GuidelineHit]) {
    // Stable: equal scores keep file order.
    hits.sort_by(|a, b| b.score.total_cmp(&a.score));
}

fn str_field<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or("")
}

fn relevance(rec: &Value, query: &str, terms: &BTreeSet<&str>) -> f64 {
    let code_list: Vec<String> = rec
        .get("cpt_codes")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .map(|c| c.as_str().map(str::to_string).unwrap_or_else(|| c.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let mut fields: Vec<String> = ["procedure", "text", "content", "policy_name", "description"]
        .iter()
        .map(|k| str_field(rec, k).to_string())
        .collect();
    fields.push(code_list.join(" "));
    match rec.get("evidence") {
        Some(Value::Array(items)) => fields.extend(items.iter().map(Value::to_string)),
        Some(e @ Value::Object(_)) => fields.push(e.to_string()),
        _ => {}
    }
    let searchable = fields.join(" ").to_lowercase();

    let mut score = 0.0;
    if !query.is_empty() && searchable.contains(query) {
        score += PHRASE_SCORE;
    }
    let text_terms: BTreeSet<&str> = searchable.split_whitespace().collect();
    score += terms.intersection(&text_terms).count() as f64 * TERM_SCORE;
    score += code_list.iter().filter(|c| query.contains(c.as_str())).count() as f64
        * CODE_MENTION_SCORE;
    let procedure = str_field(rec, "procedure").to_lowercase();
    if !procedure.is_empty() && query.contains(&procedure) {
        score += PROCEDURE_SCORE;
    }
    score
}

fn load_path(path: &Path) -> anyhow::Result<Vec<(String, Value)>> {
    if path.is_file() {
        return Ok(load_file(path));
    }
    if !path.is_dir() {
        tracing::warn!(event = "guidelines_missing", path = %path.display(), "guideline path not found");
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(path)
        .with_context(|| format!("failed to list {}", path.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|x| x == "json"))
        .collect();
    files.sort();
    Ok(files.iter().flat_map(|f| load_file(f)).collect())
}

fn load_file(path: &Path) -> Vec<(String, Value)> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parsed = std::fs::read_to_string(path)
        .map_err(anyhow::Error::from)
        .and_then(|s| serde_json::from_str::<Value>(&s).map_err(anyhow::Error::from));
    match parsed {
        Ok(Value::Array(items)) => items.into_iter().map(|v| (name.clone(), v)).collect(),
        Ok(v) => vec![(name, v)],
        Err(e) => {
            tracing::warn!(event = "guideline_file_invalid", path = %path.display(), error = %e);
            Vec::new()
        }
    }
}

#[async_trait]
impl GuidelineRetriever for JsonGuidelineIndex {
    async fn search_by_codes(
        &self,
        target: &TargetId,
        codes: &[String],
    ) -> anyhow::Result<Vec<GuidelineHit>> {
        Ok(self.codes_search(target, codes))
    }

    async fn search_semantic(
        &self,
        target: &TargetId,
        query: &str,
        top_k: usize,
    ) -> anyhow::Result<Vec<GuidelineHit>> {
        Ok(self.semantic_search(target, query, top_k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::EvaluationTarget;
    use serde_json::json;

    fn cigna() -> TargetId {
        TargetSet::new(vec![EvaluationTarget {
            id: "cigna".into(),
            name: "Cigna".into(),
            priority: 1,
            filter_terms: vec![],
            guideline_path: None,
        }])
        .unwrap()
        .ids()
        .next()
        .unwrap()
        .clone()
    }

    fn index() -> (TargetId, JsonGuidelineIndex) {
        let id = cigna();
        let idx = JsonGuidelineIndex::from_records([(
            id.clone(),
            vec![
                ("knee.json".to_string(), json!({"procedure": "knee arthroscopy", "text": "mentions 29881 in prose"})),
                ("knee.json".to_string(), json!({"procedure": "meniscectomy", "cpt_codes": ["29881", "29880"]})),
                ("hip.json".to_string(), json!({"procedure": "hip replacement", "text": "total hip"})),
            ],
        )]);
        (id, idx)
    }

    #[test]
    fn codes_are_normalized() {
        assert_eq!(normalize_code(" 298-81 "), "29881");
        assert_eq!(normalize_code("g0260"), "G0260");
    }

    #[test]
    fn code_search_is_exhaustive_and_prefers_code_fields() {
        let (id, idx) = index();
        let hits = idx.codes_search(&id, &["29881".into()]);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].score, 150.0);
        assert_eq!(hits[0].record_id, "cigna_1");
        assert_eq!(hits[1].score, 100.0);
        assert_eq!(hits[1].matched_codes, vec!["29881".to_string()]);
    }

    #[test]
    fn semantic_search_scores_phrase_terms_and_procedure() {
        let (id, idx) = index();
        let hits = idx.semantic_search(&id, "knee arthroscopy", 6);
        assert_eq!(hits.len(), 1);
        // phrase 10 + two terms 4 + procedure 12
        assert_eq!(hits[0].score, 26.0);
        assert!(idx.semantic_search(&id, "shoulder", 6).is_empty());
    }

    #[test]
    fn unknown_target_has_no_hits() {
        let idx = JsonGuidelineIndex::default();
        assert!(idx.codes_search(&cigna(), &["29881".into()]).is_empty());
    }

    #[test]
    fn directory_load_skips_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.json"), r#"[{"procedure":"x"},{"procedure":"y"}]"#).unwrap();
        std::fs::write(dir.path().join("b.json"), "not json").unwrap();
        std::fs::write(dir.path().join("c.txt"), "{}").unwrap();
        let loaded = load_path(dir.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].0, "a.json");
    }
}
