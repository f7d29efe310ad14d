//! YAML configuration, environment overrides and the settings structs the
//! rest of the crate is built from.

use crate::cache::CacheSettings;
use crate::engine::{CallPolicy, OrchestratorSettings};
use crate::errors::ConfigError;
use crate::pricing::Pricing;
use crate::providers::gateway::GatewaySettings;
use crate::providers::transport::HttpSettings;
use crate::targets::{EvaluationTarget, TargetSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod path_resolver;

pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(rename = "configVersion")]
    pub version: u32,
    pub model: ModelConfig,
    #[serde(default)]
    pub pricing: Pricing,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub targets: Vec<EvaluationTarget>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_id: String,
    #[serde(default)]
    pub fallback_model_id: Option<String>,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Usually supplied through `CHARTCHECK_API_KEY` instead.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_extraction_max_tokens")]
    pub extraction_max_tokens: u32,
    #[serde(default = "default_improvement_max_tokens")]
    pub improvement_max_tokens: u32,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_true")]
    pub prompt_caching: bool,
    #[serde(default = "default_min_cache_tokens")]
    pub min_cache_tokens: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Upper bound for one attempt, end to end.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            ttl_hours: default_ttl_hours(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_min_relevance")]
    pub min_relevance_score: f64,
    #[serde(default = "default_chart_window")]
    pub chart_window_chars: usize,
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
    /// Guideline file or directory per target id. Overrides `guideline_path`.
    #[serde(default)]
    pub guidelines: BTreeMap<String, PathBuf>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            max_context_chars: default_max_context_chars(),
            min_relevance_score: default_min_relevance(),
            chart_window_chars: default_chart_window(),
            timeout_secs: default_retrieval_timeout(),
            guidelines: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_parallel_units")]
    pub parallel_units: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_extraction_max_words")]
    pub extraction_max_words: usize,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            parallel_units: default_parallel_units(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            extraction_max_words: default_extraction_max_words(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_endpoint() -> String {
    HttpSettings::default().endpoint
}
fn default_max_tokens() -> u32 {
    4000
}
fn default_extraction_max_tokens() -> u32 {
    1500
}
fn default_improvement_max_tokens() -> u32 {
    8000
}
fn default_min_cache_tokens() -> usize {
    1024
}
fn default_connect_timeout() -> u64 {
    60
}
fn default_read_timeout() -> u64 {
    180
}
fn default_call_timeout() -> u64 {
    240
}
fn default_pool_size() -> usize {
    4
}
fn default_cache_path() -> PathBuf {
    PathBuf::from(".chartcheck/cache.db")
}
fn default_ttl_hours() -> i64 {
    24
}
fn default_top_k() -> usize {
    6
}
fn default_max_context_chars() -> usize {
    12_000
}
fn default_min_relevance() -> f64 {
    10.0
}
fn default_chart_window() -> usize {
    4_000
}
fn default_retrieval_timeout() -> u64 {
    60
}
fn default_parallel_units() -> usize {
    4
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_extraction_max_words() -> usize {
    8_000
}

pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("failed to read config {}: {}", path.display(), e)))?;
    let mut cfg = parse_config(&raw)?;
    apply_overrides(&mut cfg, |k| std::env::var(k).ok())?;
    validate(&cfg)?;
    normalize_paths(&mut cfg, path);
    Ok(cfg)
}

/// Parses YAML without environment overrides, validation or path handling.
pub fn parse_config(raw: &str) -> Result<AppConfig, ConfigError> {
    let cfg: AppConfig = serde_yaml::from_str(raw)
        .map_err(|e| ConfigError(format!("failed to parse YAML: {}", e)))?;
    if cfg.version != SUPPORTED_CONFIG_VERSION {
        return Err(ConfigError(format!(
            "unsupported config version {} (supported: {})",
            cfg.version, SUPPORTED_CONFIG_VERSION
        )));
    }
    Ok(cfg)
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError(format!("invalid value for {}: '{}'", key, raw)))
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError(format!("invalid value for {}: '{}'", key, raw))),
    }
}

/// Applies `CHARTCHECK_*` overrides. `lookup` is `std::env::var` outside tests.
pub fn apply_overrides(
    cfg: &mut AppConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(v) = lookup("CHARTCHECK_MODEL_ID") {
        cfg.model.model_id = v;
    }
    if let Some(v) = lookup("CHARTCHECK_FALLBACK_MODEL_ID") {
        cfg.model.fallback_model_id = if v.trim().is_empty() { None } else { Some(v) };
    }
    if let Some(v) = lookup("CHARTCHECK_ENDPOINT") {
        cfg.model.endpoint = v;
    }
    if let Some(v) = lookup("CHARTCHECK_API_KEY") {
        cfg.model.api_key = Some(v);
    }
    if let Some(v) = lookup("CHARTCHECK_CACHE_PATH") {
        cfg.cache.path = PathBuf::from(v);
    }
    if let Some(v) = lookup("CHARTCHECK_CACHE_TTL_HOURS") {
        cfg.cache.ttl_hours = parse_var("CHARTCHECK_CACHE_TTL_HOURS", &v)?;
    }
    if let Some(v) = lookup("CHARTCHECK_ENABLE_CACHE") {
        cfg.cache.enabled = parse_flag("CHARTCHECK_ENABLE_CACHE", &v)?;
    }
    if let Some(v) = lookup("CHARTCHECK_ENABLE_PROMPT_CACHING") {
        cfg.model.prompt_caching = parse_flag("CHARTCHECK_ENABLE_PROMPT_CACHING", &v)?;
    }
    if let Some(v) = lookup("CHARTCHECK_MIN_CACHE_TOKENS") {
        cfg.model.min_cache_tokens = parse_var("CHARTCHECK_MIN_CACHE_TOKENS", &v)?;
    }
    if let Some(v) = lookup("CHARTCHECK_TOP_K") {
        cfg.retrieval.top_k = parse_var("CHARTCHECK_TOP_K", &v)?;
    }
    Ok(())
}

pub fn validate(cfg: &AppConfig) -> Result<(), ConfigError> {
    if cfg.model.model_id.trim().is_empty() {
        return Err(ConfigError("model.model_id is required".into()));
    }
    if cfg.cache.ttl_hours <= 0 {
        return Err(ConfigError(format!(
            "cache.ttl_hours must be positive, got {}",
            cfg.cache.ttl_hours
        )));
    }
    if cfg.cache_ttl().is_none() {
        return Err(ConfigError(format!(
            "cache.ttl_hours is out of range, got {}",
            cfg.cache.ttl_hours
        )));
    }
    if !(cfg.pricing.input_per_1k > 0.0 && cfg.pricing.output_per_1k > 0.0) {
        return Err(ConfigError("pricing rates must be positive".into()));
    }
    if cfg.evaluation.max_attempts == 0 {
        return Err(ConfigError("evaluation.max_attempts must be at least 1".into()));
    }
    // Emptiness and normalized-id uniqueness.
    cfg.target_set().map(|_| ())
}

fn normalize_paths(cfg: &mut AppConfig, config_path: &Path) {
    let r = path_resolver::PathResolver::new(config_path);
    r.resolve(&mut cfg.cache.path);
    for p in cfg.retrieval.guidelines.values_mut() {
        r.resolve(p);
    }
    for t in &mut cfg.targets {
        r.resolve_opt_str(&mut t.guideline_path);
    }
}

impl AppConfig {
    pub fn target_set(&self) -> Result<TargetSet, ConfigError> {
        TargetSet::new(self.targets.clone())
    }

    /// `None` when `ttl_hours` does not fit a duration.
    pub fn cache_ttl(&self) -> Option<chrono::Duration> {
        chrono::Duration::try_hours(self.cache.ttl_hours)
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            ttl: self.cache_ttl().unwrap_or(chrono::Duration::MAX),
            enabled: self.cache.enabled,
        }
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            endpoint: self.model.endpoint.clone(),
            api_key: self.model.api_key.clone(),
            connect_timeout: Duration::from_secs(self.model.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.model.read_timeout_secs),
            pool_size: self.model.pool_size.max(1),
        }
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            model_id: self.model.model_id.clone(),
            fallback_model_id: self.model.fallback_model_id.clone(),
            min_cache_tokens: self.model.min_cache_tokens,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            top_k: self.retrieval.top_k,
            max_context_chars: self.retrieval.max_context_chars,
            min_relevance_score: self.retrieval.min_relevance_score,
            chart_window_chars: self.retrieval.chart_window_chars,
            parallel_units: self.evaluation.parallel_units.max(1),
            max_tokens: self.model.max_tokens,
            extraction_max_tokens: self.model.extraction_max_tokens,
            improvement_max_tokens: self.model.improvement_max_tokens,
            extraction_max_words: self.evaluation.extraction_max_words,
            temperature: self.model.temperature,
            improvement_temperature: OrchestratorSettings::default().improvement_temperature,
            prompt_caching: self.model.prompt_caching,
            call: CallPolicy {
                max_attempts: self.evaluation.max_attempts,
                timeout: Duration::from_secs(self.model.call_timeout_secs),
                backoff: Duration::from_millis(self.evaluation.backoff_ms),
            },
            retrieval_timeout: Duration::from_secs(self.retrieval.timeout_secs),
        }
    }
}

pub const SAMPLE_CONFIG: &str = r#"configVersion: 1

model:
  model_id: us.anthropic.claude-sonnet-4-20250514-v1:0
  fallback_model_id: anthropic.claude-3-5-sonnet-20240620-v1:0
  endpoint: https://bedrock-runtime.us-east-1.amazonaws.com
  max_tokens: 4000
  improvement_max_tokens: 8000
  temperature: 0.0
  prompt_caching: true
  min_cache_tokens: 1024
  connect_timeout_secs: 60
  read_timeout_secs: 180
  pool_size: 4

pricing:
  input_per_1k: 0.003
  output_per_1k: 0.015

cache:
  path: .chartcheck/cache.db
  ttl_hours: 24
  enabled: true

retrieval:
  top_k: 6
  max_context_chars: 12000
  min_relevance_score: 10.0
  chart_window_chars: 4000
  guidelines:
    uhc: guidelines/uhc
    cigna: guidelines/cigna

evaluation:
  parallel_units: 4
  max_attempts: 3

targets:
  - id: cigna
    name: Cigna
    priority: 1
  - id: uhc
    name: UnitedHealthcare
    priority: 2
    filter_terms: [commercial]
  - id: anthem
    name: Anthem
    priority: 3
    guideline_path: guidelines/anthem
"#;

pub fn write_sample_config(path: &Path) -> Result<(), ConfigError> {
    std::fs::write(path, SAMPLE_CONFIG)
        .map_err(|e| ConfigError(format!("failed to write sample config: {}", e)))?;
    Ok(())
}
