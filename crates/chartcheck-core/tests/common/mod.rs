#![allow(dead_code)]

use async_trait::async_trait;
use chartcheck_core::cache::{CacheSettings, CacheStore, Clock};
use chartcheck_core::engine::{CallPolicy, EvaluationOrchestrator, OrchestratorSettings};
use chartcheck_core::errors::GatewayError;
use chartcheck_core::pricing::{Pricing, TokenUsage, UsageRecord};
use chartcheck_core::providers::{GenerateRequest, Generation, ModelClient, Transport};
use chartcheck_core::retrieval::{GuidelineHit, GuidelineRetriever};
use chartcheck_core::targets::{EvaluationTarget, TargetId, TargetSet};
use chartcheck_core::usage::UsageAccumulator;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

pub const MODEL: &str = "test-model";

pub fn targets() -> TargetSet {
    let t = |id: &str, name: &str, priority: u32| EvaluationTarget {
        id: id.into(),
        name: name.into(),
        priority,
        filter_terms: vec![],
        guideline_path: None,
    };
    TargetSet::new(vec![
        t("cigna", "Cigna", 1),
        t("uhc", "UnitedHealthcare", 2),
        t("anthem", "Anthem", 3),
    ])
    .unwrap()
}

pub fn usage(input: u64, output: u64) -> UsageRecord {
    UsageRecord::priced(
        TokenUsage {
            input_tokens: input,
            output_tokens: output,
            ..Default::default()
        },
        MODEL,
        &Pricing::default(),
    )
}

/// The unit named in an evaluation prompt.
pub fn unit_in_prompt(prompt: &str) -> String {
    prompt
        .lines()
        .find_map(|l| l.strip_prefix("Procedure under review: "))
        .unwrap_or_default()
        .to_string()
}

/// A well-formed answer for `keys`, all with the same decision.
pub fn answer(keys: &[&str], decision: &str) -> String {
    let mut obj = serde_json::Map::new();
    for k in keys {
        obj.insert(
            k.to_string(),
            json!({
                "policy_name": format!("{} policy", k),
                "decision": decision,
                "primary_reasons": ["Duration documented at L002"],
                "requirement_checklist": [
                    {"requirement_id": "duration", "status": "met", "evidence": [{"line_reference": "L002"}]},
                    {"requirement_id": "imaging", "status": "unmet", "missing_to_meet": "No MRI report"}
                ],
                "improvement_recommendations": {"documentation_gaps": ["Imaging results"], "priority": "medium"}
            }),
        );
    }
    Value::Object(obj).to_string()
}

type Responder = dyn Fn(&GenerateRequest) -> Result<String, GatewayError> + Send + Sync;

/// Model client answering from a closure and counting live calls.
pub struct ScriptedClient {
    calls: AtomicUsize,
    responder: Box<Responder>,
}

impl ScriptedClient {
    pub fn new(
        responder: impl Fn(&GenerateRequest) -> Result<String, GatewayError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            responder: Box::new(responder),
        }
    }

    /// Answers every evaluation prompt for all three test targets.
    pub fn all_sufficient() -> Self {
        Self::new(|_| Ok(answer(&["cigna", "uhc", "anthem"], "Sufficient")))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn generate(&self, req: &GenerateRequest) -> Result<Generation, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = (self.responder)(req)?;
        Ok(Generation {
            text,
            usage: usage(1000, 200),
        })
    }

    fn model_id(&self) -> &str {
        MODEL
    }

    fn provider_name(&self) -> &'static str {
        "scripted"
    }
}

/// One relevant hit per target, except for targets listed as empty or failing.
#[derive(Default)]
pub struct StaticRetriever {
    pub empty: BTreeSet<String>,
    pub failing: BTreeSet<String>,
    pub code_queries: AtomicUsize,
    pub semantic_queries: AtomicUsize,
}

impl StaticRetriever {
    fn hits(&self, target: &TargetId) -> anyhow::Result<Vec<GuidelineHit>> {
        if self.failing.contains(target.as_str()) {
            anyhow::bail!("index for {} unavailable", target);
        }
        if self.empty.contains(target.as_str()) {
            return Ok(Vec::new());
        }
        Ok(vec![GuidelineHit {
            record_id: format!("{}-1", target),
            file: format!("{}.json", target),
            score: 120.0,
            source: json!({
                "procedure": "Knee arthroscopy",
                "text": "Requires six weeks of conservative therapy and imaging."
            }),
            matched_codes: vec![],
        }])
    }
}

#[async_trait]
impl GuidelineRetriever for StaticRetriever {
    async fn search_by_codes(
        &self,
        target: &TargetId,
        _codes: &[String],
    ) -> anyhow::Result<Vec<GuidelineHit>> {
        self.code_queries.fetch_add(1, Ordering::SeqCst);
        self.hits(target)
    }

    async fn search_semantic(
        &self,
        target: &TargetId,
        _query: &str,
        _top_k: usize,
    ) -> anyhow::Result<Vec<GuidelineHit>> {
        self.semantic_queries.fetch_add(1, Ordering::SeqCst);
        self.hits(target)
    }
}

type TransportFn = dyn Fn(&str, &Value) -> Result<Value, GatewayError> + Send + Sync;

/// Records which model each body was sent to.
pub struct RecordingTransport {
    pub invoked: Mutex<Vec<String>>,
    respond: Box<TransportFn>,
}

impl RecordingTransport {
    pub fn new(
        respond: impl Fn(&str, &Value) -> Result<Value, GatewayError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            invoked: Mutex::new(Vec::new()),
            respond: Box::new(respond),
        }
    }

    pub fn invoked(&self) -> Vec<String> {
        self.invoked.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn invoke(&self, model_id: &str, body: &Value) -> Result<Value, GatewayError> {
        self.invoked.lock().unwrap().push(model_id.to_string());
        (self.respond)(model_id, body)
    }
}

pub fn messages_payload(text: &str) -> Value {
    json!({
        "content": [{"type": "text", "text": text}],
        "usage": {"input_tokens": 1200, "output_tokens": 300, "cache_read_input_tokens": 800}
    })
}

/// Clock that only moves when told to.
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Utc::now())))
    }

    pub fn advance(&self, by: Duration) {
        *self.0.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

pub fn open_cache(path: &Path) -> CacheStore {
    CacheStore::open(path, CacheSettings::default(), Pricing::default()).unwrap()
}

pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        call: CallPolicy {
            max_attempts: 3,
            timeout: StdDuration::from_secs(5),
            backoff: StdDuration::from_millis(1),
        },
        ..Default::default()
    }
}

pub fn orchestrator(
    client: Arc<dyn ModelClient>,
    retriever: Arc<dyn GuidelineRetriever>,
    cache: CacheStore,
) -> EvaluationOrchestrator {
    EvaluationOrchestrator::new(
        Arc::new(targets()),
        client,
        retriever,
        cache,
        UsageAccumulator::new(Pricing::default()),
        fast_settings(),
    )
}

/// Buffer-backed writer for capturing JSON log lines.
#[derive(Clone, Default)]
pub struct LogCapture(pub Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

pub struct MockWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
    type Writer = MockWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MockWriter(self.0.clone())
    }
}
