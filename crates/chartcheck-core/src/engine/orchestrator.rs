use super::call::{cached_generate, CallPolicy};
use super::extraction::{parse_extraction, ExtractedChart};
use super::improvement::{self, ChartImprovement, ImprovementResponse};
use super::{crossref, prompt, verdict};
use crate::cache::{CacheKind, CacheStore};
use crate::document::{smart_truncate_by_words, Document};
use crate::model::{
    AggregateResult, BatchResult, DocumentOutcome, EvaluationJob, EvaluationUnit, TargetVerdict,
    UnitOutcome, UnitState,
};
use crate::providers::{GenerateRequest, ModelClient};
use crate::recovery;
use crate::report::RunSummary;
use crate::retrieval::{build_context, GuidelineRetriever, TargetContext};
use crate::targets::{TargetId, TargetSet};
use crate::usage::UsageAccumulator;
use anyhow::Context;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Semantic retrieval depth per target.
    pub top_k: usize,
    /// Guideline characters per prompt, shared evenly by the targets.
    pub max_context_chars: usize,
    pub min_relevance_score: f64,
    /// Chart text around the unit mention used as semantic query context.
    pub chart_window_chars: usize,
    pub parallel_units: usize,
    pub max_tokens: u32,
    pub extraction_max_tokens: u32,
    pub extraction_max_words: usize,
    pub improvement_max_tokens: u32,
    pub temperature: f64,
    pub improvement_temperature: f64,
    pub prompt_caching: bool,
    pub call: CallPolicy,
    pub retrieval_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            top_k: 6,
            max_context_chars: 12_000,
            min_relevance_score: 10.0,
            chart_window_chars: 4_000,
            parallel_units: 4,
            max_tokens: 4_000,
            extraction_max_tokens: 1_500,
            extraction_max_words: 8_000,
            improvement_max_tokens: 8_000,
            temperature: 0.0,
            improvement_temperature: 0.1,
            prompt_caching: true,
            call: CallPolicy::default(),
            retrieval_timeout: Duration::from_secs(60),
        }
    }
}

/// Verdicts and final state for one unit.
#[derive(Debug, Clone)]
pub struct UnitReport {
    pub verdicts: Vec<TargetVerdict>,
    pub outcome: UnitOutcome,
}

struct Progress<'a> {
    unit: &'a str,
    state: UnitState,
}

impl<'a> Progress<'a> {
    fn new(unit: &'a str) -> Self {
        Self {
            unit,
            state: UnitState::Pending,
        }
    }

    fn advance(&mut self, next: UnitState) {
        debug_assert!(!self.state.is_terminal(), "unit already finished");
        if next.is_terminal() {
            tracing::info!(event = "unit_state", unit = %self.unit, from = self.state.as_str(), to = next.as_str());
        } else {
            tracing::debug!(event = "unit_state", unit = %self.unit, from = self.state.as_str(), to = next.as_str());
        }
        self.state = next;
    }
}

/// Drives every unit of a job through retrieval, one combined model call,
/// recovery and reconciliation.
///
/// Clones share the cache, usage totals and collaborators.
#[derive(Clone)]
pub struct EvaluationOrchestrator {
    targets: Arc<TargetSet>,
    client: Arc<dyn ModelClient>,
    retriever: Arc<dyn GuidelineRetriever>,
    cache: CacheStore,
    usage: UsageAccumulator,
    settings: Arc<OrchestratorSettings>,
}

impl EvaluationOrchestrator {
    pub fn new(
        targets: Arc<TargetSet>,
        client: Arc<dyn ModelClient>,
        retriever: Arc<dyn GuidelineRetriever>,
        cache: CacheStore,
        usage: UsageAccumulator,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            targets,
            client,
            retriever,
            cache,
            usage,
            settings: Arc::new(settings),
        }
    }

    pub fn targets(&self) -> &TargetSet {
        &self.targets
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn usage(&self) -> &UsageAccumulator {
        &self.usage
    }

    /// Evaluates every unit of `job` against every configured target.
    ///
    /// The result holds exactly one verdict per (unit, target). Unit failures
    /// become error verdicts; only a failed unit extraction aborts the run.
    ///
    /// `usage` counts what the shared accumulator gained during the run, so
    /// concurrent runs on clones see each other's calls. `cache` is
    /// cumulative for the store.
    pub async fn run(&self, job: &EvaluationJob) -> anyhow::Result<AggregateResult> {
        let usage_mark = self.usage.snapshot();
        let document = Arc::new(job.document.clone());
        let units = if job.units.is_empty() {
            self.extract_units(&document).await?.units
        } else {
            job.units.clone()
        };
        let numbered = Arc::new(document.numbered());

        let sem = Arc::new(Semaphore::new(self.settings.parallel_units.max(1)));
        let mut handles = Vec::with_capacity(units.len());
        for unit in units.iter().cloned() {
            let permit = sem.clone().acquire_owned().await?;
            let this = self.clone();
            let document = document.clone();
            let numbered = numbered.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                this.evaluate_unit(&unit, &document, &numbered).await
            }));
        }

        let mut verdicts: BTreeMap<TargetId, Vec<TargetVerdict>> = self
            .targets
            .ids()
            .map(|id| (id.clone(), Vec::with_capacity(units.len())))
            .collect();
        let mut outcomes = Vec::with_capacity(units.len());
        for (unit, handle) in units.iter().zip(handles) {
            let report = match handle.await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!(event = "unit_task_failed", unit = %unit.name, error = %e);
                    self.failed_unit(&unit.name, &format!("task failed: {}", e), 0, false, None)
                }
            };
            for mut v in report.verdicts {
                crossref::annotate(&mut v, &job.related_charts);
                if let Some(list) = verdicts.get_mut(&v.target) {
                    list.push(v);
                }
            }
            outcomes.push(report.outcome);
        }

        if let Err(e) = self.cache.flush_stats() {
            tracing::warn!(event = "cache_io_error", op = "flush_stats", error = %e);
        }
        let summary = RunSummary::from_verdicts(&verdicts);
        Ok(AggregateResult {
            document: document.name.clone(),
            verdicts,
            units: outcomes,
            usage: self.usage.since(&usage_mark),
            cache: self.cache.stats(),
            summary,
        })
    }

    /// Evaluates documents one after another. A document that fails as a
    /// whole is recorded and the batch moves on.
    pub async fn run_batch(&self, jobs: &[EvaluationJob]) -> BatchResult {
        let usage_mark = self.usage.snapshot();
        let mut documents = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.run(job).await {
                Ok(result) => {
                    tracing::info!(
                        event = "document_complete",
                        document = %result.document,
                        units = result.units.len(),
                        errors = result.has_errors(),
                    );
                    documents.push(DocumentOutcome::Completed(Box::new(result)));
                }
                Err(e) => {
                    tracing::error!(
                        event = "document_failed",
                        document = %job.document.name,
                        error = %format!("{:#}", e),
                    );
                    documents.push(DocumentOutcome::Failed {
                        document: job.document.name.clone(),
                        error: format!("{:#}", e),
                    });
                }
            }
        }
        let summary = RunSummary::combine(
            documents
                .iter()
                .filter_map(DocumentOutcome::result)
                .map(|r| &r.verdicts),
        );
        BatchResult {
            documents,
            usage: self.usage.since(&usage_mark),
            cache: self.cache.stats(),
            summary,
        }
    }

    /// Asks the model for the units in `document` and links their codes.
    pub async fn extract_units(&self, document: &Document) -> anyhow::Result<ExtractedChart> {
        let numbered = document.numbered();
        let chart = smart_truncate_by_words(&numbered, self.settings.extraction_max_words, 2_000);
        let req = GenerateRequest {
            prompt: prompt::extraction_prompt(&chart),
            system: Some(prompt::EXTRACTION_SYSTEM_PROMPT.to_string()),
            max_tokens: self.settings.extraction_max_tokens,
            temperature: self.settings.temperature,
            prompt_caching: self.settings.prompt_caching,
        };
        let outcome = cached_generate(
            self.client.as_ref(),
            &self.cache,
            &self.usage,
            CacheKind::Extraction,
            &req,
            &self.settings.call,
        )
        .await
        .with_context(|| format!("unit extraction failed for {}", document.name))?;

        let (value, _) = recovery::recover_object(&outcome.text)
            .with_context(|| format!("unit extraction for {} returned no object", document.name))?;
        let extracted = parse_extraction(&value)?;
        tracing::info!(
            event = "units_extracted",
            document = %document.name,
            units = extracted.units.len(),
            linkage = ?extracted.linkage,
            cached = outcome.cached,
        );
        Ok(extracted)
    }

    /// Asks the model for a rewritten chart that closes the gaps `result`
    /// reports, then makes sure every requested physician input has a
    /// placeholder in the chart text.
    pub async fn improve_chart(
        &self,
        job: &EvaluationJob,
        result: &AggregateResult,
    ) -> anyhow::Result<ChartImprovement> {
        let document = &job.document;
        let digests: Vec<_> =
            improvement::collect_recommendations(result, &self.targets, &job.related_charts)
                .into_iter()
                .filter(|d| !d.is_empty())
                .collect();
        let units: Vec<&str> = result.units.iter().map(|u| u.unit.as_str()).collect();
        let req = GenerateRequest {
            prompt: improvement::improvement_prompt(
                &document.text,
                &units,
                &digests,
                &job.related_charts,
            ),
            system: Some(improvement::IMPROVEMENT_SYSTEM_PROMPT.to_string()),
            max_tokens: self.settings.improvement_max_tokens,
            temperature: self.settings.improvement_temperature,
            prompt_caching: self.settings.prompt_caching,
        };
        let outcome = cached_generate(
            self.client.as_ref(),
            &self.cache,
            &self.usage,
            CacheKind::Improvement,
            &req,
            &self.settings.call,
        )
        .await
        .with_context(|| format!("chart improvement failed for {}", document.name))?;

        let (value, _) = recovery::recover_object(&outcome.text)
            .with_context(|| format!("chart improvement for {} returned no object", document.name))?;
        let response: ImprovementResponse = serde_json::from_value(value)
            .with_context(|| format!("chart improvement for {} has an unexpected shape", document.name))?;
        if response.improved_chart.trim().is_empty() {
            anyhow::bail!("chart improvement for {} returned an empty chart", document.name);
        }

        let (improved_chart, markers_added) = improvement::ensure_physician_input_markers(
            &response.improved_chart,
            &response.user_input_required,
        );
        let leaked = improvement::named_targets(&improved_chart, &self.targets);
        if !leaked.is_empty() {
            tracing::warn!(
                event = "improved_chart_names_target",
                document = %document.name,
                targets = ?leaked,
            );
        }
        tracing::info!(
            event = "chart_improved",
            document = %document.name,
            recommendations = digests.len(),
            edits = response.improvements.len(),
            inputs_required = response.user_input_required.len(),
            markers_added,
            cached = outcome.cached,
        );
        Ok(ChartImprovement {
            document: document.name.clone(),
            original_chart_chars: document.text.chars().count(),
            improved_chart_chars: improved_chart.chars().count(),
            improved_chart,
            improvements: response.improvements,
            user_input_required: response.user_input_required,
            recommendations: response.recommendations,
            compliance_impact: response.compliance_impact,
            markers_added,
            usage: outcome.usage,
            cached: outcome.cached,
        })
    }

    async fn retrieve(
        &self,
        id: &TargetId,
        unit: &EvaluationUnit,
        document: &Document,
    ) -> anyhow::Result<TargetContext> {
        let s = &self.settings;
        let code_based = !unit.codes.is_empty();
        let hits = if code_based {
            tokio::time::timeout(s.retrieval_timeout, self.retriever.search_by_codes(id, &unit.codes))
                .await
                .context("guideline retrieval timed out")??
        } else {
            let query = format!(
                "{}\n\nChart evidence:\n{}",
                unit.name,
                document.window_around(&unit.name, s.chart_window_chars)
            );
            tokio::time::timeout(
                s.retrieval_timeout,
                self.retriever.search_semantic(id, &query, s.top_k),
            )
            .await
            .context("guideline retrieval timed out")??
        };
        let budget = s.max_context_chars / self.targets.len().max(1);
        let mut ctx = build_context(id, &unit.name, &hits, budget, s.min_relevance_score);
        ctx.code_based = code_based;
        tracing::debug!(
            event = "guidelines_retrieved",
            target = %id,
            unit = %unit.name,
            code_based,
            hits = ctx.hits,
            max_score = ctx.max_score,
        );
        Ok(ctx)
    }

    /// Runs one unit to a terminal state. Never fails: every failure is
    /// turned into verdicts.
    pub async fn evaluate_unit(
        &self,
        unit: &EvaluationUnit,
        document: &Document,
        numbered_chart: &str,
    ) -> UnitReport {
        let mut progress = Progress::new(&unit.name);
        let targets = self.targets.as_ref();

        progress.advance(UnitState::RetrievingContext);
        let mut settled: BTreeMap<TargetId, TargetVerdict> = BTreeMap::new();
        let mut contexts: Vec<(TargetId, TargetContext)> = Vec::new();
        for id in targets.ids() {
            let name = targets.display_name(id);
            match self.retrieve(id, unit, document).await {
                Ok(ctx) if !ctx.is_empty() => contexts.push((id.clone(), ctx)),
                Ok(ctx) => {
                    settled.insert(id.clone(), verdict::general(id, name, &unit.name, &ctx));
                }
                Err(e) => {
                    tracing::warn!(
                        event = "retrieval_failed",
                        target = %id,
                        unit = %unit.name,
                        error = %e,
                    );
                    settled.insert(
                        id.clone(),
                        verdict::general_after_retrieval_error(
                            id,
                            name,
                            &unit.name,
                            &format!("{:#}", e),
                        ),
                    );
                }
            }
        }

        if contexts.is_empty() {
            progress.advance(UnitState::Done);
            return self.finish(unit, settled, progress.state, 0, false, None);
        }

        progress.advance(UnitState::AwaitingModel);
        let ctx_refs: Vec<(&TargetId, &TargetContext)> =
            contexts.iter().map(|(id, c)| (id, c)).collect();
        let req = GenerateRequest {
            prompt: prompt::evaluation_prompt(unit, numbered_chart, targets, &ctx_refs),
            system: Some(prompt::EVALUATION_SYSTEM_PROMPT.to_string()),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            prompt_caching: self.settings.prompt_caching,
        };
        let outcome = match cached_generate(
            self.client.as_ref(),
            &self.cache,
            &self.usage,
            CacheKind::Evaluation,
            &req,
            &self.settings.call,
        )
        .await
        {
            Ok(o) => o,
            Err(failure) => {
                progress.advance(UnitState::DoneWithError);
                tracing::warn!(
                    event = "unit_failed",
                    unit = %unit.name,
                    attempts = failure.attempts,
                    error = %failure.error,
                );
                return self.failed_unit(
                    &unit.name,
                    &failure.error.to_string(),
                    failure.attempts,
                    false,
                    Some(contexts.as_slice()),
                );
            }
        };

        progress.advance(UnitState::Parsing);
        let expected: Vec<TargetId> = contexts.iter().map(|(id, _)| id.clone()).collect();
        let recovered = recovery::recover_for_targets(&outcome.text, targets, &expected);
        if recovered.strategy.is_none() {
            progress.advance(UnitState::DoneWithError);
            let reason = crate::errors::RecoveryFailure::NoCandidate.to_string();
            tracing::warn!(event = "unit_failed", unit = %unit.name, error = %reason);
            return self.failed_unit(
                &unit.name,
                &reason,
                outcome.attempts,
                outcome.cached,
                Some(contexts.as_slice()),
            );
        }

        for (id, ctx) in &contexts {
            let name = targets.display_name(id);
            let built = match recovered.results.get(id) {
                Some(Ok(value)) => verdict::from_model(id, name, &unit.name, value, ctx),
                Some(Err(f)) => Err(f.clone()),
                None => Err(crate::errors::RecoveryFailure::TargetMissing(id.to_string())),
            };
            let v = built.unwrap_or_else(|f| {
                tracing::warn!(event = "target_unrecovered", target = %id, unit = %unit.name, error = %f);
                verdict::error(id, name, &unit.name, &f.to_string(), Some(ctx))
            });
            settled.insert(id.clone(), v);
        }

        progress.advance(UnitState::Done);
        self.finish(unit, settled, progress.state, outcome.attempts, outcome.cached, None)
    }

    fn finish(
        &self,
        unit: &EvaluationUnit,
        mut settled: BTreeMap<TargetId, TargetVerdict>,
        state: UnitState,
        attempts: u32,
        cached: bool,
        error: Option<String>,
    ) -> UnitReport {
        let verdicts = self
            .targets
            .ids()
            .map(|id| {
                settled.remove(id).unwrap_or_else(|| {
                    verdict::error(
                        id,
                        self.targets.display_name(id),
                        &unit.name,
                        "No result in model response",
                        None,
                    )
                })
            })
            .collect();
        UnitReport {
            verdicts,
            outcome: UnitOutcome {
                unit: unit.name.clone(),
                state,
                attempts,
                cached,
                error,
            },
        }
    }

    fn failed_unit(
        &self,
        unit: &str,
        reason: &str,
        attempts: u32,
        cached: bool,
        contexts: Option<&[(TargetId, TargetContext)]>,
    ) -> UnitReport {
        let verdicts = self
            .targets
            .ids()
            .map(|id| {
                let ctx = contexts.and_then(|cs| cs.iter().find(|(c, _)| c == id).map(|(_, c)| c));
                verdict::error(id, self.targets.display_name(id), unit, reason, ctx)
            })
            .collect();
        UnitReport {
            verdicts,
            outcome: UnitOutcome {
                unit: unit.to_string(),
                state: UnitState::DoneWithError,
                attempts,
                cached,
                error: Some(reason.to_string()),
            },
        }
    }
}
