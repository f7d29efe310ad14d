mod common;

use chartcheck_core::document::{Document, RelatedChart};
use chartcheck_core::errors::GatewayError;
use chartcheck_core::model::{
    Decision, EvaluationJob, EvaluationUnit, GuidelineStatus, UnitState, VerdictSource,
};
use chartcheck_core::providers::ModelClient;
use chartcheck_core::retrieval::GuidelineRetriever;
use common::{answer, open_cache, orchestrator, unit_in_prompt, ScriptedClient, StaticRetriever};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::tempdir;

const CHART: &str = "Patient: J. Doe, 54\n\
Left knee pain for 10 weeks despite physical therapy.\n\
Exam: medial joint line tenderness, positive McMurray.\n\
Plan: knee arthroscopy with partial meniscectomy; MRI knee to confirm.";

fn job() -> EvaluationJob {
    EvaluationJob {
        document: Document::new("chart-001", CHART),
        units: vec![
            EvaluationUnit::new("Knee arthroscopy").with_codes(["29881"]),
            EvaluationUnit::new("MRI knee"),
        ],
        related_charts: vec![],
    }
}

fn assert_complete(result: &chartcheck_core::model::AggregateResult, units: &[&str]) {
    assert_eq!(result.verdicts.len(), 3);
    for list in result.verdicts.values() {
        let mut seen: Vec<&str> = list.iter().map(|v| v.unit.as_str()).collect();
        seen.sort_unstable();
        let mut want = units.to_vec();
        want.sort_unstable();
        assert_eq!(seen, want, "exactly one verdict per unit for every target");
    }
}

#[tokio::test]
async fn second_identical_run_is_served_from_cache() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.db");

    let client = Arc::new(ScriptedClient::all_sufficient());
    let retriever = Arc::new(StaticRetriever::default());
    let first = orchestrator(client.clone(), retriever.clone(), open_cache(&path));
    let r1 = first.run(&job()).await.unwrap();

    assert_eq!(client.calls(), 2);
    assert_complete(&r1, &["Knee arthroscopy", "MRI knee"]);
    assert_eq!(r1.verdicts.values().map(Vec::len).sum::<usize>(), 6);
    assert_eq!(first.cache().len(), 2);
    assert!(!r1.has_errors());
    assert_eq!(r1.usage.calls, 2);
    assert_eq!(retriever.code_queries.load(Ordering::SeqCst), 3);
    assert_eq!(retriever.semantic_queries.load(Ordering::SeqCst), 3);
    assert_eq!(r1.summary.overall.sufficient, 6);

    let client2 = Arc::new(ScriptedClient::new(|_| {
        Err(GatewayError::Transport("must not be called".into()))
    }));
    let second = orchestrator(client2.clone(), retriever, open_cache(&path));
    let r2 = second.run(&job()).await.unwrap();

    assert_eq!(client2.calls(), 0);
    assert_eq!(
        serde_json::to_string(&r1.verdicts).unwrap(),
        serde_json::to_string(&r2.verdicts).unwrap()
    );
    assert_eq!(r2.usage.calls, 0);
    assert!(r2.units.iter().all(|u| u.cached && u.state == UnitState::Done));
    let hits = r2.cache.kind(chartcheck_core::cache::CacheKind::Evaluation).hits;
    assert_eq!(hits, 2);
    assert!(r2.cache.savings_usd > 0.0);
}

#[tokio::test]
async fn target_without_guidelines_gets_general_verdict() {
    let dir = tempdir().unwrap();
    let client = Arc::new(ScriptedClient::new(|req| {
        assert!(!req.prompt.contains("\"anthem\""));
        Ok(answer(&["cigna", "uhc"], "Insufficient"))
    }));
    let retriever = Arc::new(StaticRetriever {
        empty: ["anthem".to_string()].into_iter().collect(),
        ..Default::default()
    });
    let orch = orchestrator(client.clone(), retriever, open_cache(&dir.path().join("c.db")));
    let r = orch.run(&job()).await.unwrap();

    assert_complete(&r, &["Knee arthroscopy", "MRI knee"]);
    assert!(!r.has_errors());
    for v in &r.verdicts[orch.targets().resolve("anthem").unwrap()] {
        assert_eq!(v.source, VerdictSource::General);
        assert_eq!(v.guideline_availability.status, GuidelineStatus::GeneralFallback);
    }
    let uhc = r.verdict("uhc", "MRI knee").unwrap();
    assert_eq!(uhc.decision, Decision::Insufficient);
    assert_eq!(uhc.source, VerdictSource::Model);
    assert_eq!(uhc.chart_references, vec!["L002".to_string()]);
}

#[tokio::test]
async fn no_guidelines_anywhere_skips_the_model() {
    let dir = tempdir().unwrap();
    let client = Arc::new(ScriptedClient::all_sufficient());
    let retriever = Arc::new(StaticRetriever {
        empty: ["anthem", "cigna"].iter().map(|s| s.to_string()).collect(),
        failing: ["uhc".to_string()].into_iter().collect(),
        ..Default::default()
    });
    let orch = orchestrator(client.clone(), retriever, open_cache(&dir.path().join("c.db")));
    let r = orch.run(&job()).await.unwrap();

    assert_eq!(client.calls(), 0);
    assert_complete(&r, &["Knee arthroscopy", "MRI knee"]);
    let uhc = r.verdict("uhc", "Knee arthroscopy").unwrap();
    assert_eq!(uhc.guideline_availability.status, GuidelineStatus::Error);
    assert!(r.units.iter().all(|u| u.state == UnitState::Done));
}

#[tokio::test]
async fn missing_target_key_fails_only_that_target() {
    let dir = tempdir().unwrap();
    let client = Arc::new(ScriptedClient::new(|_| {
        Ok(format!("Here you go:\n{}", answer(&["cigna", "anthem"], "Sufficient")))
    }));
    let orch = orchestrator(
        client,
        Arc::new(StaticRetriever::default()),
        open_cache(&dir.path().join("c.db")),
    );
    let r = orch.run(&job()).await.unwrap();

    assert_complete(&r, &["Knee arthroscopy", "MRI knee"]);
    let uhc = r.verdict("uhc", "Knee arthroscopy").unwrap();
    assert!(uhc.is_error());
    assert_eq!(uhc.error.as_deref(), Some("Missing 'uhc' in response"));
    assert!(!r.verdict("cigna", "Knee arthroscopy").unwrap().is_error());
    assert_eq!(r.summary.overall.other, 2);
}

#[tokio::test]
async fn unparseable_answer_fails_the_unit() {
    let dir = tempdir().unwrap();
    let client = Arc::new(ScriptedClient::new(|req| {
        if unit_in_prompt(&req.prompt) == "MRI knee" {
            Ok("I am unable to evaluate this chart.".into())
        } else {
            Ok(answer(&["cigna", "uhc", "anthem"], "Sufficient"))
        }
    }));
    let orch = orchestrator(
        client,
        Arc::new(StaticRetriever::default()),
        open_cache(&dir.path().join("c.db")),
    );
    let r = orch.run(&job()).await.unwrap();

    assert_complete(&r, &["Knee arthroscopy", "MRI knee"]);
    let failed = r.units.iter().find(|u| u.unit == "MRI knee").unwrap();
    assert_eq!(failed.state, UnitState::DoneWithError);
    for list in r.verdicts.values() {
        let v = list.iter().find(|v| v.unit == "MRI knee").unwrap();
        assert_eq!(v.error.as_deref(), Some("No JSON object found in response"));
    }
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let dir = tempdir().unwrap();
    let failures = Arc::new(AtomicUsize::new(0));
    let f = failures.clone();
    let client = Arc::new(ScriptedClient::new(move |_| {
        if f.fetch_add(1, Ordering::SeqCst) < 2 {
            Err(GatewayError::Transient("throttled".into()))
        } else {
            Ok(answer(&["cigna", "uhc", "anthem"], "Sufficient"))
        }
    }));
    let job = EvaluationJob {
        units: vec![EvaluationUnit::new("Knee arthroscopy")],
        ..job()
    };
    let orch = orchestrator(
        client.clone() as Arc<dyn ModelClient>,
        Arc::new(StaticRetriever::default()) as Arc<dyn GuidelineRetriever>,
        open_cache(&dir.path().join("c.db")),
    );
    let r = orch.run(&job).await.unwrap();

    assert_eq!(client.calls(), 3);
    assert!(!r.has_errors());
    assert_eq!(r.units[0].attempts, 3);
}

#[tokio::test]
async fn related_charts_annotate_but_never_replace() {
    let dir = tempdir().unwrap();
    let mut job = job();
    job.related_charts = vec![RelatedChart {
        source: "radiology-2024-03".into(),
        text: "MRI left knee: complex tear of the medial meniscus.".into(),
    }];
    let orch = orchestrator(
        Arc::new(ScriptedClient::all_sufficient()),
        Arc::new(StaticRetriever::default()),
        open_cache(&dir.path().join("c.db")),
    );
    let r = orch.run(&job).await.unwrap();

    let v = r.verdict("cigna", "Knee arthroscopy").unwrap();
    assert_eq!(v.decision, Decision::Sufficient);
    let imaging = v.requirements.iter().find(|q| q.id == "imaging").unwrap();
    assert_eq!(imaging.suppressed_by.as_deref(), Some("radiology-2024-03 (imaging)"));
    let met = v.requirements.iter().find(|q| q.id == "duration").unwrap();
    assert!(met.suppressed_by.is_none());
    assert!(v.recommendations.documentation_gaps[0].suppressed_by.is_some());
}
