mod common;

use chartcheck_core::document::Document;
use chartcheck_core::errors::GatewayError;
use chartcheck_core::engine::prompt::EXTRACTION_SYSTEM_PROMPT;
use chartcheck_core::model::{DocumentOutcome, EvaluationJob, EvaluationUnit, UnitState};
use common::{answer, open_cache, orchestrator, unit_in_prompt, ScriptedClient, StaticRetriever};
use std::sync::Arc;
use tempfile::tempdir;

fn five_units() -> EvaluationJob {
    EvaluationJob {
        document: Document::new(
            "chart-005",
            "Shoulder pain for 4 months.\nFailed NSAIDs and physical therapy.\nMRI shows a full-thickness tear.",
        ),
        units: (1..=5)
            .map(|i| EvaluationUnit::new(format!("Procedure {}", i)))
            .collect(),
        related_charts: vec![],
    }
}

#[tokio::test]
async fn one_failing_unit_leaves_the_others_intact() {
    let dir = tempdir().unwrap();
    let client = Arc::new(ScriptedClient::new(|req| {
        if unit_in_prompt(&req.prompt) == "Procedure 3" {
            Err(GatewayError::Rejected {
                status: 400,
                message: "malformed request".into(),
            })
        } else {
            Ok(answer(&["cigna", "uhc", "anthem"], "Insufficient"))
        }
    }));
    let orch = orchestrator(
        client.clone(),
        Arc::new(StaticRetriever::default()),
        open_cache(&dir.path().join("c.db")),
    );
    let r = orch.run(&five_units()).await.unwrap();

    // Rejections are not retried.
    assert_eq!(client.calls(), 5);
    assert_eq!(r.units.len(), 5);
    for u in &r.units {
        if u.unit == "Procedure 3" {
            assert_eq!(u.state, UnitState::DoneWithError);
            assert!(u.error.as_deref().unwrap().contains("400"));
            assert_eq!(u.attempts, 1, "a rejection is attempted once");
        } else {
            assert_eq!(u.state, UnitState::Done, "{} should complete", u.unit);
            assert!(u.error.is_none());
        }
    }

    for (target, list) in &r.verdicts {
        assert_eq!(list.len(), 5, "{} has one verdict per unit", target);
        for v in list {
            assert_eq!(v.is_error(), v.unit == "Procedure 3");
        }
    }
    assert_eq!(r.summary.overall.other, 3);
    assert_eq!(r.summary.overall.insufficient, 12);
    assert!(r.has_errors());
}

#[tokio::test]
async fn unit_order_is_preserved_under_parallelism() {
    let dir = tempdir().unwrap();
    let orch = orchestrator(
        Arc::new(ScriptedClient::all_sufficient()),
        Arc::new(StaticRetriever::default()),
        open_cache(&dir.path().join("c.db")),
    );
    let r = orch.run(&five_units()).await.unwrap();
    let names: Vec<&str> = r.units.iter().map(|u| u.unit.as_str()).collect();
    assert_eq!(
        names,
        vec!["Procedure 1", "Procedure 2", "Procedure 3", "Procedure 4", "Procedure 5"]
    );
}

fn two_unit_job(name: &str) -> EvaluationJob {
    EvaluationJob {
        document: Document::new(
            name,
            format!("Chart {}.\nKnee pain for 10 weeks.\nPlan: arthroscopy and MRI.", name),
        ),
        units: vec![EvaluationUnit::new("Knee arthroscopy"), EvaluationUnit::new("MRI knee")],
        related_charts: vec![],
    }
}

#[tokio::test]
async fn one_failing_document_leaves_the_batch_intact() {
    let dir = tempdir().unwrap();
    let client = Arc::new(ScriptedClient::new(|req| {
        if req.system.as_deref() == Some(EXTRACTION_SYSTEM_PROMPT) {
            Ok("I could not read this chart.".into())
        } else {
            Ok(answer(&["cigna", "uhc", "anthem"], "Sufficient"))
        }
    }));
    let orch = orchestrator(
        client.clone(),
        Arc::new(StaticRetriever::default()),
        open_cache(&dir.path().join("c.db")),
    );
    let unreadable = EvaluationJob {
        document: Document::new("chart-scan", "illegible"),
        units: vec![],
        related_charts: vec![],
    };
    let jobs = vec![two_unit_job("chart-a"), unreadable, two_unit_job("chart-b")];

    let batch = orch.run_batch(&jobs).await;

    let names: Vec<&str> = batch.documents.iter().map(DocumentOutcome::document).collect();
    assert_eq!(names, vec!["chart-a", "chart-scan", "chart-b"]);

    let failed: Vec<_> = batch.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].0, "chart-scan");
    assert!(failed[0].1.contains("extraction"), "{}", failed[0].1);

    let done: Vec<_> = batch.completed().collect();
    assert_eq!(done.len(), 2);
    for r in &done {
        assert!(!r.has_errors());
        assert_eq!(r.usage.calls, 2, "{} reports its own calls", r.document);
        assert!(r.units.iter().all(|u| u.state == UnitState::Done));
    }

    // Two documents of two units, plus the extraction attempt.
    assert_eq!(client.calls(), 5);
    assert_eq!(batch.usage.calls, 5);
    assert_eq!(batch.summary.overall.total, 12);
    assert_eq!(batch.summary.overall.sufficient, 12);
    assert!(batch.has_errors());
}
