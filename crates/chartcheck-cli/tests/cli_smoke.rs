use assert_cmd::Command;
use predicates::str::contains;
use std::fs;
use tempfile::TempDir;

fn chartcheck() -> Command {
    let mut cmd = Command::cargo_bin("chartcheck").unwrap();
    cmd.env("CHARTCHECK_LOG", "off");
    cmd
}

#[test]
fn version_prints_package_version() {
    chartcheck()
        .arg("version")
        .assert()
        .success()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn init_writes_config_once() {
    let dir = TempDir::new().unwrap();
    let cfg = dir.path().join("conf/chartcheck.yaml");

    chartcheck()
        .args(["init", "--config"])
        .arg(&cfg)
        .assert()
        .success()
        .stderr(contains("created"));
    assert!(fs::read_to_string(&cfg).unwrap().contains("configVersion: 1"));

    chartcheck()
        .args(["init", "--config"])
        .arg(&cfg)
        .assert()
        .success()
        .stderr(contains("already exists"));
}

#[test]
fn missing_config_exits_with_config_error() {
    let dir = TempDir::new().unwrap();
    chartcheck()
        .args(["evaluate", "--config"])
        .arg(dir.path().join("nope.yaml"))
        .args(["--job", "job.json"])
        .assert()
        .code(2)
        .stderr(contains("failed to read config"));
}

#[test]
fn evaluate_without_guidelines_uses_general_verdicts() {
    let dir = TempDir::new().unwrap();
    let cfg = dir.path().join("chartcheck.yaml");
    let job = dir.path().join("job.json");
    let out = dir.path().join("result.json");

    chartcheck().args(["init", "--config"]).arg(&cfg).assert().success();
    fs::write(
        &job,
        r#"{
  "document": {"name": "chart-001", "text": "Left knee pain for 10 weeks.\nPlan: arthroscopy."},
  "units": [{"name": "Knee arthroscopy", "codes": ["29881"]}]
}"#,
    )
    .unwrap();

    chartcheck()
        .args(["evaluate", "--config"])
        .arg(&cfg)
        .arg("--job")
        .arg(&job)
        .arg("--out")
        .arg(&out)
        .assert()
        .code(0)
        .stderr(contains("Results: total=3"));

    let result: serde_json::Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(result["usage"]["calls"], 0);
    assert_eq!(result["verdicts"]["uhc"][0]["source"], "general");
}

const KNEE_JOB: &str = r#"{
  "document": {"name": "chart-001", "text": "Left knee pain for 10 weeks.\nPlan: arthroscopy."},
  "units": [{"name": "Knee arthroscopy", "codes": ["29881"]}]
}"#;

#[test]
fn corrupt_cache_file_does_not_stop_evaluation() {
    let dir = TempDir::new().unwrap();
    let cfg = dir.path().join("chartcheck.yaml");
    let job = dir.path().join("job.json");
    chartcheck().args(["init", "--config"]).arg(&cfg).assert().success();
    fs::create_dir_all(dir.path().join(".chartcheck")).unwrap();
    fs::write(dir.path().join(".chartcheck/cache.db"), b"garbage ".repeat(600)).unwrap();
    fs::write(&job, KNEE_JOB).unwrap();

    chartcheck()
        .args(["evaluate", "--config"])
        .arg(&cfg)
        .arg("--job")
        .arg(&job)
        .assert()
        .code(0)
        .stderr(contains("Results: total=3"));
}

#[test]
fn unreachable_model_fails_improvement_but_keeps_the_evaluation() {
    let dir = TempDir::new().unwrap();
    let cfg = dir.path().join("chartcheck.yaml");
    let job = dir.path().join("job.json");
    let out = dir.path().join("result.json");
    let improved = dir.path().join("improved.json");
    chartcheck().args(["init", "--config"]).arg(&cfg).assert().success();
    fs::write(&job, KNEE_JOB).unwrap();

    chartcheck()
        .env("CHARTCHECK_ENDPOINT", "http://127.0.0.1:9")
        .env("CHARTCHECK_API_KEY", "test")
        .args(["evaluate", "--config"])
        .arg(&cfg)
        .arg("--job")
        .arg(&job)
        .arg("--out")
        .arg(&out)
        .arg("--improve")
        .arg(&improved)
        .assert()
        .code(1)
        .stderr(contains("Results: total=3"))
        .stderr(contains("chart improvement failed"));

    assert!(out.exists());
    assert!(!improved.exists());
}

#[test]
fn batch_reports_unreadable_documents_and_finishes_the_rest() {
    let dir = TempDir::new().unwrap();
    let cfg = dir.path().join("chartcheck.yaml");
    let jobs = dir.path().join("jobs");
    let out = dir.path().join("batch.json");
    chartcheck().args(["init", "--config"]).arg(&cfg).assert().success();
    fs::create_dir_all(&jobs).unwrap();
    fs::write(jobs.join("a-knee.json"), KNEE_JOB).unwrap();
    fs::write(jobs.join("b-broken.json"), "{ not json").unwrap();
    fs::write(jobs.join("notes.txt"), "ignored").unwrap();

    chartcheck()
        .args(["evaluate", "--config"])
        .arg(&cfg)
        .arg("--jobs")
        .arg(&jobs)
        .arg("--out")
        .arg(&out)
        .assert()
        .code(1)
        .stderr(contains("FAILED [b-broken.json]"))
        .stderr(contains("chart-001: units=1"))
        .stderr(contains("Results: total=3"));

    let batch: serde_json::Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    let docs = batch["documents"].as_array().unwrap();
    assert_eq!(docs.len(), 2);
    assert_eq!(docs[0]["status"], "completed");
    assert_eq!(docs[0]["document"], "chart-001");
    assert_eq!(docs[1]["status"], "failed");
    assert_eq!(batch["summary"]["overall"]["total"], 3);
}

#[test]
fn cache_commands_work_on_fresh_store() {
    let dir = TempDir::new().unwrap();
    let cfg = dir.path().join("chartcheck.yaml");
    chartcheck().args(["init", "--config"]).arg(&cfg).assert().success();

    chartcheck()
        .args(["cache", "--config"])
        .arg(&cfg)
        .arg("stats")
        .assert()
        .success()
        .stderr(contains("entries: 0"));

    chartcheck()
        .args(["cache", "--config"])
        .arg(&cfg)
        .arg("cleanup")
        .assert()
        .success()
        .stderr(contains("removed 0 expired entries"));
    assert!(dir.path().join(".chartcheck/cache.db").exists());
}
