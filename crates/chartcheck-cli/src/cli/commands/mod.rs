use super::args::{CacheArgs, CacheSub, Command, EvaluateArgs, InitArgs};
use anyhow::Context;
use chartcheck_core::cache::CacheStore;
use chartcheck_core::config::{load_config, write_sample_config, AppConfig};
use chartcheck_core::engine::{EvaluationOrchestrator, OrchestratorSettings};
use chartcheck_core::model::EvaluationJob;
use chartcheck_core::providers::{HttpTransport, ModelClient, ModelGateway};
use chartcheck_core::report::console;
use chartcheck_core::retrieval::{GuidelineRetriever, JsonGuidelineIndex};
use chartcheck_core::usage::UsageAccumulator;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const EVALUATION_ERRORS: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
}

pub async fn dispatch(cli: super::args::Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Evaluate(args) => cmd_evaluate(args).await,
        Command::Cache(args) => cmd_cache(args),
        Command::Init(args) => cmd_init(args),
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_init(args: InitArgs) -> anyhow::Result<i32> {
    if args.config.exists() {
        eprintln!("note: {} already exists", args.config.display());
        return Ok(exit_codes::OK);
    }
    if let Some(parent) = args.config.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_sample_config(&args.config)?;
    eprintln!("created {}", args.config.display());
    Ok(exit_codes::OK)
}

fn open_cache(cfg: &AppConfig) -> anyhow::Result<CacheStore> {
    CacheStore::open(&cfg.cache.path, cfg.cache_settings(), cfg.pricing)
}

fn cmd_cache(args: CacheArgs) -> anyhow::Result<i32> {
    let cfg = load_config(&args.config)?;
    let cache = open_cache(&cfg)?;
    match args.cmd {
        CacheSub::Stats => {
            eprintln!("entries: {}", cache.len());
            console::print_cache_stats(&cache.stats());
        }
        CacheSub::Cleanup => {
            let removed = cache.cleanup_expired();
            cache.flush_stats()?;
            eprintln!("removed {} expired entries", removed);
        }
    }
    Ok(exit_codes::OK)
}

async fn cmd_evaluate(args: EvaluateArgs) -> anyhow::Result<i32> {
    let cfg = load_config(&args.config)?;
    let orchestrator = build_orchestrator(&cfg)?;
    match (&args.job, &args.jobs) {
        (_, Some(dir)) => evaluate_batch(&orchestrator, dir, &args).await,
        (Some(path), None) => evaluate_one(&orchestrator, path, &args).await,
        (None, None) => anyhow::bail!("either --job or --jobs is required"),
    }
}

fn read_job(path: &Path, extract: bool) -> anyhow::Result<EvaluationJob> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read job {}", path.display()))?;
    let mut job: EvaluationJob = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse job {}", path.display()))?;
    if extract {
        job.units.clear();
    }
    Ok(job)
}

async fn evaluate_one(
    orchestrator: &EvaluationOrchestrator,
    path: &Path,
    args: &EvaluateArgs,
) -> anyhow::Result<i32> {
    let job = read_job(path, args.extract)?;
    let result = orchestrator.run(&job).await?;
    tracing::info!(
        event = "run_complete",
        document = %result.document,
        units = result.units.len(),
        calls = result.usage.calls,
        cost_usd = result.usage.costs.total_cost,
    );

    console::print_summary(&result);
    if let Some(out) = &args.out {
        console::write_json(out, &result)?;
        eprintln!("wrote {}", out.display());
    }

    let mut failed = result.has_errors();
    if let Some(improve_out) = &args.improve {
        match orchestrator.improve_chart(&job, &result).await {
            Ok(improvement) => {
                console::print_improvement(&improvement);
                console::write_json(improve_out, &improvement)?;
                eprintln!("wrote {}", improve_out.display());
            }
            Err(e) => {
                tracing::error!(event = "improvement_failed", document = %result.document, error = %format!("{:#}", e));
                eprintln!("warning: chart improvement failed: {:#}", e);
                failed = true;
            }
        }
    }
    Ok(decide_exit_code(failed))
}

async fn evaluate_batch(
    orchestrator: &EvaluationOrchestrator,
    dir: &Path,
    args: &EvaluateArgs,
) -> anyhow::Result<i32> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read job directory {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();
    if paths.is_empty() {
        eprintln!("warning: no job files in {}", dir.display());
    }

    let mut jobs = Vec::with_capacity(paths.len());
    let mut unreadable = Vec::new();
    for path in &paths {
        match read_job(path, args.extract) {
            Ok(job) => jobs.push(job),
            Err(e) => {
                tracing::error!(
                    event = "document_failed",
                    path = %path.display(),
                    error = %format!("{:#}", e),
                );
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                unreadable.push((name, format!("{:#}", e)));
            }
        }
    }

    let mut batch = orchestrator.run_batch(&jobs).await;
    for (name, error) in unreadable {
        batch.record_failure(name, error);
    }
    tracing::info!(
        event = "batch_complete",
        documents = batch.documents.len(),
        failed = batch.failed().count(),
        calls = batch.usage.calls,
        cost_usd = batch.usage.costs.total_cost,
    );

    console::print_batch_summary(&batch);
    if let Some(out) = &args.out {
        console::write_json(out, &batch)?;
        eprintln!("wrote {}", out.display());
    }
    Ok(decide_exit_code(batch.has_errors()))
}

fn build_orchestrator(cfg: &AppConfig) -> anyhow::Result<EvaluationOrchestrator> {
    let targets = Arc::new(cfg.target_set()?);
    let retriever: Arc<dyn GuidelineRetriever> = Arc::new(JsonGuidelineIndex::load(
        &targets,
        &cfg.retrieval.guidelines,
    )?);
    let transport = HttpTransport::new(cfg.http_settings());
    let client: Arc<dyn ModelClient> = Arc::new(ModelGateway::new(
        transport,
        cfg.gateway_settings(),
        cfg.pricing,
    ));
    let settings: OrchestratorSettings = cfg.orchestrator_settings();

    Ok(EvaluationOrchestrator::new(
        targets,
        client,
        retriever,
        CacheStore::open_or_memory(&cfg.cache.path, cfg.cache_settings(), cfg.pricing)?,
        UsageAccumulator::new(cfg.pricing),
        settings,
    ))
}

fn decide_exit_code(has_errors: bool) -> i32 {
    if has_errors {
        exit_codes::EVALUATION_ERRORS
    } else {
        exit_codes::OK
    }
}
