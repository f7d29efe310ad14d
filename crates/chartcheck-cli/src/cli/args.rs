use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "chartcheck",
    version,
    about = "Evaluate chart documentation against multiple policy authorities"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    Evaluate(EvaluateArgs),
    Cache(CacheArgs),
    Init(InitArgs),
    Version,
}

#[derive(Parser, Clone)]
pub struct EvaluateArgs {
    #[arg(long, env = "CHARTCHECK_CONFIG", default_value = "chartcheck.yaml")]
    pub config: PathBuf,

    /// evaluation job: {"document": {...}, "units": [...], "related_charts": [...]}
    #[arg(long, conflicts_with = "jobs", required_unless_present = "jobs")]
    pub job: Option<PathBuf>,

    /// directory of job files (*.json), evaluated one document at a time
    #[arg(long)]
    pub jobs: Option<PathBuf>,

    /// write the full result as JSON
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// ignore units in the job and extract them from the document
    #[arg(long)]
    pub extract: bool,

    /// after evaluating, write an improved chart and its edits as JSON
    #[arg(long, conflicts_with = "jobs")]
    pub improve: Option<PathBuf>,
}

#[derive(Parser)]
pub struct CacheArgs {
    #[command(subcommand)]
    pub cmd: CacheSub,
    #[arg(long, env = "CHARTCHECK_CONFIG", default_value = "chartcheck.yaml")]
    pub config: PathBuf,
}

#[derive(Subcommand)]
pub enum CacheSub {
    /// print persisted hit/miss counters and savings
    Stats,
    /// remove entries older than the configured TTL
    Cleanup,
}

#[derive(Parser, Clone)]
pub struct InitArgs {
    #[arg(long, default_value = "chartcheck.yaml")]
    pub config: PathBuf,
}
