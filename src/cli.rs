use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "scriptsplit",
    version,
    about = "Split combined exam scans into per-student documents and record attendance"
)]
pub struct Cli {
    /// Directory holding the job table and every test's artifacts.
    #[arg(long, global = true, default_value = ".cache/scriptsplit")]
    pub root: PathBuf,

    /// JSON file overriding pipeline tunables.
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a job and run it in a detached worker (or inline with --wait).
    Start(StartArgs),
    /// Run an already-created job in this process.
    Work(JobArgs),
    Pause(JobArgs),
    Resume(JobArgs),
    Cancel(JobArgs),
    Status(ReportArgs),
    Result(ReportArgs),
    /// List jobs, newest first.
    Jobs(JobsArgs),
    /// Create and run several jobs across a worker pool.
    Batch(BatchArgs),
}

#[derive(Args, Debug, Clone)]
pub struct StartArgs {
    #[arg(long)]
    pub test_id: String,

    #[arg(long)]
    pub document: PathBuf,

    #[arg(long)]
    pub roster: PathBuf,

    #[arg(long, default_value_t = false)]
    pub wait: bool,
}

#[derive(Args, Debug, Clone)]
pub struct JobArgs {
    #[arg(long)]
    pub job_id: String,
}

#[derive(Args, Debug, Clone)]
pub struct ReportArgs {
    #[arg(long)]
    pub job_id: String,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct JobsArgs {
    #[arg(long)]
    pub test_id: Option<String>,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct BatchArgs {
    /// JSON array of `{"test_id", "document", "roster"}` objects.
    #[arg(long)]
    pub manifest: PathBuf,

    #[arg(long, default_value_t = 2)]
    pub workers: usize,
}
