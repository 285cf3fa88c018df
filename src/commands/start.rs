use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StartArgs;
use crate::jobs::JobService;
use crate::pipeline::{Collaborators, run_job};
use crate::util::ensure_directory;

pub fn run(service: &JobService, settings_path: Option<&Path>, args: StartArgs) -> Result<()> {
    let job = service.create(&args.test_id, &args.document, &args.roster)?;
    info!(job_id = %job.job_id, test_id = %job.test_id, "job created");

    if args.wait {
        println!("{}", job.job_id);
        let collaborators = Collaborators::production(service.settings())?;
        let state = run_job(service, &job.job_id, &collaborators)?;
        info!(job_id = %job.job_id, state = %state, "job finished");
        return Ok(());
    }

    match spawn_worker(service, settings_path, &job.test_id, &job.job_id) {
        Ok(log_path) => {
            info!(job_id = %job.job_id, log = %log_path.display(), "worker launched");
        }
        Err(err) => {
            warn!(job_id = %job.job_id, error = %err, "worker launch failed");
            let mut store = service.open_store()?;
            store.fail(&job.job_id, &format!("worker launch failed: {err:#}"))?;
            return Err(err);
        }
    }

    println!("{}", job.job_id);
    Ok(())
}

fn worker_log_path(root: &Path, test_id: &str, job_id: &str) -> PathBuf {
    root.join(test_id).join(format!("worker_{job_id}.log"))
}

/// Re-executes this binary as `work --job-id` with output redirected to a
/// per-job log. The child is not waited on.
fn spawn_worker(
    service: &JobService,
    settings_path: Option<&Path>,
    test_id: &str,
    job_id: &str,
) -> Result<PathBuf> {
    let executable = std::env::current_exe().context("failed to locate current executable")?;
    let root = std::path::absolute(service.root()).unwrap_or_else(|_| service.root().to_path_buf());

    let log_path = worker_log_path(&root, test_id, job_id);
    if let Some(parent) = log_path.parent() {
        ensure_directory(parent)?;
    }
    let log = File::create(&log_path)
        .with_context(|| format!("failed to create {}", log_path.display()))?;
    let log_err = log
        .try_clone()
        .with_context(|| format!("failed to share {}", log_path.display()))?;

    let mut command = Command::new(&executable);
    command.arg("--root").arg(&root);
    if let Some(settings_path) = settings_path {
        let settings_path =
            std::path::absolute(settings_path).unwrap_or_else(|_| settings_path.to_path_buf());
        command.arg("--settings").arg(settings_path);
    }
    command
        .arg("work")
        .arg("--job-id")
        .arg(job_id)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    let child = command
        .spawn()
        .with_context(|| format!("failed to start worker {}", executable.display()))?;

    let mut store = service.open_store()?;
    store.set_worker_pid(job_id, child.id())?;
    drop(child);

    Ok(log_path)
}
