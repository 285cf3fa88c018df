use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::cli::BatchArgs;
use crate::jobs::JobService;
use crate::model::{Job, JobState};
use crate::pipeline::{Collaborators, run_job};

#[derive(Debug, Clone, Deserialize)]
struct BatchEntry {
    test_id: String,
    document: PathBuf,
    roster: PathBuf,
}

/// Creates one job per manifest entry up front, then drains them with
/// `workers` threads. Each thread owns its collaborators and store handle.
pub fn run(service: &JobService, args: BatchArgs) -> Result<()> {
    if args.workers == 0 {
        bail!("--workers must be at least 1");
    }

    let raw = fs::read(&args.manifest)
        .with_context(|| format!("failed to read {}", args.manifest.display()))?;
    let entries = serde_json::from_slice::<Vec<BatchEntry>>(&raw)
        .with_context(|| format!("failed to parse {}", args.manifest.display()))?;

    let mut jobs = Vec::<Job>::with_capacity(entries.len());
    for entry in &entries {
        let job = service.create(&entry.test_id, &entry.document, &entry.roster)?;
        println!("{}\t{}", job.job_id, job.test_id);
        jobs.push(job);
    }

    let worker_count = args.workers.min(jobs.len()).max(1);
    info!(jobs = jobs.len(), workers = worker_count, "batch started");

    let cursor = AtomicUsize::new(0);
    let completed = AtomicUsize::new(0);
    let unsuccessful = AtomicUsize::new(0);

    thread::scope(|scope| {
        for worker in 0..worker_count {
            let jobs = &jobs;
            let cursor = &cursor;
            let completed = &completed;
            let unsuccessful = &unsuccessful;
            scope.spawn(move || {
                let collaborators = Collaborators::production(service.settings());
                loop {
                    let index = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(job) = jobs.get(index) else {
                        break;
                    };

                    let outcome = match &collaborators {
                        Ok(collaborators) => run_job(service, &job.job_id, collaborators),
                        Err(err) => {
                            let message = format!("worker setup failed: {err:#}");
                            fail_unstarted(service, &job.job_id, &message);
                            Ok(JobState::Failed)
                        }
                    };

                    match outcome {
                        Ok(JobState::Completed) => {
                            completed.fetch_add(1, Ordering::SeqCst);
                            info!(worker, job_id = %job.job_id, "batch job completed");
                        }
                        Ok(state) => {
                            unsuccessful.fetch_add(1, Ordering::SeqCst);
                            warn!(worker, job_id = %job.job_id, state = %state, "batch job did not complete");
                        }
                        Err(err) => {
                            unsuccessful.fetch_add(1, Ordering::SeqCst);
                            error!(worker, job_id = %job.job_id, error = %err, "batch job could not run");
                        }
                    }
                }
            });
        }
    });

    let completed = completed.into_inner();
    let unsuccessful = unsuccessful.into_inner();
    info!(completed, unsuccessful, "batch finished");
    if unsuccessful > 0 {
        bail!("{unsuccessful} of {} batch jobs did not complete", jobs.len());
    }
    Ok(())
}

fn fail_unstarted(service: &JobService, job_id: &str, message: &str) {
    let result = service
        .open_store()
        .and_then(|mut store| Ok(store.fail(job_id, message)?));
    if let Err(err) = result {
        warn!(job_id, error = %err, "could not mark job failed");
    }
}
