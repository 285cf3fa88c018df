use anyhow::{Context, Result};
use serde::Serialize;

use crate::cli::{JobsArgs, ReportArgs};
use crate::jobs::JobService;

pub fn status(service: &JobService, args: ReportArgs) -> Result<()> {
    let report = service.status(&args.job_id)?;
    if args.json {
        return print_json(&report);
    }

    let eta = report
        .eta_seconds
        .map(|seconds| format!("{seconds}s"))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{} {} {}% eta {}",
        report.job_id, report.state, report.progress_percent, eta
    );
    if let Some(error) = &report.error {
        println!("error: {error}");
    }
    Ok(())
}

pub fn result(service: &JobService, args: ReportArgs) -> Result<()> {
    let paths = service.result(&args.job_id)?;
    if args.json {
        return print_json(&paths);
    }

    println!(
        "presence_table: {}",
        paths.presence_table_path.as_deref().unwrap_or("-")
    );
    println!("bundle: {}", paths.bundle_path.as_deref().unwrap_or("-"));
    Ok(())
}

pub fn jobs(service: &JobService, args: JobsArgs) -> Result<()> {
    let jobs = service.list(args.test_id.as_deref())?;
    if args.json {
        return print_json(&jobs);
    }

    for job in &jobs {
        println!(
            "{}\t{}\t{}\t{}%\t{}",
            job.job_id, job.test_id, job.state, job.progress_percent, job.created_at
        );
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{rendered}");
    Ok(())
}
