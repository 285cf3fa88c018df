use anyhow::Result;
use tracing::info;

use crate::cli::JobArgs;
use crate::jobs::JobService;
use crate::pipeline::{Collaborators, run_job};

pub fn run(service: &JobService, args: JobArgs) -> Result<()> {
    let collaborators = Collaborators::production(service.settings())?;
    let state = run_job(service, &args.job_id, &collaborators)?;
    info!(job_id = %args.job_id, state = %state, "worker finished");
    Ok(())
}
