use anyhow::{Result, bail};
use tracing::info;

use crate::cli::JobArgs;
use crate::jobs::{ControlAction, JobService};

/// Applies a pause, resume or cancel request. Rejections surface as errors so
/// the process exits non-zero with the state unchanged.
pub fn run(service: &JobService, action: ControlAction, args: JobArgs) -> Result<()> {
    let job = match action {
        ControlAction::Pause => service.pause(&args.job_id)?,
        ControlAction::Resume => service.resume(&args.job_id)?,
        ControlAction::Cancel => service.cancel(&args.job_id)?,
        other => bail!("{other} is not a caller-facing control action"),
    };

    info!(job_id = %job.job_id, action = %action, state = %job.state, "control request accepted");
    println!("{} {}", job.job_id, job.state);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::model::JobState;
    use crate::settings::PipelineSettings;

    #[test]
    fn rejected_transition_is_an_error_and_leaves_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = JobService::new(dir.path(), PipelineSettings::default());
        let job = service
            .create("quiz", Path::new("scan.pdf"), Path::new("roster.csv"))
            .expect("job");
        let args = JobArgs {
            job_id: job.job_id.clone(),
        };

        let err = run(&service, ControlAction::Resume, args.clone()).expect_err("resume rejected");
        assert!(err.to_string().contains("cannot resume"));
        assert_eq!(
            service.status(&job.job_id).expect("status").state,
            JobState::Running
        );

        run(&service, ControlAction::Pause, args.clone()).expect("pause accepted");
        assert!(run(&service, ControlAction::Complete, args).is_err());
        assert_eq!(
            service.status(&job.job_id).expect("status").state,
            JobState::Paused
        );
    }
}
