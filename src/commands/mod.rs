pub mod batch;
pub mod control;
pub mod start;
pub mod status;
pub mod work;

use std::path::Path;

use anyhow::Result;

use crate::jobs::JobService;
use crate::settings::PipelineSettings;

pub fn job_service(root: &Path, settings_path: Option<&Path>) -> Result<JobService> {
    let settings = PipelineSettings::load(settings_path)?;
    Ok(JobService::new(root, settings))
}
