use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use uuid::Uuid;

use super::ControlError;
use super::store::JobStore;
use crate::model::{Job, JobResultPaths, JobState, JobStatusReport};
use crate::settings::PipelineSettings;

pub const JOB_DB_FILE: &str = "jobs.sqlite";

pub fn job_db_path(root: &Path) -> PathBuf {
    root.join(JOB_DB_FILE)
}

/// The test id names the artifact directory, so it must be a single safe
/// path component.
pub fn validate_test_id(test_id: &str) -> Result<()> {
    if test_id.is_empty() || test_id == "." || test_id == ".." {
        bail!("test id must be a non-empty name, got '{test_id}'");
    }
    if let Some(bad) = test_id
        .chars()
        .find(|character| !(character.is_ascii_alphanumeric() || "._-".contains(*character)))
    {
        bail!("test id '{test_id}' contains unsupported character '{bad}'");
    }
    Ok(())
}

/// Entry point for every job operation a caller can invoke.
#[derive(Debug, Clone)]
pub struct JobService {
    root: PathBuf,
    settings: PipelineSettings,
}

impl JobService {
    pub fn new(root: &Path, settings: PipelineSettings) -> Self {
        Self {
            root: root.to_path_buf(),
            settings,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn open_store(&self) -> Result<JobStore> {
        JobStore::open(&job_db_path(&self.root))
    }

    /// Registers a new RUNNING job. The inputs are only recorded here; a
    /// missing document or roster fails the job once a worker picks it up.
    pub fn create(&self, test_id: &str, document: &Path, roster: &Path) -> Result<Job> {
        validate_test_id(test_id)?;

        let job_id = Uuid::new_v4().to_string();
        let document = absolute_or_given(document);
        let roster = absolute_or_given(roster);

        let mut store = self.open_store()?;
        store.create(&job_id, test_id, &document, &roster)
    }

    pub fn pause(&self, job_id: &str) -> Result<Job, ControlError> {
        self.store_for_control()?.pause(job_id)
    }

    pub fn resume(&self, job_id: &str) -> Result<Job, ControlError> {
        self.store_for_control()?.resume(job_id)
    }

    pub fn cancel(&self, job_id: &str) -> Result<Job, ControlError> {
        self.store_for_control()?.cancel(job_id)
    }

    pub fn status(&self, job_id: &str) -> Result<JobStatusReport> {
        let mut store = self.open_store()?;
        store
            .fail_stale(self.settings.control.stale_after())
            .context("failed to sweep stale jobs")?;
        let job = store.require(job_id)?;
        Ok(JobStatusReport::from(&job))
    }

    pub fn result(&self, job_id: &str) -> Result<JobResultPaths, ControlError> {
        let store = self.store_for_control()?;
        let job = store.require(job_id)?;
        if job.state != JobState::Completed {
            return Err(ControlError::NotCompleted {
                job_id: job.job_id,
                state: job.state,
            });
        }

        Ok(JobResultPaths {
            job_id: job.job_id,
            presence_table_path: job.presence_table_path,
            bundle_path: job.bundle_path,
        })
    }

    pub fn list(&self, test_id: Option<&str>) -> Result<Vec<Job>> {
        let mut store = self.open_store()?;
        store
            .fail_stale(self.settings.control.stale_after())
            .context("failed to sweep stale jobs")?;
        Ok(store.list(test_id)?)
    }

    fn store_for_control(&self) -> Result<JobStore, ControlError> {
        JobStore::open(&job_db_path(&self.root)).map_err(ControlError::Unavailable)
    }
}

fn absolute_or_given(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}
