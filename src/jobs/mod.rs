//! Persisted job state machine shared by the command layer and pipeline
//! workers.
//!
//! Every status change is a read-modify-write inside an immediate SQLite
//! transaction, so concurrent workers and control calls never need an
//! in-process lock.

use std::fmt;

use thiserror::Error;

use crate::model::JobState;

mod control;
mod service;
mod store;
#[cfg(test)]
mod tests;

pub use control::{CheckpointOutcome, JobControl, StoreControl};
pub use service::JobService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
    Complete,
    Fail,
}

impl ControlAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Complete => "complete",
            Self::Fail => "fail",
        }
    }

    /// Target state for this action, or `None` when the transition is not
    /// allowed from `from`.
    pub fn next_state(self, from: JobState) -> Option<JobState> {
        match (self, from) {
            (Self::Pause, JobState::Running) => Some(JobState::Paused),
            (Self::Resume, JobState::Paused) => Some(JobState::Running),
            (Self::Cancel, JobState::Running | JobState::Paused) => Some(JobState::Cancelled),
            // A pause that lands after the last checkpoint cannot be honoured.
            (Self::Complete, JobState::Running | JobState::Paused) => Some(JobState::Completed),
            (Self::Fail, JobState::Running | JobState::Paused) => Some(JobState::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unknown job: {0}")]
    UnknownJob(String),
    #[error("cannot {action} job {job_id}: job is {state}")]
    InvalidTransition {
        job_id: String,
        action: ControlAction,
        state: JobState,
    },
    #[error("job {job_id} is {state}; results are only available once COMPLETED")]
    NotCompleted { job_id: String, state: JobState },
    #[error("job store error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("job store unavailable: {0:#}")]
    Unavailable(anyhow::Error),
}
