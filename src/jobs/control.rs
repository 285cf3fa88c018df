use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use tracing::{debug, info};

use super::store::JobStore;
use crate::model::JobState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    Proceed,
    Cancelled,
}

/// Cooperative control seam the pipeline calls between units of work.
pub trait JobControl {
    /// Blocks while the job is paused. Returns `Cancelled` once the job has
    /// been cancelled, in which case the caller must stop without emitting
    /// further output.
    fn checkpoint(&mut self) -> Result<CheckpointOutcome>;

    fn report_progress(&mut self, current: usize, total: usize) -> Result<()>;
}

pub struct StoreControl {
    store: JobStore,
    job_id: String,
    poll_interval: Duration,
    started: Instant,
    paused_for: Duration,
}

impl StoreControl {
    pub fn new(store: JobStore, job_id: &str, poll_interval: Duration) -> Self {
        Self {
            store,
            job_id: job_id.to_string(),
            poll_interval,
            started: Instant::now(),
            paused_for: Duration::ZERO,
        }
    }

    fn active_elapsed(&self) -> Duration {
        self.started.elapsed().saturating_sub(self.paused_for)
    }
}

impl JobControl for StoreControl {
    fn checkpoint(&mut self) -> Result<CheckpointOutcome> {
        let mut pause_started: Option<Instant> = None;

        loop {
            let job = self.store.require(&self.job_id)?;
            match job.state {
                JobState::Running => {
                    if let Some(since) = pause_started {
                        self.paused_for += since.elapsed();
                        info!(job_id = %self.job_id, "job resumed");
                    }
                    self.store.heartbeat(&self.job_id)?;
                    return Ok(CheckpointOutcome::Proceed);
                }
                JobState::Paused => {
                    if pause_started.is_none() {
                        info!(job_id = %self.job_id, "job paused; waiting for resume");
                        pause_started = Some(Instant::now());
                    }
                    self.store.heartbeat(&self.job_id)?;
                    thread::sleep(self.poll_interval);
                }
                JobState::Cancelled => {
                    info!(job_id = %self.job_id, "job cancelled; stopping at checkpoint");
                    return Ok(CheckpointOutcome::Cancelled);
                }
                state @ (JobState::Completed | JobState::Failed) => {
                    bail!(
                        "job {} reached {state} while its worker was still running",
                        self.job_id
                    );
                }
            }
        }
    }

    fn report_progress(&mut self, current: usize, total: usize) -> Result<()> {
        let elapsed = self.active_elapsed();
        let stored = self
            .store
            .report_progress(&self.job_id, current, total, elapsed)?;
        debug!(job_id = %self.job_id, current, total, progress = stored, "progress");
        Ok(())
    }
}

pub fn progress_percent(current: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let current = current.min(total);
    ((current * 100) / total) as u8
}

/// Linear extrapolation from the active (unpaused) time spent so far.
pub fn eta_seconds(current: usize, total: usize, elapsed: Duration) -> Option<u64> {
    if current == 0 || total == 0 {
        return None;
    }
    let current = current.min(total);
    let per_unit = elapsed.as_secs_f64() / current as f64;
    Some((per_unit * (total - current) as f64).round() as u64)
}
