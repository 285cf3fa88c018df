use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use tracing::{info, warn};

use super::control::{eta_seconds, progress_percent};
use super::{ControlAction, ControlError};
use crate::model::{Job, JobState};
use crate::util::{ensure_directory, now_unix_millis, now_utc_string};

const DB_SCHEMA_VERSION: &str = "1";

const JOB_COLUMNS: &str = "job_id, test_id, document_path, roster_path, state, created_at, \
     updated_at, progress_percent, eta_seconds, error, presence_table_path, bundle_path, worker_pid";

pub struct JobStore {
    connection: Connection,
}

impl JobStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            ensure_directory(parent)?;
        }

        let connection = Connection::open(db_path)
            .with_context(|| format!("failed to open {}", db_path.display()))?;
        configure_connection(&connection)?;
        ensure_schema(&connection)?;

        Ok(Self { connection })
    }

    pub fn create(
        &mut self,
        job_id: &str,
        test_id: &str,
        document_path: &str,
        roster_path: &str,
    ) -> Result<Job> {
        let now = now_utc_string();
        let inserted = self
            .connection
            .execute(
                "
                INSERT INTO jobs(job_id, test_id, document_path, roster_path, state, created_at,
                                 updated_at, heartbeat_unix_ms, progress_percent)
                VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, 0)
                ON CONFLICT(job_id) DO NOTHING
                ",
                params![
                    job_id,
                    test_id,
                    document_path,
                    roster_path,
                    JobState::Running.as_str(),
                    now,
                    now_unix_millis(),
                ],
            )
            .with_context(|| format!("failed to insert job {job_id}"))?;

        if inserted == 0 {
            bail!("job {job_id} already exists");
        }

        info!(job_id, test_id, "job created");
        Ok(self.require(job_id)?)
    }

    pub fn get(&self, job_id: &str) -> Result<Option<Job>, ControlError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = ?1");
        let job = self
            .connection
            .query_row(&sql, params![job_id], job_from_row)
            .optional()?;
        Ok(job)
    }

    pub fn require(&self, job_id: &str) -> Result<Job, ControlError> {
        self.get(job_id)?
            .ok_or_else(|| ControlError::UnknownJob(job_id.to_string()))
    }

    pub fn list(&self, test_id: Option<&str>) -> Result<Vec<Job>, ControlError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE (?1 IS NULL OR test_id = ?1) \
             ORDER BY created_at DESC, rowid DESC"
        );
        let mut statement = self.connection.prepare(&sql)?;
        let mut rows = statement.query(params![test_id])?;

        let mut out = Vec::<Job>::new();
        while let Some(row) = rows.next()? {
            out.push(job_from_row(row)?);
        }
        Ok(out)
    }

    pub fn pause(&mut self, job_id: &str) -> Result<Job, ControlError> {
        self.transition(job_id, ControlAction::Pause, |_| Ok(()))
    }

    pub fn resume(&mut self, job_id: &str) -> Result<Job, ControlError> {
        self.transition(job_id, ControlAction::Resume, |_| Ok(()))
    }

    pub fn cancel(&mut self, job_id: &str) -> Result<Job, ControlError> {
        self.transition(job_id, ControlAction::Cancel, |_| Ok(()))
    }

    pub fn complete(
        &mut self,
        job_id: &str,
        presence_table_path: Option<&str>,
        bundle_path: Option<&str>,
    ) -> Result<Job, ControlError> {
        self.transition(job_id, ControlAction::Complete, |tx| {
            tx.execute(
                "
                UPDATE jobs
                SET progress_percent = 100, eta_seconds = 0,
                    presence_table_path = ?2, bundle_path = ?3
                WHERE job_id = ?1
                ",
                params![job_id, presence_table_path, bundle_path],
            )?;
            Ok(())
        })
    }

    pub fn fail(&mut self, job_id: &str, message: &str) -> Result<Job, ControlError> {
        self.transition(job_id, ControlAction::Fail, |tx| {
            tx.execute(
                "
                UPDATE jobs
                SET error = ?2, eta_seconds = NULL, presence_table_path = NULL, bundle_path = NULL
                WHERE job_id = ?1
                ",
                params![job_id, message],
            )?;
            Ok(())
        })
    }

    /// Records progress; the stored percentage never decreases.
    pub fn report_progress(
        &mut self,
        job_id: &str,
        current: usize,
        total: usize,
        elapsed: Duration,
    ) -> Result<u8, ControlError> {
        let percent = progress_percent(current, total);
        let eta = eta_seconds(current, total, elapsed).map(|value| value as i64);

        self.connection.execute(
            "
            UPDATE jobs
            SET progress_percent = MAX(progress_percent, ?2), eta_seconds = ?3,
                heartbeat_unix_ms = ?4, updated_at = ?5
            WHERE job_id = ?1 AND state IN ('RUNNING', 'PAUSED')
            ",
            params![
                job_id,
                i64::from(percent),
                eta,
                now_unix_millis(),
                now_utc_string()
            ],
        )?;

        Ok(self.require(job_id)?.progress_percent)
    }

    pub fn heartbeat(&mut self, job_id: &str) -> Result<(), ControlError> {
        self.connection.execute(
            "UPDATE jobs SET heartbeat_unix_ms = ?2 WHERE job_id = ?1",
            params![job_id, now_unix_millis()],
        )?;
        Ok(())
    }

    pub fn set_worker_pid(&mut self, job_id: &str, pid: u32) -> Result<(), ControlError> {
        self.connection.execute(
            "UPDATE jobs SET worker_pid = ?2, heartbeat_unix_ms = ?3 WHERE job_id = ?1",
            params![job_id, i64::from(pid), now_unix_millis()],
        )?;
        Ok(())
    }

    /// Fails live jobs whose worker has not reported within `stale_after`.
    /// Jobs no worker has claimed yet (`worker_pid` unset) are queued, not
    /// stale.
    pub fn fail_stale(&mut self, stale_after: Duration) -> Result<Vec<String>, ControlError> {
        let cutoff = now_unix_millis() - stale_after.as_millis() as i64;
        let stale_ids = {
            let mut statement = self.connection.prepare(
                "
                SELECT job_id FROM jobs
                WHERE state IN ('RUNNING', 'PAUSED')
                  AND worker_pid IS NOT NULL
                  AND heartbeat_unix_ms < ?1
                ORDER BY job_id
                ",
            )?;
            let mut rows = statement.query(params![cutoff])?;
            let mut ids = Vec::<String>::new();
            while let Some(row) = rows.next()? {
                ids.push(row.get(0)?);
            }
            ids
        };

        let mut failed = Vec::<String>::new();
        for job_id in stale_ids {
            let message = format!(
                "worker stopped reporting for more than {}s",
                stale_after.as_secs()
            );
            match self.fail(&job_id, &message) {
                Ok(_) => {
                    warn!(job_id = %job_id, "marked stale job as failed");
                    failed.push(job_id);
                }
                Err(ControlError::InvalidTransition { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        Ok(failed)
    }

    fn transition<F>(
        &mut self,
        job_id: &str,
        action: ControlAction,
        apply: F,
    ) -> Result<Job, ControlError>
    where
        F: FnOnce(&Transaction<'_>) -> rusqlite::Result<()>,
    {
        let tx = self
            .connection
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let state = load_state(&tx, job_id)?
            .ok_or_else(|| ControlError::UnknownJob(job_id.to_string()))?;
        let Some(next) = action.next_state(state) else {
            return Err(ControlError::InvalidTransition {
                job_id: job_id.to_string(),
                action,
                state,
            });
        };

        tx.execute(
            "UPDATE jobs SET state = ?2, updated_at = ?3, heartbeat_unix_ms = ?4 WHERE job_id = ?1",
            params![job_id, next.as_str(), now_utc_string(), now_unix_millis()],
        )?;
        apply(&tx)?;
        tx.commit()?;

        info!(job_id, action = %action, from = %state, to = %next, "job state changed");
        self.require(job_id)
    }
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    connection
        .busy_timeout(Duration::from_secs(10))
        .context("failed to set busy timeout")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS jobs (
              job_id TEXT PRIMARY KEY,
              test_id TEXT NOT NULL,
              document_path TEXT NOT NULL,
              roster_path TEXT NOT NULL,
              state TEXT NOT NULL,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL,
              heartbeat_unix_ms INTEGER NOT NULL,
              progress_percent INTEGER NOT NULL DEFAULT 0,
              eta_seconds INTEGER,
              error TEXT,
              presence_table_path TEXT,
              bundle_path TEXT,
              worker_pid INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_test_id ON jobs(test_id);
            ",
        )
        .context("failed to create job schema")?;

    connection
        .execute(
            "
            INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            ",
            params![DB_SCHEMA_VERSION],
        )
        .context("failed to record schema version")?;

    Ok(())
}

fn load_state(tx: &Transaction<'_>, job_id: &str) -> rusqlite::Result<Option<JobState>> {
    tx.query_row(
        "SELECT state FROM jobs WHERE job_id = ?1",
        params![job_id],
        |row| parse_state(row, 0),
    )
    .optional()
}

fn parse_state(row: &Row<'_>, index: usize) -> rusqlite::Result<JobState> {
    let raw: String = row.get(index)?;
    JobState::parse(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            Type::Text,
            format!("unknown job state '{raw}'").into(),
        )
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let progress: i64 = row.get(7)?;
    let eta: Option<i64> = row.get(8)?;
    let worker_pid: Option<i64> = row.get(12)?;

    Ok(Job {
        job_id: row.get(0)?,
        test_id: row.get(1)?,
        document_path: row.get(2)?,
        roster_path: row.get(3)?,
        state: parse_state(row, 4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        progress_percent: progress.clamp(0, 100) as u8,
        eta_seconds: eta.map(|value| value.max(0) as u64),
        error: row.get(9)?,
        presence_table_path: row.get(10)?,
        bundle_path: row.get(11)?,
        worker_pid: worker_pid.and_then(|value| u32::try_from(value).ok()),
    })
}
