//! Encryption job queue persistence.
//!
//! Every state transition is a single conditional `UPDATE`, so exclusivity
//! holds across connections and processes without any in-memory locking:
//!
//! * claiming flips `pending -> processing` for exactly one row and stamps a
//!   fresh `claim_token`;
//! * completing or failing requires the caller's token, so a worker whose
//!   claim expired cannot overwrite the outcome of whoever reclaimed the job;
//! * requeueing a failed job is keyed on its `retry_count`, so two schedulers
//!   cannot both bump it.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use lectern_shared::types::{JobId, JobStatus, MaterialId, UserId};

use crate::codec;
use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::{EncryptionJob, JobSubscriber, NewJob};

const JOB_COLUMNS: &str = "id, material_id, key_version, owner_user_id, device_id, license_id,
     priority, status, error, retry_count, claim_token, created_at, started_at, completed_at";

/// Error recorded on jobs whose worker never reported back.
pub const CLAIM_EXPIRED: &str = "claim expired";

/// Result of [`Database::create_or_attach_job`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Created(EncryptionJob),
    /// An unfinished job for the same material version already existed; the
    /// request was recorded as one of its subscribers.
    Attached(EncryptionJob),
}

impl EnqueueOutcome {
    pub fn job(&self) -> &EncryptionJob {
        match self {
            Self::Created(job) | Self::Attached(job) => job,
        }
    }
}

impl Database {
    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    /// Create a job for `(material, key_version)` or attach to the unfinished
    /// one. Attaching with a more urgent priority raises a pending job's
    /// priority.
    pub fn create_or_attach_job(&mut self, new: &NewJob, now: DateTime<Utc>) -> Result<EnqueueOutcome> {
        self.immediate(|tx| {
            let open = tx
                .query_row(
                    &format!(
                        "SELECT {JOB_COLUMNS} FROM encryption_jobs
                         WHERE material_id = ?1 AND key_version = ?2 AND status <> 'completed'"
                    ),
                    params![new.material_id.to_string(), new.key_version],
                    row_to_job,
                )
                .optional()?;

            let Some(job) = open else {
                let job = EncryptionJob {
                    id: JobId::new(),
                    material_id: new.material_id,
                    key_version: new.key_version,
                    owner_user_id: new.owner_user_id,
                    device_id: new.device_id,
                    license_id: new.license_id,
                    priority: new.priority,
                    status: JobStatus::Pending,
                    error: None,
                    retry_count: 0,
                    claim_token: None,
                    created_at: now,
                    started_at: None,
                    completed_at: None,
                };
                tx.execute(
                    "INSERT INTO encryption_jobs
                        (id, material_id, key_version, owner_user_id, device_id, license_id,
                         priority, status, retry_count, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, ?8)",
                    params![
                        job.id.to_string(),
                        job.material_id.to_string(),
                        job.key_version,
                        job.owner_user_id.to_string(),
                        job.device_id.to_string(),
                        job.license_id.to_string(),
                        job.priority.value(),
                        codec::ts(now),
                    ],
                )?;
                return Ok(EnqueueOutcome::Created(job));
            };

            if job.license_id != new.license_id {
                tx.execute(
                    "INSERT INTO job_subscribers (job_id, owner_user_id, device_id, cek_id, attached_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (job_id, cek_id) DO NOTHING",
                    params![
                        job.id.to_string(),
                        new.owner_user_id.to_string(),
                        new.device_id.to_string(),
                        new.license_id.to_string(),
                        codec::ts(now),
                    ],
                )?;
            }

            tx.execute(
                "UPDATE encryption_jobs SET priority = ?2
                 WHERE id = ?1 AND status = 'pending' AND priority > ?2",
                params![job.id.to_string(), new.priority.value()],
            )?;

            let job = tx.query_row(
                &format!("SELECT {JOB_COLUMNS} FROM encryption_jobs WHERE id = ?1"),
                params![job.id.to_string()],
                row_to_job,
            )?;
            Ok(EnqueueOutcome::Attached(job))
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_job(&self, id: JobId) -> Result<EncryptionJob> {
        self.conn()
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM encryption_jobs WHERE id = ?1"),
                params![id.to_string()],
                row_to_job,
            )
            .map_err(not_found)
    }

    /// The most recently created job for a material version, in any state.
    pub fn latest_job(&self, material: MaterialId, key_version: u32) -> Result<Option<EncryptionJob>> {
        let job = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM encryption_jobs
                     WHERE material_id = ?1 AND key_version = ?2
                     ORDER BY created_at DESC, rowid DESC
                     LIMIT 1"
                ),
                params![material.to_string(), key_version],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    pub fn list_jobs_with_status(&self, status: JobStatus) -> Result<Vec<EncryptionJob>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM encryption_jobs
             WHERE status = ?1
             ORDER BY priority ASC, created_at ASC, rowid ASC"
        ))?;
        let rows = stmt.query_map(params![status.as_str()], row_to_job)?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    pub fn list_job_subscribers(&self, job: JobId) -> Result<Vec<JobSubscriber>> {
        let mut stmt = self.conn().prepare(
            "SELECT job_id, owner_user_id, device_id, cek_id, attached_at
             FROM job_subscribers
             WHERE job_id = ?1
             ORDER BY attached_at ASC",
        )?;
        let rows = stmt.query_map(params![job.to_string()], |row| {
            Ok(JobSubscriber {
                job_id: codec::id(row, 0)?,
                owner_user_id: codec::id(row, 1)?,
                device_id: codec::id(row, 2)?,
                cek_id: codec::id(row, 3)?,
                attached_at: codec::time(row, 4)?,
            })
        })?;

        let mut subscribers = Vec::new();
        for row in rows {
            subscribers.push(row?);
        }
        Ok(subscribers)
    }

    /// Whether `user` created the job or attached a request to it.
    pub fn is_job_visible_to(&self, job: JobId, user: UserId) -> Result<bool> {
        let visible = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM encryption_jobs WHERE id = ?1 AND owner_user_id = ?2)
                 OR EXISTS(SELECT 1 FROM job_subscribers WHERE job_id = ?1 AND owner_user_id = ?2)",
            params![job.to_string(), user.to_string()],
            |row| row.get(0),
        )?;
        Ok(visible)
    }

    // ------------------------------------------------------------------
    // Worker transitions
    // ------------------------------------------------------------------

    /// Atomically claim the most urgent pending job: lowest priority value
    /// first, then oldest. Returns `None` when the queue is empty.
    pub fn claim_next_job(&self, now: DateTime<Utc>) -> Result<Option<EncryptionJob>> {
        let job = self
            .conn()
            .query_row(
                &format!(
                    "UPDATE encryption_jobs
                     SET status = 'processing', started_at = ?1, completed_at = NULL,
                         claim_token = ?2
                     WHERE id = (SELECT id FROM encryption_jobs
                                 WHERE status = 'pending'
                                 ORDER BY priority ASC, created_at ASC, rowid ASC
                                 LIMIT 1)
                       AND status = 'pending'
                     RETURNING {JOB_COLUMNS}"
                ),
                params![codec::ts(now), Uuid::new_v4().to_string()],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Mark a claimed job completed. Returns `false` if the claim is no longer
    /// held by `token`.
    pub fn complete_job(&self, id: JobId, token: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE encryption_jobs
             SET status = 'completed', completed_at = ?3, error = NULL, claim_token = NULL
             WHERE id = ?1 AND status = 'processing' AND claim_token = ?2",
            params![id.to_string(), token.to_string(), codec::ts(now)],
        )?;
        Ok(affected > 0)
    }

    /// Mark a claimed job failed. `completed_at` records when it finished.
    pub fn fail_job(&self, id: JobId, token: Uuid, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE encryption_jobs
             SET status = 'failed', completed_at = ?3, error = ?4, claim_token = NULL
             WHERE id = ?1 AND status = 'processing' AND claim_token = ?2",
            params![id.to_string(), token.to_string(), codec::ts(now), error],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Fail every job that has been processing since before `cutoff`.
    pub fn expire_stale_claims(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "UPDATE encryption_jobs
             SET status = 'failed', completed_at = ?2, error = ?3, claim_token = NULL
             WHERE status = 'processing' AND started_at < ?1",
            params![codec::ts(cutoff), codec::ts(now), CLAIM_EXPIRED],
        )?;
        Ok(affected)
    }

    /// Failed jobs that still have retries left.
    pub fn list_retryable_jobs(&self, max_retries: u32) -> Result<Vec<EncryptionJob>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM encryption_jobs
             WHERE status = 'failed' AND retry_count < ?1
             ORDER BY completed_at ASC"
        ))?;
        let rows = stmt.query_map(params![max_retries], row_to_job)?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Return a failed job to `pending` and bump its retry count, provided no
    /// one else requeued it since `seen_retry_count` was read.
    pub fn requeue_failed_job(&self, id: JobId, seen_retry_count: u32) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE encryption_jobs
             SET status = 'pending', retry_count = retry_count + 1,
                 started_at = NULL, completed_at = NULL, claim_token = NULL
             WHERE id = ?1 AND status = 'failed' AND retry_count = ?2",
            params![id.to_string(), seen_retry_count],
        )?;
        Ok(affected > 0)
    }

    /// Delete completed jobs that finished before `cutoff`.
    pub fn delete_completed_jobs_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn().execute(
            "DELETE FROM encryption_jobs WHERE status = 'completed' AND completed_at < ?1",
            params![codec::ts(cutoff)],
        )?;
        Ok(affected)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<EncryptionJob> {
    Ok(EncryptionJob {
        id: codec::id(row, 0)?,
        material_id: codec::id(row, 1)?,
        key_version: row.get(2)?,
        owner_user_id: codec::id(row, 3)?,
        device_id: codec::id(row, 4)?,
        license_id: codec::id(row, 5)?,
        priority: codec::numeric(row, 6)?,
        status: codec::parsed(row, 7)?,
        error: row.get(8)?,
        retry_count: row.get(9)?,
        claim_token: codec::opt_id(row, 10)?,
        created_at: codec::time(row, 11)?,
        started_at: codec::opt_time(row, 12)?,
        completed_at: codec::opt_time(row, 13)?,
    })
}
