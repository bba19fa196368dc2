//! Encryption job queue, worker and worker pool.
//!
//! The queue itself lives in SQLite; this module drives it. Workers claim one
//! job at a time, encrypt the source material on a blocking thread and write
//! the manifest followed by the artifact. Retries are left to the
//! maintenance loop, which also reclaims abandoned jobs.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use lectern_shared::artifact::encrypt_artifact;
use lectern_shared::constants::ARTIFACT_CHUNK_SIZE;
use lectern_shared::types::JobId;
use lectern_store::{EncryptionJob, StoreError};

use crate::audit::{Actor, AuditAction, AuditLog, Resource};
use crate::config::JobQueueConfig;
use crate::db::Db;
use crate::error::OfflineError;
use crate::key_vault::{KeyContext, KeyVault};
use crate::storage::{artifact_key, manifest_key, source_key, ObjectStore};

/// Delay before a job that has failed `retry_count` times is retried:
/// `base * 2^retry_count`, capped at `max`.
pub fn retry_delay(config: &JobQueueConfig, retry_count: u32) -> Duration {
    config
        .retry_base_delay
        .saturating_mul(1u32 << retry_count.min(31))
        .min(config.retry_max_delay)
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Counts from one maintenance pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub reclaimed: usize,
    pub requeued: usize,
    pub deleted: usize,
}

#[derive(Clone)]
pub struct JobQueue {
    db: Db,
    config: JobQueueConfig,
}

impl JobQueue {
    pub fn new(db: Db, config: JobQueueConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &JobQueueConfig {
        &self.config
    }

    /// Claim the most urgent pending job, if any.
    pub fn claim_next(&self) -> Result<Option<EncryptionJob>, OfflineError> {
        self.db.call(|db| db.claim_next_job(Utc::now()))
    }

    /// Returns `false` if the claim was lost to a reclaim in the meantime.
    pub fn complete(&self, job: &EncryptionJob) -> Result<bool, OfflineError> {
        let Some(token) = job.claim_token else {
            return Ok(false);
        };
        self.db.call(|db| db.complete_job(job.id, token, Utc::now()))
    }

    pub fn fail(&self, job: &EncryptionJob, error: &str) -> Result<bool, OfflineError> {
        let Some(token) = job.claim_token else {
            return Ok(false);
        };
        self.db.call(|db| db.fail_job(job.id, token, error, Utc::now()))
    }

    /// Fail jobs processing for longer than the stale timeout.
    pub fn reclaim_stale(&self, now: DateTime<Utc>) -> Result<usize, OfflineError> {
        let cutoff = now - to_chrono(self.config.stale_timeout);
        let reclaimed = self.db.call(|db| db.expire_stale_claims(cutoff, now))?;
        if reclaimed > 0 {
            warn!(count = reclaimed, "Reclaimed abandoned encryption jobs");
        }
        Ok(reclaimed)
    }

    /// Return failed jobs whose backoff elapsed to `pending`.
    pub fn requeue_due(&self, now: DateTime<Utc>) -> Result<usize, OfflineError> {
        let max_retries = self.config.max_retries;
        let candidates = self.db.call(|db| db.list_retryable_jobs(max_retries))?;

        let mut requeued = 0;
        for job in candidates {
            let failed_at = job.completed_at.unwrap_or(job.created_at);
            if now - failed_at < to_chrono(retry_delay(&self.config, job.retry_count)) {
                continue;
            }
            if self.db.call(|db| db.requeue_failed_job(job.id, job.retry_count))? {
                info!(job_id = %job.id, retry = job.retry_count + 1, "Requeued encryption job");
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    /// Delete completed jobs past the retention period.
    pub fn cleanup(&self, now: DateTime<Utc>) -> Result<usize, OfflineError> {
        let cutoff = now - to_chrono(self.config.retention);
        let deleted = self.db.call(|db| db.delete_completed_jobs_before(cutoff))?;
        if deleted > 0 {
            debug!(count = deleted, "Deleted old completed jobs");
        }
        Ok(deleted)
    }

    /// Reclaim, requeue, clean up. Reclaim runs first so abandoned jobs enter
    /// the retry path in the same pass.
    pub fn maintain(&self, now: DateTime<Utc>) -> Result<MaintenanceReport, OfflineError> {
        Ok(MaintenanceReport {
            reclaimed: self.reclaim_stale(now)?,
            requeued: self.requeue_due(now)?,
            deleted: self.cleanup(now)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Why a job failed. The display text is what lands in the job's `error`.
#[derive(Debug, Error)]
enum JobError {
    #[error("source object missing")]
    SourceMissing,

    #[error("storage unavailable")]
    Storage,

    #[error("material key missing")]
    KeyMissing,

    #[error("key unwrap failed")]
    Unwrap,

    #[error("encryption failed")]
    Encrypt,

    #[error("persistence unavailable")]
    Persistence,
}

impl JobError {
    /// Code recorded in the audit trail for this failure.
    fn audit_error(&self, terminal: bool) -> OfflineError {
        match self {
            JobError::Unwrap => OfflineError::UnwrapFailed,
            _ if terminal => OfflineError::EncryptionUnavailable,
            JobError::SourceMissing | JobError::Storage => OfflineError::StorageUnavailable,
            JobError::Persistence => OfflineError::PersistenceUnavailable,
            JobError::KeyMissing | JobError::Encrypt => OfflineError::EncryptionUnavailable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(JobId),
    Failed { job_id: JobId, error: String, terminal: bool },
    /// The claim expired and someone else owns the job now.
    Lost(JobId),
}

/// Where a worker reads sources from and writes artifacts to.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub source_bucket: String,
    pub encrypted_bucket: String,
    pub chunk_size: usize,
}

impl WorkerSettings {
    pub fn new(source_bucket: impl Into<String>, encrypted_bucket: impl Into<String>) -> Self {
        Self {
            source_bucket: source_bucket.into(),
            encrypted_bucket: encrypted_bucket.into(),
            chunk_size: ARTIFACT_CHUNK_SIZE,
        }
    }
}

pub struct EncryptionWorker {
    queue: JobQueue,
    db: Db,
    vault: Arc<KeyVault>,
    storage: Arc<dyn ObjectStore>,
    audit: AuditLog,
    settings: WorkerSettings,
}

impl EncryptionWorker {
    pub fn new(
        queue: JobQueue,
        db: Db,
        vault: Arc<KeyVault>,
        storage: Arc<dyn ObjectStore>,
        audit: AuditLog,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            db,
            vault,
            storage,
            audit,
            settings,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Claim and run one job. `Ok(None)` means the queue was empty.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, OfflineError> {
        let Some(job) = self.queue.claim_next()? else {
            return Ok(None);
        };
        info!(
            job_id = %job.id,
            material_id = %job.material_id,
            key_version = job.key_version,
            retry = job.retry_count,
            "Claimed encryption job"
        );

        let actor = Actor::user(job.owner_user_id);
        match self.process(&job).await {
            Ok(()) => {
                if !self.queue.complete(&job)? {
                    warn!(job_id = %job.id, "Claim lost before completion");
                    return Ok(Some(JobOutcome::Lost(job.id)));
                }
                info!(job_id = %job.id, "Encryption job completed");
                self.audit.record(
                    &actor,
                    AuditAction::MaterialEncrypt,
                    Resource::Material,
                    job.material_id.as_uuid(),
                    Some(job.device_id),
                    Ok(()),
                );
                Ok(Some(JobOutcome::Completed(job.id)))
            }
            Err(e) => {
                let message = e.to_string();
                if !self.queue.fail(&job, &message)? {
                    warn!(job_id = %job.id, error = %message, "Claim lost before failure was recorded");
                    return Ok(Some(JobOutcome::Lost(job.id)));
                }

                let terminal = job.retry_count >= self.queue.config().max_retries;
                if terminal {
                    error!(job_id = %job.id, error = %message, "Encryption job failed permanently");
                } else {
                    warn!(job_id = %job.id, error = %message, "Encryption job failed");
                }
                if terminal || matches!(e, JobError::Unwrap) {
                    self.audit.record(
                        &actor,
                        AuditAction::MaterialEncrypt,
                        Resource::Material,
                        job.material_id.as_uuid(),
                        Some(job.device_id),
                        Err(&e.audit_error(terminal)),
                    );
                }
                Ok(Some(JobOutcome::Failed {
                    job_id: job.id,
                    error: message,
                    terminal,
                }))
            }
        }
    }

    async fn process(&self, job: &EncryptionJob) -> Result<(), JobError> {
        let settings = &self.settings;
        let (material_id, key_version) = (job.material_id, job.key_version);

        let source = match self
            .storage
            .get_object(&settings.source_bucket, &source_key(material_id))
            .await
        {
            Ok(data) => data,
            Err(e) if e.is_not_found() => return Err(JobError::SourceMissing),
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Reading source failed");
                return Err(JobError::Storage);
            }
        };

        let material_key = match self.db.raw(|db| db.get_material_key(material_id, key_version)) {
            Ok(Ok(key)) => key,
            Ok(Err(StoreError::NotFound)) => return Err(JobError::KeyMissing),
            Ok(Err(e)) => {
                error!(job_id = %job.id, error = %e, "Loading material key failed");
                return Err(JobError::Persistence);
            }
            Err(_) => return Err(JobError::Persistence),
        };
        let ctx = KeyContext::Material {
            material_id,
            key_version,
        };
        let key = self
            .vault
            .unwrap_key(&material_key.wrapped_key, &ctx)
            .map_err(|_| {
                error!(job_id = %job.id, %material_id, key_version, "Material key failed to unwrap");
                JobError::Unwrap
            })?;

        let chunk_size = settings.chunk_size;
        let artifact = tokio::task::spawn_blocking(move || {
            encrypt_artifact(&key, material_id.as_uuid(), key_version, &source, chunk_size)
        })
        .await
        .map_err(|e| {
            error!(job_id = %job.id, error = %e, "Encryption task aborted");
            JobError::Encrypt
        })?
        .map_err(|e| {
            error!(job_id = %job.id, error = %e, "Encryption failed");
            JobError::Encrypt
        })?;

        let manifest = serde_json::to_vec_pretty(&artifact.manifest).map_err(|_| JobError::Encrypt)?;
        let bucket = &settings.encrypted_bucket;

        // Manifest first: the artifact's presence is what marks the version ready.
        self.put(job, bucket, &manifest_key(material_id, key_version), manifest.into(), "application/json")
            .await?;
        let size = artifact.bytes.len();
        self.put(
            job,
            bucket,
            &artifact_key(material_id, key_version),
            artifact.bytes.into(),
            "application/octet-stream",
        )
        .await?;

        debug!(job_id = %job.id, size, chunks = artifact.manifest.total_chunks, "Artifact stored");
        Ok(())
    }

    async fn put(
        &self,
        job: &EncryptionJob,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<(), JobError> {
        self.storage
            .put_object(bucket, key, data, content_type)
            .await
            .map_err(|e| {
                error!(job_id = %job.id, key, error = %e, "Writing artifact failed");
                JobError::Storage
            })
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// `concurrency` worker tasks plus one maintenance task.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start the pool. Every task exits once `shutdown` turns `true` (or its
    /// sender is dropped), after finishing the job it is on.
    pub fn spawn(worker: Arc<EncryptionWorker>, shutdown: watch::Receiver<bool>) -> Self {
        let config = worker.queue().config().clone();
        let mut handles = Vec::with_capacity(config.concurrency + 1);

        for id in 0..config.concurrency {
            let worker = Arc::clone(&worker);
            let shutdown = shutdown.clone();
            let poll = config.poll_interval;
            handles.push(tokio::spawn(async move {
                worker_loop(id, worker, poll, shutdown).await;
            }));
        }

        let queue = worker.queue().clone();
        handles.push(tokio::spawn(async move {
            maintenance_loop(queue, shutdown).await;
        }));

        info!(workers = config.concurrency, "Encryption worker pool started");
        Self { handles }
    }

    /// Wait for every task to stop.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Encryption worker pool stopped");
    }
}

/// Sleep for `period` or until shutdown. Returns `true` when it is time to stop.
async fn pause(period: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let closed = tokio::select! {
        _ = tokio::time::sleep(period) => false,
        changed = shutdown.changed() => changed.is_err(),
    };
    closed || *shutdown.borrow()
}

async fn worker_loop(
    id: usize,
    worker: Arc<EncryptionWorker>,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker = id, "Worker started");
    while !*shutdown.borrow() {
        match worker.run_once().await {
            // More work may be waiting; go again without sleeping.
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => warn!(worker = id, error = %e, "Worker iteration failed"),
        }
        if pause(poll, &mut shutdown).await {
            break;
        }
    }
    debug!(worker = id, "Worker stopped");
}

async fn maintenance_loop(queue: JobQueue, mut shutdown: watch::Receiver<bool>) {
    let period = queue.config().poll_interval;
    while !*shutdown.borrow() {
        match queue.maintain(Utc::now()) {
            Ok(report) if report != MaintenanceReport::default() => {
                debug!(
                    reclaimed = report.reclaimed,
                    requeued = report.requeued,
                    deleted = report.deleted,
                    "Queue maintenance"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Queue maintenance failed"),
        }
        if pause(period, &mut shutdown).await {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_shared::artifact::{decrypt_artifact, ArtifactManifest};
    use lectern_shared::types::{JobStatus, MaterialId};

    use crate::test_support::{actor, harness, harness_with, test_config, Harness};

    async fn enqueue(h: &Harness, material: MaterialId) -> JobId {
        let alice = actor();
        let device = h.register(&alice, 'a');
        let issued = h
            .engine
            .licenses
            .issue_or_get_cek(&alice, material, device.id)
            .await
            .unwrap();
        issued.job_id.unwrap()
    }

    fn job(h: &Harness, id: JobId) -> EncryptionJob {
        h.engine.db().call(|db| db.get_job(id)).unwrap()
    }

    #[test]
    fn test_retry_delay_backs_off_and_caps() {
        let config = JobQueueConfig {
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(60),
            ..JobQueueConfig::default()
        };
        assert_eq!(retry_delay(&config, 0), Duration::from_secs(2));
        assert_eq!(retry_delay(&config, 1), Duration::from_secs(4));
        assert_eq!(retry_delay(&config, 4), Duration::from_secs(32));
        assert_eq!(retry_delay(&config, 5), Duration::from_secs(60));
        assert_eq!(retry_delay(&config, u32::MAX), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let h = harness().await;
        assert_eq!(h.engine.worker.run_once().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_worker_produces_decryptable_artifact() {
        let h = harness().await;
        let material = MaterialId::new();
        let source: &'static [u8] = b"Chapter 1. It was a dark and stormy night.";
        h.put_source(material, source).await;
        let job_id = enqueue(&h, material).await;

        let outcome = h.engine.worker.run_once().await.unwrap();
        assert_eq!(outcome, Some(JobOutcome::Completed(job_id)));
        let done = job(&h, job_id);
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.completed_at.is_some());

        let bucket = &h.config.encrypted_bucket;
        let data = h.store.get_object(bucket, &artifact_key(material, 1)).await.unwrap();
        let manifest = h.store.get_object(bucket, &manifest_key(material, 1)).await.unwrap();
        let manifest: ArtifactManifest = serde_json::from_slice(&manifest).unwrap();
        assert_eq!(manifest.key_version, 1);
        assert_eq!(manifest.plaintext_size, source.len() as u64);

        let vault = KeyVault::new(h.config.kek, h.config.kek_version);
        let stored = h.engine.db().call(|db| db.get_material_key(material, 1)).unwrap();
        let key = vault
            .unwrap_key(
                &stored.wrapped_key,
                &KeyContext::Material {
                    material_id: material,
                    key_version: 1,
                },
            )
            .unwrap();
        let plain = decrypt_artifact(&key, material.as_uuid(), 1, &data).unwrap();
        assert_eq!(plain, source);

        let db = h.engine.db();
        assert_eq!(db.call(|db| db.count_audit_entries("material_encrypt", true)).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_job_is_retried() {
        let h = harness().await;
        let material = MaterialId::new();
        let job_id = enqueue(&h, material).await;

        let outcome = h.engine.worker.run_once().await.unwrap().unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Failed {
                job_id,
                error: "source object missing".into(),
                terminal: false,
            }
        );
        let failed = job(&h, job_id);
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("source object missing"));

        // Non-terminal failures stay out of the audit trail.
        let db = h.engine.db();
        assert_eq!(db.call(|db| db.count_audit_entries("material_encrypt", false)).unwrap(), 0);

        let queue = h.engine.worker.queue();
        assert_eq!(queue.requeue_due(Utc::now()).unwrap(), 1);
        let pending = job(&h, job_id);
        assert_eq!(pending.status, JobStatus::Pending);
        assert_eq!(pending.retry_count, 1);

        h.put_source(material, b"now it exists").await;
        let outcome = h.engine.worker.run_once().await.unwrap();
        assert_eq!(outcome, Some(JobOutcome::Completed(job_id)));
    }

    #[tokio::test]
    async fn test_requeue_waits_for_backoff() {
        let mut config = test_config();
        config.jobs.retry_base_delay = Duration::from_secs(60);
        config.jobs.retry_max_delay = Duration::from_secs(600);
        let h = harness_with(config).await;
        let job_id = enqueue(&h, MaterialId::new()).await;
        h.engine.worker.run_once().await.unwrap();

        let queue = h.engine.worker.queue();
        let failed_at = job(&h, job_id).completed_at.unwrap();
        assert_eq!(queue.requeue_due(failed_at + chrono::Duration::seconds(30)).unwrap(), 0);
        assert_eq!(queue.requeue_due(failed_at + chrono::Duration::seconds(61)).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_claim_is_reclaimed() {
        let h = harness().await;
        let job_id = enqueue(&h, MaterialId::new()).await;

        let queue = h.engine.worker.queue();
        let claimed = queue.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert_eq!(claimed.status, JobStatus::Processing);

        let now = Utc::now();
        assert_eq!(queue.reclaim_stale(now).unwrap(), 0);
        let later = now + to_chrono(queue.config().stale_timeout) + chrono::Duration::seconds(1);
        assert_eq!(queue.reclaim_stale(later).unwrap(), 1);

        let reclaimed = job(&h, job_id);
        assert_eq!(reclaimed.status, JobStatus::Failed);
        assert_eq!(reclaimed.error.as_deref(), Some(lectern_store::CLAIM_EXPIRED));

        // The original claimant can no longer settle the job.
        assert!(!queue.complete(&claimed).unwrap());
        assert!(!queue.fail(&claimed, "late").unwrap());
    }

    #[tokio::test]
    async fn test_maintenance_cleans_up_completed_jobs() {
        let h = harness().await;
        let material = MaterialId::new();
        h.put_source(material, b"data").await;
        enqueue(&h, material).await;
        h.engine.worker.run_once().await.unwrap();

        let queue = h.engine.worker.queue();
        let now = Utc::now();
        assert_eq!(queue.maintain(now).unwrap(), MaintenanceReport::default());

        let later = now + to_chrono(queue.config().retention) + chrono::Duration::seconds(1);
        let report = queue.maintain(later).unwrap();
        assert_eq!(report.deleted, 1);
    }

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops() {
        let mut config = test_config();
        config.jobs.concurrency = 2;
        config.jobs.poll_interval = Duration::from_millis(10);
        let h = harness_with(config).await;
        let material = MaterialId::new();
        h.put_source(material, b"pool data").await;

        let (tx, rx) = watch::channel(false);
        let pool = h.engine.spawn_workers(rx);
        let job_id = enqueue(&h, material).await;

        let done = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if job(&h, job_id).status == JobStatus::Completed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(done.is_ok(), "job never completed");

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .expect("pool did not stop");
    }
}
