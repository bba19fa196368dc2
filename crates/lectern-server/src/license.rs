//! CEK/License Manager: the security decision point.
//!
//! Every call runs the same gate first (rate limit, then device liveness),
//! settles the device's rate-limit counter afterwards and writes exactly one
//! audit entry. Plaintext keys exist only between an unwrap and the wrap
//! that follows it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use lectern_shared::crypto::ContentKey;
use lectern_shared::types::{CekId, DeviceId, JobId, JobPriority, JobStatus, MaterialId, UserId};
use lectern_store::{
    new_cek, CekInsert, ContentEncryptionKey, Device, EncryptionJob, EnqueueOutcome, MaterialKey,
    NewJob, StoreError,
};

use crate::audit::{Actor, AuditAction, AuditLog, Resource};
use crate::db::Db;
use crate::devices::DeviceRegistry;
use crate::error::OfflineError;
use crate::key_vault::{KeyContext, KeyVault};
use crate::rate_limit::{to_chrono, DeviceRateLimiter, RateDecision};
use crate::storage::{artifact_key, ObjectStore};

/// Opaque handle returned to callers in place of key material.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CekMetadata {
    pub cek_id: CekId,
    pub material_id: MaterialId,
    pub device_id: DeviceId,
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&ContentEncryptionKey> for CekMetadata {
    fn from(cek: &ContentEncryptionKey) -> Self {
        Self {
            cek_id: cek.id,
            material_id: cek.material_id,
            device_id: cek.device_id,
            key_version: cek.key_version,
            created_at: cek.created_at,
            expires_at: cek.expires_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IssueOutcome {
    pub cek: CekMetadata,
    pub artifact_ready: bool,
    /// Job producing the artifact, when it is not ready yet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// Presigned download link, present iff `artifact_ready`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// Result of a successful validation or renewal. The device may keep
/// reading offline until `offline_until`, and never past `expires_at`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct License {
    pub cek_id: CekId,
    pub material_id: MaterialId,
    pub device_id: DeviceId,
    pub key_version: u32,
    pub validated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub offline_until: DateTime<Utc>,
    pub artifact_ready: bool,
}

/// What a caller may see of an encryption job.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobView {
    pub job_id: JobId,
    pub material_id: MaterialId,
    pub key_version: u32,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<EncryptionJob> for JobView {
    fn from(job: EncryptionJob) -> Self {
        Self {
            job_id: job.id,
            material_id: job.material_id,
            key_version: job.key_version,
            status: job.status,
            priority: job.priority,
            retry_count: job.retry_count,
            error: job.error,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

struct ArtifactState {
    ready: bool,
    job_id: Option<JobId>,
    download_url: Option<String>,
}

/// Settings the manager takes from [`ServerConfig`](crate::config::ServerConfig).
#[derive(Debug, Clone)]
pub struct LicenseSettings {
    pub encrypted_bucket: String,
    pub presign_ttl: Duration,
    pub max_retries: u32,
    /// Term of a new or renewed license.
    pub license_ttl: Duration,
    /// Longest gap between validations before the license must be renewed.
    pub offline_grace: Duration,
}

#[derive(Clone)]
pub struct LicenseManager {
    db: Db,
    vault: Arc<KeyVault>,
    storage: Arc<dyn ObjectStore>,
    limiter: DeviceRateLimiter,
    registry: DeviceRegistry,
    audit: AuditLog,
    settings: LicenseSettings,
}

impl LicenseManager {
    pub fn new(
        db: Db,
        vault: Arc<KeyVault>,
        storage: Arc<dyn ObjectStore>,
        limiter: DeviceRateLimiter,
        registry: DeviceRegistry,
        audit: AuditLog,
        settings: LicenseSettings,
    ) -> Self {
        Self {
            db,
            vault,
            storage,
            limiter,
            registry,
            audit,
            settings,
        }
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    pub async fn issue_or_get_cek(
        &self,
        actor: &Actor,
        material_id: MaterialId,
        device_id: DeviceId,
    ) -> Result<IssueOutcome, OfflineError> {
        self.issue_or_get_cek_with_priority(actor, material_id, device_id, JobPriority::Normal)
            .await
    }

    /// Never waits for an encryption job: a missing artifact is reported as
    /// `artifact_ready = false` together with the job producing it.
    pub async fn issue_or_get_cek_with_priority(
        &self,
        actor: &Actor,
        material_id: MaterialId,
        device_id: DeviceId,
        priority: JobPriority,
    ) -> Result<IssueOutcome, OfflineError> {
        let result = self.issue(actor, material_id, device_id, priority).await;
        self.settle(actor, device_id, result.as_ref().map(|_| ()));

        match &result {
            Ok((outcome, generated)) => {
                let action = if *generated {
                    AuditAction::KeyGenerate
                } else {
                    AuditAction::LicenseIssue
                };
                self.audit.record(
                    actor,
                    action,
                    Resource::Cek,
                    outcome.cek.cek_id.as_uuid(),
                    Some(device_id),
                    Ok(()),
                );
            }
            Err(e) => {
                warn!(%material_id, %device_id, code = e.code(), "License issue refused");
                self.audit.record(
                    actor,
                    AuditAction::LicenseIssue,
                    Resource::Material,
                    material_id.as_uuid(),
                    Some(device_id),
                    Err(e),
                );
            }
        }
        result.map(|(outcome, _)| outcome)
    }

    /// Re-check a device's standing for material it already holds a key for.
    pub async fn validate_license(
        &self,
        actor: &Actor,
        material_id: MaterialId,
        device_id: DeviceId,
    ) -> Result<License, OfflineError> {
        let result = self.validate(actor, material_id, device_id).await;
        self.settle(actor, device_id, result.as_ref().map(|_| ()));

        let resource_id = match &result {
            Ok(license) => license.cek_id.as_uuid(),
            Err(e) => {
                warn!(%material_id, %device_id, code = e.code(), "License validation refused");
                material_id.as_uuid()
            }
        };
        self.audit.record(
            actor,
            AuditAction::LicenseValidate,
            Resource::License,
            resource_id,
            Some(device_id),
            result.as_ref().map(|_| ()),
        );
        result
    }

    /// Extend a license by a full term and restart its offline grace. Works
    /// on expired and grace-lapsed licenses; the device must still be live.
    pub async fn renew_license(
        &self,
        actor: &Actor,
        material_id: MaterialId,
        device_id: DeviceId,
    ) -> Result<License, OfflineError> {
        let result = self.renew(actor, material_id, device_id).await;
        self.settle(actor, device_id, result.as_ref().map(|_| ()));

        let resource_id = match &result {
            Ok(license) => license.cek_id.as_uuid(),
            Err(e) => {
                warn!(%material_id, %device_id, code = e.code(), "License renewal refused");
                material_id.as_uuid()
            }
        };
        self.audit.record(
            actor,
            AuditAction::LicenseRenew,
            Resource::License,
            resource_id,
            Some(device_id),
            result.as_ref().map(|_| ()),
        );
        result
    }

    /// Mint the next key version of a material and issue it to `device_id`.
    /// Older CEK rows and artifacts stay in place for already cached copies.
    pub async fn rotate_key(
        &self,
        actor: &Actor,
        material_id: MaterialId,
        device_id: DeviceId,
    ) -> Result<IssueOutcome, OfflineError> {
        let result = self.rotate(actor, material_id, device_id).await;
        self.settle(actor, device_id, result.as_ref().map(|_| ()));

        let resource_id = match &result {
            Ok(outcome) => outcome.cek.cek_id.as_uuid(),
            Err(e) => {
                warn!(%material_id, %device_id, code = e.code(), "Key rotation refused");
                material_id.as_uuid()
            }
        };
        self.audit.record(
            actor,
            AuditAction::KeyRotate,
            Resource::Cek,
            resource_id,
            Some(device_id),
            result.as_ref().map(|_| ()),
        );
        result
    }

    /// Visible to the job's creator and to every user attached to it.
    pub fn get_job_status(&self, actor: &Actor, job_id: JobId) -> Result<JobView, OfflineError> {
        let job = match self.db.raw(|db| db.get_job(job_id))? {
            Ok(job) => job,
            Err(StoreError::NotFound) => return Err(OfflineError::JobNotFound),
            Err(e) => return Err(e.into()),
        };
        let user = actor.user_id;
        if !self.db.call(|db| db.is_job_visible_to(job_id, user))? {
            debug!(%job_id, user_id = %user, "Job hidden from caller");
            return Err(OfflineError::JobNotFound);
        }
        Ok(job.into())
    }

    // ------------------------------------------------------------------
    // Flows
    // ------------------------------------------------------------------

    async fn issue(
        &self,
        actor: &Actor,
        material_id: MaterialId,
        device_id: DeviceId,
        priority: JobPriority,
    ) -> Result<(IssueOutcome, bool), OfflineError> {
        let device = self.gate(actor, device_id)?;
        let owner = device.owner_user_id;

        let material_key = self.current_material_key(material_id)?;
        let live = self
            .db
            .call(|db| db.get_live_cek(owner, material_id, device_id))?;

        let (cek, generated) = match live {
            Some(cek) if cek.key_version >= material_key.key_version => {
                if cek.is_expired_at(Utc::now()) {
                    return Err(OfflineError::LicenseExpired {
                        expired_at: cek.expires_at,
                    });
                }
                (cek, false)
            }
            _ => self.issue_cek(owner, material_id, device_id, &material_key)?,
        };

        let artifact = self.ensure_artifact(&cek, priority).await?;
        self.registry.touch(device_id);
        Ok((outcome(&cek, artifact), generated))
    }

    async fn validate(
        &self,
        actor: &Actor,
        material_id: MaterialId,
        device_id: DeviceId,
    ) -> Result<License, OfflineError> {
        let device = self.gate(actor, device_id)?;
        let owner = device.owner_user_id;

        let cek = self
            .db
            .call(|db| db.get_live_cek(owner, material_id, device_id))?
            .ok_or(OfflineError::NoLicense)?;

        let now = Utc::now();
        if cek.is_expired_at(now) {
            debug!(cek_id = %cek.id, expired_at = %cek.expires_at, "License expired");
            return Err(OfflineError::LicenseExpired {
                expired_at: cek.expires_at,
            });
        }
        if cek.grace_lapsed_at(now, to_chrono(self.settings.offline_grace)) {
            debug!(cek_id = %cek.id, last_validated_at = %cek.last_validated_at, "Offline grace lapsed");
            return Err(OfflineError::OfflineGraceExpired);
        }
        self.check_integrity(&cek)?;

        let ready = self.artifact_ready(&cek).await?;
        let cek_id = cek.id;
        self.db
            .call(|db| db.record_license_validation(cek_id, now))?;

        self.registry.touch(device_id);
        Ok(self.license(&cek, now, cek.expires_at, ready))
    }

    async fn renew(
        &self,
        actor: &Actor,
        material_id: MaterialId,
        device_id: DeviceId,
    ) -> Result<License, OfflineError> {
        let device = self.gate(actor, device_id)?;
        let owner = device.owner_user_id;

        let cek = self
            .db
            .call(|db| db.get_live_cek(owner, material_id, device_id))?
            .ok_or(OfflineError::NoLicense)?;
        self.check_integrity(&cek)?;

        let now = Utc::now();
        let expires_at = now + to_chrono(self.settings.license_ttl);
        let cek_id = cek.id;
        if !self
            .db
            .call(|db| db.renew_license_if_device_active(cek_id, owner, expires_at, now))?
        {
            warn!(%device_id, "Device revoked before the renewal could be stored");
            return Err(OfflineError::DeviceNotActive);
        }
        info!(%cek_id, %device_id, %expires_at, "Renewed license");

        let ready = self.artifact_ready(&cek).await?;
        self.registry.touch(device_id);
        Ok(self.license(&cek, now, expires_at, ready))
    }

    async fn rotate(
        &self,
        actor: &Actor,
        material_id: MaterialId,
        device_id: DeviceId,
    ) -> Result<IssueOutcome, OfflineError> {
        let device = self.gate(actor, device_id)?;
        let owner = device.owner_user_id;

        let live = self
            .db
            .call(|db| db.get_live_cek(owner, material_id, device_id))?
            .ok_or(OfflineError::NoLicense)?;
        let current = self
            .db
            .call(|db| db.current_material_key(material_id))?
            .ok_or(OfflineError::NoLicense)?;

        let next_version = current
            .key_version
            .checked_add(1)
            .ok_or_else(|| OfflineError::InvalidRequest("key version exhausted".into()))?;
        let next = self.create_material_key(material_id, next_version)?;
        info!(
            %material_id,
            from = live.key_version,
            to = next.key_version,
            "Rotating material key"
        );

        let (cek, _) = self.issue_cek(owner, material_id, device_id, &next)?;
        let artifact = self.ensure_artifact(&cek, JobPriority::High).await?;
        self.registry.touch(device_id);
        Ok(outcome(&cek, artifact))
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    /// Rate limit first, so a blocked device never reaches the Key Vault.
    fn gate(&self, actor: &Actor, device_id: DeviceId) -> Result<Device, OfflineError> {
        if let RateDecision::Blocked { until } = self.limiter.check(device_id) {
            return Err(OfflineError::DeviceBlocked { until });
        }
        self.db
            .call(|db| db.active_device_for_owner(actor.user_id, device_id))?
            .ok_or(OfflineError::DeviceNotActive)
    }

    /// Only outcomes the device is responsible for move its counter, and only
    /// when the caller holds the device.
    fn settle(&self, actor: &Actor, device_id: DeviceId, result: Result<(), &OfflineError>) {
        let owner = actor.user_id;
        match result {
            Ok(()) => self.limiter.record_outcome(device_id, owner, true),
            Err(OfflineError::DeviceNotActive | OfflineError::NoLicense | OfflineError::UnwrapFailed) => {
                self.limiter.record_outcome(device_id, owner, false)
            }
            Err(_) => {}
        }
    }

    /// The stored wrap must still open under its own context.
    fn check_integrity(&self, cek: &ContentEncryptionKey) -> Result<(), OfflineError> {
        let ctx = device_context(cek);
        if let Err(e) = self.vault.unwrap_key(&cek.wrapped_key, &ctx) {
            error!(cek_id = %cek.id, device_id = %cek.device_id, "Stored CEK failed integrity check");
            return Err(e);
        }
        Ok(())
    }

    async fn artifact_ready(&self, cek: &ContentEncryptionKey) -> Result<bool, OfflineError> {
        Ok(self
            .storage
            .object_exists(
                &self.settings.encrypted_bucket,
                &artifact_key(cek.material_id, cek.key_version),
            )
            .await?)
    }

    fn license(
        &self,
        cek: &ContentEncryptionKey,
        validated_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
        artifact_ready: bool,
    ) -> License {
        let offline_until =
            (validated_at + to_chrono(self.settings.offline_grace)).min(expires_at);
        License {
            cek_id: cek.id,
            material_id: cek.material_id,
            device_id: cek.device_id,
            key_version: cek.key_version,
            validated_at,
            expires_at,
            offline_until,
            artifact_ready,
        }
    }

    /// The material's highest key version, creating version 1 on first use.
    fn current_material_key(&self, material_id: MaterialId) -> Result<MaterialKey, OfflineError> {
        if let Some(key) = self.db.call(|db| db.current_material_key(material_id))? {
            return Ok(key);
        }
        self.create_material_key(material_id, 1)
    }

    /// Insert `version` with a fresh key. A concurrent creator may win the
    /// insert; its row is used instead.
    fn create_material_key(
        &self,
        material_id: MaterialId,
        version: u32,
    ) -> Result<MaterialKey, OfflineError> {
        let ctx = KeyContext::Material {
            material_id,
            key_version: version,
        };
        let candidate = MaterialKey {
            material_id,
            key_version: version,
            wrapped_key: self.vault.wrap_key(&ContentKey::generate(), &ctx)?,
            kek_version: self.vault.version(),
            created_at: Utc::now(),
        };

        if self.db.call(|db| db.insert_material_key(&candidate))? {
            info!(%material_id, key_version = version, "Created material key");
            return Ok(candidate);
        }
        debug!(%material_id, key_version = version, "Material key created concurrently");
        self.db.call(|db| db.get_material_key(material_id, version))
    }

    /// Wrap the material key for one device. The insert re-checks that the
    /// device is still live, so a revocation racing this call wins.
    fn issue_cek(
        &self,
        owner: UserId,
        material_id: MaterialId,
        device_id: DeviceId,
        material_key: &MaterialKey,
    ) -> Result<(ContentEncryptionKey, bool), OfflineError> {
        let material_ctx = KeyContext::Material {
            material_id,
            key_version: material_key.key_version,
        };
        let key = self
            .vault
            .unwrap_key(&material_key.wrapped_key, &material_ctx)
            .map_err(|e| {
                error!(%material_id, key_version = material_key.key_version, "Material key failed to unwrap");
                e
            })?;

        let device_ctx = KeyContext::Device {
            owner,
            material_id,
            device_id,
            key_version: material_key.key_version,
        };
        let now = Utc::now();
        let mut cek = new_cek(
            owner,
            material_id,
            device_id,
            self.vault.wrap_key(&key, &device_ctx)?,
            self.vault.version(),
            material_key.key_version,
            now,
        );
        cek.expires_at = now + to_chrono(self.settings.license_ttl);
        drop(key);

        match self.db.call(|db| db.insert_cek_if_device_active(&cek))? {
            CekInsert::Inserted(cek) => {
                info!(cek_id = %cek.id, %device_id, key_version = cek.key_version, "Issued CEK");
                Ok((cek, true))
            }
            CekInsert::Existing(cek) => {
                debug!(cek_id = %cek.id, %device_id, "CEK issued concurrently, reusing");
                Ok((cek, false))
            }
            CekInsert::DeviceInactive => {
                warn!(%device_id, "Device revoked before CEK could be stored");
                Err(OfflineError::DeviceNotActive)
            }
        }
    }

    /// Report the artifact for `cek`'s version, enqueuing work when missing.
    async fn ensure_artifact(
        &self,
        cek: &ContentEncryptionKey,
        priority: JobPriority,
    ) -> Result<ArtifactState, OfflineError> {
        let bucket = &self.settings.encrypted_bucket;
        let key = artifact_key(cek.material_id, cek.key_version);

        if self.storage.object_exists(bucket, &key).await? {
            let url = self
                .storage
                .presigned_get_url(bucket, &key, self.settings.presign_ttl)?;
            return Ok(ArtifactState {
                ready: true,
                job_id: None,
                download_url: Some(url),
            });
        }

        let (material_id, key_version) = (cek.material_id, cek.key_version);
        if let Some(job) = self.db.call(|db| db.latest_job(material_id, key_version))? {
            if job.status == JobStatus::Failed && job.retry_count >= self.settings.max_retries {
                warn!(job_id = %job.id, %material_id, key_version, "Encryption retries exhausted");
                return Err(OfflineError::EncryptionUnavailable);
            }
        }

        let new = NewJob {
            material_id,
            key_version,
            owner_user_id: cek.owner_user_id,
            device_id: cek.device_id,
            license_id: cek.id,
            priority,
        };
        let enqueued = self.db.call(|db| db.create_or_attach_job(&new, Utc::now()))?;
        match &enqueued {
            EnqueueOutcome::Created(job) => {
                info!(job_id = %job.id, %material_id, key_version, priority = job.priority.value(), "Encryption job created");
            }
            EnqueueOutcome::Attached(job) => {
                debug!(job_id = %job.id, %material_id, key_version, "Attached to open encryption job");
            }
        }

        Ok(ArtifactState {
            ready: false,
            job_id: Some(enqueued.job().id),
            download_url: None,
        })
    }
}

fn device_context(cek: &ContentEncryptionKey) -> KeyContext {
    KeyContext::Device {
        owner: cek.owner_user_id,
        material_id: cek.material_id,
        device_id: cek.device_id,
        key_version: cek.key_version,
    }
}

fn outcome(cek: &ContentEncryptionKey, artifact: ArtifactState) -> IssueOutcome {
    IssueOutcome {
        cek: cek.into(),
        artifact_ready: artifact.ready,
        job_id: artifact.job_id,
        download_url: artifact.download_url,
    }
}
