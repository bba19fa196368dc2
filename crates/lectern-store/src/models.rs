//! Domain model structs persisted in the licensing database.
//!
//! Structs that may be handed to API callers derive `Serialize`; wrapped key
//! material is always skipped so it cannot leak through a response body.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use lectern_shared::types::{
    AuditId, CekId, DeviceId, JobId, JobPriority, JobStatus, MaterialId, Platform, UserId,
};

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

/// A registered end-user device.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Device {
    pub id: DeviceId,
    pub owner_user_id: UserId,
    /// Opaque client-supplied fingerprint.
    pub fingerprint: String,
    pub display_name: String,
    pub platform: Platform,
    pub registered_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// Set once the device is revoked. Revoked devices are never reactivated.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}

/// Fields supplied when registering a device.
#[derive(Debug, Clone)]
pub struct NewDevice {
    pub owner_user_id: UserId,
    pub fingerprint: String,
    pub display_name: String,
    pub platform: Platform,
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// The wrapped content key of one `(material, version)` pair. Every device
/// CEK row for that pair carries its own wrap of the same key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterialKey {
    pub material_id: MaterialId,
    pub key_version: u32,
    pub wrapped_key: Vec<u8>,
    pub kek_version: u8,
    pub created_at: DateTime<Utc>,
}

/// A content encryption key bound to one device of one owner.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ContentEncryptionKey {
    pub id: CekId,
    pub owner_user_id: UserId,
    pub material_id: MaterialId,
    pub device_id: DeviceId,
    #[serde(skip)]
    pub wrapped_key: Vec<u8>,
    pub kek_version: u8,
    pub key_version: u32,
    pub created_at: DateTime<Utc>,
    /// End of the license this key carries; renewal pushes it out.
    pub expires_at: DateTime<Utc>,
    /// Last successful validation or renewal, the start of the offline grace.
    pub last_validated_at: DateTime<Utc>,
}

impl ContentEncryptionKey {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True once the device has gone longer than `grace` without validating.
    pub fn grace_lapsed_at(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        now - self.last_validated_at > grace
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// A background request to produce the encrypted artifact of one
/// `(material, version)` pair.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EncryptionJob {
    pub id: JobId,
    pub material_id: MaterialId,
    pub key_version: u32,
    pub owner_user_id: UserId,
    pub device_id: DeviceId,
    /// CEK row of the request that created the job.
    pub license_id: CekId,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub error: Option<String>,
    pub retry_count: u32,
    #[serde(skip)]
    pub claim_token: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields supplied when enqueuing a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub material_id: MaterialId,
    pub key_version: u32,
    pub owner_user_id: UserId,
    pub device_id: DeviceId,
    pub license_id: CekId,
    pub priority: JobPriority,
}

/// A request that attached to an already open job.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct JobSubscriber {
    pub job_id: JobId,
    pub owner_user_id: UserId,
    pub device_id: DeviceId,
    pub cek_id: CekId,
    pub attached_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Rate limits
// ---------------------------------------------------------------------------

/// Failure counter and block state of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRateLimit {
    pub device_id: DeviceId,
    pub failed_attempts: u32,
    pub blocked_until: Option<DateTime<Utc>>,
    pub last_attempt_at: DateTime<Utc>,
}

impl DeviceRateLimit {
    /// A blank record, as if the device never failed.
    pub fn fresh(device_id: DeviceId, now: DateTime<Utc>) -> Self {
        Self {
            device_id,
            failed_attempts: 0,
            blocked_until: None,
            last_attempt_at: now,
        }
    }

    pub fn is_blocked_at(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until.is_some_and(|until| until > now)
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditLogEntry {
    pub id: AuditId,
    pub user_id: UserId,
    pub device_id: Option<DeviceId>,
    pub action: String,
    pub resource: String,
    /// Nil when the operation had no resource id.
    pub resource_id: Uuid,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
}
