//! Security audit trail.
//!
//! Recording never fails the caller: the decision being recorded has already
//! taken effect, so a persistence hiccup is logged and swallowed.

use chrono::Utc;
use tracing::error;
use uuid::Uuid;

use lectern_shared::types::{AuditId, DeviceId, UserId};
use lectern_store::AuditLogEntry;

use crate::db::Db;
use crate::error::OfflineError;

/// Who is calling, as asserted by the gateway in front of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl Actor {
    /// An actor with no request metadata (workers, tests, tooling).
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id,
            ip_address: None,
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    DeviceRegister,
    DeviceRevoke,
    KeyGenerate,
    LicenseIssue,
    LicenseValidate,
    LicenseRenew,
    KeyRotate,
    MaterialEncrypt,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceRegister => "device_register",
            Self::DeviceRevoke => "device_revoke",
            Self::KeyGenerate => "key_generate",
            Self::LicenseIssue => "license_issue",
            Self::LicenseValidate => "license_validate",
            Self::LicenseRenew => "license_renew",
            Self::KeyRotate => "key_rotate",
            Self::MaterialEncrypt => "material_encrypt",
        }
    }
}

/// Kind of object an entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Device,
    License,
    Cek,
    Material,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "device",
            Self::License => "license",
            Self::Cek => "cek",
            Self::Material => "material",
        }
    }
}

#[derive(Clone)]
pub struct AuditLog {
    db: Db,
}

impl AuditLog {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Append one entry. `outcome` is `Err` for denied or failed operations;
    /// its code lands in `error_code`.
    pub fn record(
        &self,
        actor: &Actor,
        action: AuditAction,
        resource: Resource,
        resource_id: Uuid,
        device_id: Option<DeviceId>,
        outcome: Result<(), &OfflineError>,
    ) {
        let entry = AuditLogEntry {
            id: AuditId::new(),
            user_id: actor.user_id,
            device_id,
            action: action.as_str().to_string(),
            resource: resource.as_str().to_string(),
            resource_id,
            ip_address: actor.ip_address.clone(),
            user_agent: actor.user_agent.clone(),
            success: outcome.is_ok(),
            error_code: outcome.err().map(|e| e.code().to_string()),
            created_at: Utc::now(),
        };

        if let Err(e) = self.db.call(|db| db.insert_audit_entry(&entry)) {
            error!(
                action = action.as_str(),
                user_id = %actor.user_id,
                error = %e,
                "audit entry lost"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_store::Database;

    #[test]
    fn test_record_success_and_failure() {
        let db = Db::new(Database::open_in_memory().unwrap());
        let audit = AuditLog::new(db.clone());
        let actor = Actor {
            user_id: UserId::new(),
            ip_address: Some("10.0.0.7".into()),
            user_agent: Some("lectern-ios/2.1".into()),
        };

        audit.record(&actor, AuditAction::LicenseValidate, Resource::License, Uuid::nil(), None, Ok(()));
        audit.record(
            &actor,
            AuditAction::LicenseValidate,
            Resource::License,
            Uuid::nil(),
            None,
            Err(&OfflineError::NoLicense),
        );

        let entries = db.call(|db| db.list_audit_for_user(actor.user_id, 10)).unwrap();
        assert_eq!(entries.len(), 2);
        let failed = entries.iter().find(|e| !e.success).unwrap();
        assert_eq!(failed.error_code.as_deref(), Some("NO_LICENSE"));
        assert_eq!(failed.ip_address.as_deref(), Some("10.0.0.7"));
        assert_eq!(failed.action, "license_validate");
    }

    #[test]
    fn test_record_swallows_store_failures() {
        let db = Db::new(Database::open_in_memory().unwrap());
        db.call(|db| {
            db.conn().execute_batch("DROP TABLE audit_logs")?;
            Ok(())
        })
        .unwrap();

        let audit = AuditLog::new(db);
        audit.record(
            &Actor::user(UserId::new()),
            AuditAction::DeviceRevoke,
            Resource::Device,
            Uuid::new_v4(),
            Some(DeviceId::new()),
            Err(&OfflineError::DeviceNotFound),
        );
    }
}
