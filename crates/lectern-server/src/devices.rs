//! Device Registry: identity, fingerprint binding and revocation.

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lectern_shared::constants::{MAX_DEVICE_NAME_LEN, MAX_FINGERPRINT_LEN, MIN_FINGERPRINT_LEN};
use lectern_shared::types::{DeviceId, Platform};
use lectern_store::{Device, NewDevice, RegisterOutcome, RevokeOutcome};

use crate::audit::{Actor, AuditAction, AuditLog, Resource};
use crate::db::Db;
use crate::error::OfflineError;

fn validate_fingerprint(fingerprint: &str) -> Result<(), OfflineError> {
    if (MIN_FINGERPRINT_LEN..=MAX_FINGERPRINT_LEN).contains(&fingerprint.len()) {
        Ok(())
    } else {
        Err(OfflineError::InvalidFingerprint)
    }
}

fn normalize_name(name: &str) -> Result<String, OfflineError> {
    let name = name.trim();
    if name.is_empty() || name.len() > MAX_DEVICE_NAME_LEN {
        return Err(OfflineError::InvalidDeviceName);
    }
    Ok(name.to_string())
}

#[derive(Clone)]
pub struct DeviceRegistry {
    db: Db,
    audit: AuditLog,
    max_active: u32,
}

impl DeviceRegistry {
    pub fn new(db: Db, audit: AuditLog, max_active: u32) -> Self {
        Self { db, audit, max_active }
    }

    pub fn register(
        &self,
        actor: &Actor,
        fingerprint: &str,
        name: &str,
        platform: Platform,
    ) -> Result<Device, OfflineError> {
        let result = self.try_register(actor, fingerprint, name, platform);
        match &result {
            Ok(device) => {
                info!(device_id = %device.id, user_id = %actor.user_id, %platform, "Device registered");
                self.audit.record(
                    actor,
                    AuditAction::DeviceRegister,
                    Resource::Device,
                    device.id.as_uuid(),
                    Some(device.id),
                    Ok(()),
                );
            }
            Err(e) => {
                warn!(user_id = %actor.user_id, code = e.code(), "Device registration refused");
                self.audit.record(
                    actor,
                    AuditAction::DeviceRegister,
                    Resource::Device,
                    Uuid::nil(),
                    None,
                    Err(e),
                );
            }
        }
        result
    }

    fn try_register(
        &self,
        actor: &Actor,
        fingerprint: &str,
        name: &str,
        platform: Platform,
    ) -> Result<Device, OfflineError> {
        validate_fingerprint(fingerprint)?;
        let display_name = normalize_name(name)?;

        let new = NewDevice {
            owner_user_id: actor.user_id,
            fingerprint: fingerprint.to_string(),
            display_name,
            platform,
        };
        let max = self.max_active;
        match self.db.call(|db| db.register_device_checked(&new, max, Utc::now()))? {
            RegisterOutcome::Registered(device) => Ok(device),
            RegisterOutcome::Duplicate => Err(OfflineError::DuplicateDevice),
            RegisterOutcome::LimitReached { active } => {
                debug!(user_id = %actor.user_id, active, "Device limit reached");
                Err(OfflineError::DeviceLimitExceeded { max })
            }
        }
    }

    /// Revoking an already revoked device succeeds without a second state
    /// change. A device owned by someone else is reported as not found.
    pub fn revoke(&self, actor: &Actor, device_id: DeviceId) -> Result<(), OfflineError> {
        let result = match self
            .db
            .call(|db| db.revoke_device(actor.user_id, device_id, Utc::now()))
        {
            Ok(RevokeOutcome::Revoked) => {
                info!(%device_id, user_id = %actor.user_id, "Device revoked");
                Ok(())
            }
            Ok(RevokeOutcome::AlreadyRevoked) => {
                debug!(%device_id, "Device already revoked");
                Ok(())
            }
            Ok(RevokeOutcome::NotFound) => Err(OfflineError::DeviceNotFound),
            Err(e) => Err(e),
        };

        self.audit.record(
            actor,
            AuditAction::DeviceRevoke,
            Resource::Device,
            device_id.as_uuid(),
            Some(device_id),
            result.as_ref().map(|_| ()),
        );
        result
    }

    /// The caller's devices, newest first.
    pub fn list(&self, actor: &Actor) -> Result<Vec<Device>, OfflineError> {
        self.db.call(|db| db.list_devices_for_owner(actor.user_id))
    }

    /// Refresh `last_used_at`. Failures are logged, never returned.
    pub fn touch(&self, device_id: DeviceId) {
        match self.db.call(|db| db.touch_device(device_id, Utc::now())) {
            Ok(true) => {}
            Ok(false) => debug!(%device_id, "Touch skipped: device not active"),
            Err(e) => warn!(%device_id, error = %e, "Touch failed"),
        }
    }

    pub fn is_active(&self, device_id: DeviceId) -> Result<bool, OfflineError> {
        self.db.call(|db| db.is_device_active(device_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lectern_shared::types::UserId;
    use lectern_store::Database;

    fn registry(max_active: u32) -> (DeviceRegistry, Db) {
        let db = Db::new(Database::open_in_memory().unwrap());
        let audit = AuditLog::new(db.clone());
        (DeviceRegistry::new(db.clone(), audit, max_active), db)
    }

    #[test]
    fn test_register_and_list() {
        let (registry, _) = registry(5);
        let actor = Actor::user(UserId::new());

        let device = registry
            .register(&actor, &"a".repeat(32), "  Pixel 8  ", Platform::Android)
            .unwrap();
        assert_eq!(device.display_name, "Pixel 8");
        assert!(device.is_active());
        assert!(registry.is_active(device.id).unwrap());

        let listed = registry.list(&actor).unwrap();
        assert_eq!(listed, vec![device]);
        assert!(registry.list(&Actor::user(UserId::new())).unwrap().is_empty());
    }

    #[test]
    fn test_validation() {
        let (registry, _) = registry(5);
        let actor = Actor::user(UserId::new());

        assert!(matches!(
            registry.register(&actor, &"a".repeat(31), "Phone", Platform::Ios),
            Err(OfflineError::InvalidFingerprint)
        ));
        assert!(matches!(
            registry.register(&actor, &"a".repeat(513), "Phone", Platform::Ios),
            Err(OfflineError::InvalidFingerprint)
        ));
        assert!(matches!(
            registry.register(&actor, &"a".repeat(32), "   ", Platform::Ios),
            Err(OfflineError::InvalidDeviceName)
        ));
        assert!(matches!(
            registry.register(&actor, &"a".repeat(32), &"n".repeat(256), Platform::Ios),
            Err(OfflineError::InvalidDeviceName)
        ));
        assert!(registry
            .register(&actor, &"a".repeat(512), "Phone", Platform::Ios)
            .is_ok());
    }

    #[test]
    fn test_duplicate_and_reregister_after_revoke() {
        let (registry, _) = registry(5);
        let actor = Actor::user(UserId::new());
        let fp = "f".repeat(40);

        let first = registry.register(&actor, &fp, "Laptop", Platform::Desktop).unwrap();
        assert!(matches!(
            registry.register(&actor, &fp, "Laptop", Platform::Desktop),
            Err(OfflineError::DuplicateDevice)
        ));

        // Another user may bind the same fingerprint.
        registry
            .register(&Actor::user(UserId::new()), &fp, "Laptop", Platform::Desktop)
            .unwrap();

        registry.revoke(&actor, first.id).unwrap();
        let second = registry.register(&actor, &fp, "Laptop", Platform::Desktop).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_device_limit() {
        let (registry, _) = registry(2);
        let actor = Actor::user(UserId::new());

        let a = registry.register(&actor, &"a".repeat(32), "A", Platform::Ios).unwrap();
        registry.register(&actor, &"b".repeat(32), "B", Platform::Ios).unwrap();
        let err = registry
            .register(&actor, &"c".repeat(32), "C", Platform::Ios)
            .unwrap_err();
        assert!(matches!(err, OfflineError::DeviceLimitExceeded { max: 2 }));

        registry.revoke(&actor, a.id).unwrap();
        registry.register(&actor, &"c".repeat(32), "C", Platform::Ios).unwrap();
    }

    #[test]
    fn test_revoke_is_idempotent_and_owner_scoped() {
        let (registry, db) = registry(5);
        let actor = Actor::user(UserId::new());
        let device = registry.register(&actor, &"r".repeat(32), "Tab", Platform::Android).unwrap();

        assert!(matches!(
            registry.revoke(&Actor::user(UserId::new()), device.id),
            Err(OfflineError::DeviceNotFound)
        ));
        assert!(registry.is_active(device.id).unwrap());

        registry.revoke(&actor, device.id).unwrap();
        registry.revoke(&actor, device.id).unwrap();
        assert!(!registry.is_active(device.id).unwrap());
        assert!(!registry.is_active(DeviceId::new()).unwrap());

        let revokes = db.call(|db| db.count_audit_entries("device_revoke", true)).unwrap();
        assert_eq!(revokes, 2);
        let denied = db.call(|db| db.count_audit_entries("device_revoke", false)).unwrap();
        assert_eq!(denied, 1);
    }

    #[test]
    fn test_touch_refreshes_last_used() {
        let (registry, db) = registry(5);
        let actor = Actor::user(UserId::new());
        let device = registry.register(&actor, &"t".repeat(32), "Phone", Platform::Ios).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        registry.touch(device.id);
        let stored = db.call(|db| db.get_device(device.id)).unwrap();
        assert!(stored.last_used_at > device.last_used_at);

        // Unknown device: logged, not returned.
        registry.touch(DeviceId::new());
    }
}
