//! Persistence for wrapped key material: [`MaterialKey`] rows (one per
//! material version) and per-device [`ContentEncryptionKey`] rows.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};

use lectern_shared::constants::DEFAULT_LICENSE_TTL_DAYS;
use lectern_shared::types::{CekId, DeviceId, MaterialId, UserId};

use crate::codec;
use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::{ContentEncryptionKey, MaterialKey};

const CEK_COLUMNS: &str = "id, owner_user_id, material_id, device_id, wrapped_key,
     kek_version, key_version, created_at, expires_at, last_validated_at";

/// Result of [`Database::insert_cek_if_device_active`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CekInsert {
    Inserted(ContentEncryptionKey),
    /// Another request already stored a CEK for the same tuple and version.
    Existing(ContentEncryptionKey),
    /// The device was revoked (or vanished) before the insert.
    DeviceInactive,
}

impl Database {
    // ------------------------------------------------------------------
    // Material keys
    // ------------------------------------------------------------------

    /// Insert a material key. Returns `false` when the version already exists,
    /// leaving the stored row untouched.
    pub fn insert_material_key(&self, key: &MaterialKey) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT INTO material_keys (material_id, key_version, wrapped_key, kek_version, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (material_id, key_version) DO NOTHING",
            params![
                key.material_id.to_string(),
                key.key_version,
                key.wrapped_key,
                key.kek_version,
                codec::ts(key.created_at),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn get_material_key(&self, material: MaterialId, version: u32) -> Result<MaterialKey> {
        self.conn()
            .query_row(
                "SELECT material_id, key_version, wrapped_key, kek_version, created_at
                 FROM material_keys
                 WHERE material_id = ?1 AND key_version = ?2",
                params![material.to_string(), version],
                row_to_material_key,
            )
            .map_err(not_found)
    }

    /// The highest version of `material`, if any key exists.
    pub fn current_material_key(&self, material: MaterialId) -> Result<Option<MaterialKey>> {
        let key = self
            .conn()
            .query_row(
                "SELECT material_id, key_version, wrapped_key, kek_version, created_at
                 FROM material_keys
                 WHERE material_id = ?1
                 ORDER BY key_version DESC
                 LIMIT 1",
                params![material.to_string()],
                row_to_material_key,
            )
            .optional()?;
        Ok(key)
    }

    pub fn list_material_keys(&self) -> Result<Vec<MaterialKey>> {
        let mut stmt = self.conn().prepare(
            "SELECT material_id, key_version, wrapped_key, kek_version, created_at
             FROM material_keys
             ORDER BY material_id, key_version",
        )?;
        let rows = stmt.query_map([], row_to_material_key)?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    /// Replace the wrap of a material key, used by KEK rotation.
    pub fn update_material_key_wrap(
        &self,
        material: MaterialId,
        version: u32,
        wrapped_key: &[u8],
        kek_version: u8,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE material_keys SET wrapped_key = ?3, kek_version = ?4
             WHERE material_id = ?1 AND key_version = ?2",
            params![material.to_string(), version, wrapped_key, kek_version],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Device CEKs
    // ------------------------------------------------------------------

    /// Persist `cek` only if its device is still live and owned by
    /// `cek.owner_user_id`. The liveness re-check and the insert run in one
    /// immediate transaction, so a concurrent revocation either lands before
    /// (and the insert is refused) or after (and sees the new row).
    ///
    /// A concurrent insert for the same tuple and version is not an error:
    /// the winner's row is returned as [`CekInsert::Existing`].
    pub fn insert_cek_if_device_active(&mut self, cek: &ContentEncryptionKey) -> Result<CekInsert> {
        self.immediate(|tx| {
            let live: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM devices
                               WHERE id = ?1 AND owner_user_id = ?2 AND revoked_at IS NULL)",
                params![cek.device_id.to_string(), cek.owner_user_id.to_string()],
                |row| row.get(0),
            )?;
            if !live {
                return Ok(CekInsert::DeviceInactive);
            }

            let affected = tx.execute(
                "INSERT INTO offline_ceks
                    (id, owner_user_id, material_id, device_id, wrapped_key,
                     kek_version, key_version, created_at, expires_at, last_validated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (owner_user_id, material_id, device_id, key_version) DO NOTHING",
                params![
                    cek.id.to_string(),
                    cek.owner_user_id.to_string(),
                    cek.material_id.to_string(),
                    cek.device_id.to_string(),
                    cek.wrapped_key,
                    cek.kek_version,
                    cek.key_version,
                    codec::ts(cek.created_at),
                    codec::ts(cek.expires_at),
                    codec::ts(cek.last_validated_at),
                ],
            )?;
            if affected > 0 {
                return Ok(CekInsert::Inserted(cek.clone()));
            }

            let winner = tx.query_row(
                &format!(
                    "SELECT {CEK_COLUMNS} FROM offline_ceks
                     WHERE owner_user_id = ?1 AND material_id = ?2 AND device_id = ?3
                       AND key_version = ?4"
                ),
                params![
                    cek.owner_user_id.to_string(),
                    cek.material_id.to_string(),
                    cek.device_id.to_string(),
                    cek.key_version,
                ],
                row_to_cek,
            )?;
            Ok(CekInsert::Existing(winner))
        })
    }

    pub fn get_cek(&self, id: CekId) -> Result<ContentEncryptionKey> {
        self.conn()
            .query_row(
                &format!("SELECT {CEK_COLUMNS} FROM offline_ceks WHERE id = ?1"),
                params![id.to_string()],
                row_to_cek,
            )
            .map_err(not_found)
    }

    /// The live CEK of a tuple: its row with the highest key version.
    pub fn get_live_cek(
        &self,
        owner: UserId,
        material: MaterialId,
        device: DeviceId,
    ) -> Result<Option<ContentEncryptionKey>> {
        let cek = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {CEK_COLUMNS} FROM offline_ceks
                     WHERE owner_user_id = ?1 AND material_id = ?2 AND device_id = ?3
                     ORDER BY key_version DESC
                     LIMIT 1"
                ),
                params![owner.to_string(), material.to_string(), device.to_string()],
                row_to_cek,
            )
            .optional()?;
        Ok(cek)
    }

    /// Every CEK row of a tuple, oldest version first.
    pub fn list_ceks_for_tuple(
        &self,
        owner: UserId,
        material: MaterialId,
        device: DeviceId,
    ) -> Result<Vec<ContentEncryptionKey>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CEK_COLUMNS} FROM offline_ceks
             WHERE owner_user_id = ?1 AND material_id = ?2 AND device_id = ?3
             ORDER BY key_version ASC"
        ))?;
        let rows = stmt.query_map(
            params![owner.to_string(), material.to_string(), device.to_string()],
            row_to_cek,
        )?;

        let mut ceks = Vec::new();
        for row in rows {
            ceks.push(row?);
        }
        Ok(ceks)
    }

    pub fn list_all_ceks(&self) -> Result<Vec<ContentEncryptionKey>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT {CEK_COLUMNS} FROM offline_ceks ORDER BY rowid"))?;
        let rows = stmt.query_map([], row_to_cek)?;

        let mut ceks = Vec::new();
        for row in rows {
            ceks.push(row?);
        }
        Ok(ceks)
    }

    /// Stamp a successful validation, restarting the offline grace period.
    pub fn record_license_validation(&self, id: CekId, now: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE offline_ceks SET last_validated_at = ?2 WHERE id = ?1",
            params![id.to_string(), codec::ts(now)],
        )?;
        Ok(affected > 0)
    }

    /// Extend a license to `expires_at` and restart its grace period, only
    /// while its device is live and owned by `owner`. One statement, so a
    /// concurrent revocation either wins outright or sees the renewed row.
    pub fn renew_license_if_device_active(
        &self,
        id: CekId,
        owner: UserId,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE offline_ceks SET expires_at = ?3, last_validated_at = ?4
             WHERE id = ?1 AND owner_user_id = ?2
               AND EXISTS (SELECT 1 FROM devices d
                           WHERE d.id = offline_ceks.device_id
                             AND d.owner_user_id = ?2
                             AND d.revoked_at IS NULL)",
            params![id.to_string(), owner.to_string(), codec::ts(expires_at), codec::ts(now)],
        )?;
        Ok(affected > 0)
    }

    /// Replace the wrap of a CEK row, used by KEK rotation.
    pub fn update_cek_wrap(&self, id: CekId, wrapped_key: &[u8], kek_version: u8) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE offline_ceks SET wrapped_key = ?2, kek_version = ?3 WHERE id = ?1",
            params![id.to_string(), wrapped_key, kek_version],
        )?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Build a CEK row for `device` at `key_version`, stamped `now`, carrying a
/// license of the default term. Callers with a configured term overwrite
/// `expires_at`.
pub fn new_cek(
    owner: UserId,
    material: MaterialId,
    device: DeviceId,
    wrapped_key: Vec<u8>,
    kek_version: u8,
    key_version: u32,
    now: DateTime<Utc>,
) -> ContentEncryptionKey {
    ContentEncryptionKey {
        id: CekId::new(),
        owner_user_id: owner,
        material_id: material,
        device_id: device,
        wrapped_key,
        kek_version,
        key_version,
        created_at: now,
        expires_at: now + Duration::days(DEFAULT_LICENSE_TTL_DAYS as i64),
        last_validated_at: now,
    }
}

fn row_to_material_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<MaterialKey> {
    Ok(MaterialKey {
        material_id: codec::id(row, 0)?,
        key_version: row.get(1)?,
        wrapped_key: row.get(2)?,
        kek_version: row.get(3)?,
        created_at: codec::time(row, 4)?,
    })
}

fn row_to_cek(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContentEncryptionKey> {
    Ok(ContentEncryptionKey {
        id: codec::id(row, 0)?,
        owner_user_id: codec::id(row, 1)?,
        material_id: codec::id(row, 2)?,
        device_id: codec::id(row, 3)?,
        wrapped_key: row.get(4)?,
        kek_version: row.get(5)?,
        key_version: row.get(6)?,
        created_at: codec::time(row, 7)?,
        expires_at: codec::time(row, 8)?,
        last_validated_at: codec::time(row, 9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::RegisterOutcome;
    use crate::models::NewDevice;
    use crate::StoreError;
    use lectern_shared::types::Platform;

    fn device(db: &mut Database, owner: UserId) -> DeviceId {
        let new = NewDevice {
            owner_user_id: owner,
            fingerprint: format!("{:0>32}", DeviceId::new()),
            display_name: "Laptop".into(),
            platform: Platform::Desktop,
        };
        match db.register_device_checked(&new, 5, Utc::now()).unwrap() {
            RegisterOutcome::Registered(d) => d.id,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    fn material_key(material: MaterialId, version: u32) -> MaterialKey {
        MaterialKey {
            material_id: material,
            key_version: version,
            wrapped_key: vec![version as u8; 8],
            kek_version: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn material_key_versions() {
        let db = Database::open_in_memory().unwrap();
        let material = MaterialId::new();
        assert!(db.current_material_key(material).unwrap().is_none());

        assert!(db.insert_material_key(&material_key(material, 1)).unwrap());
        assert!(db.insert_material_key(&material_key(material, 2)).unwrap());
        assert!(!db.insert_material_key(&material_key(material, 2)).unwrap());

        let current = db.current_material_key(material).unwrap().unwrap();
        assert_eq!(current.key_version, 2);
        assert_eq!(db.get_material_key(material, 1).unwrap().wrapped_key, vec![1; 8]);
        assert!(matches!(
            db.get_material_key(material, 3),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn cek_insert_is_idempotent_per_version() {
        let mut db = Database::open_in_memory().unwrap();
        let owner = UserId::new();
        let dev = device(&mut db, owner);
        let material = MaterialId::new();

        let first = new_cek(owner, material, dev, vec![1; 8], 1, 1, Utc::now());
        let second = new_cek(owner, material, dev, vec![2; 8], 1, 1, Utc::now());

        assert_eq!(
            db.insert_cek_if_device_active(&first).unwrap(),
            CekInsert::Inserted(first.clone())
        );
        match db.insert_cek_if_device_active(&second).unwrap() {
            CekInsert::Existing(winner) => assert_eq!(winner.id, first.id),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(db.list_ceks_for_tuple(owner, material, dev).unwrap().len(), 1);
    }

    #[test]
    fn live_cek_is_highest_version() {
        let mut db = Database::open_in_memory().unwrap();
        let owner = UserId::new();
        let dev = device(&mut db, owner);
        let material = MaterialId::new();

        let v1 = new_cek(owner, material, dev, vec![1; 8], 1, 1, Utc::now());
        let v2 = new_cek(owner, material, dev, vec![2; 8], 1, 2, Utc::now());
        db.insert_cek_if_device_active(&v1).unwrap();
        db.insert_cek_if_device_active(&v2).unwrap();

        let live = db.get_live_cek(owner, material, dev).unwrap().unwrap();
        assert_eq!(live.id, v2.id);
        assert_eq!(db.get_cek(v1.id).unwrap().key_version, 1);
        assert!(db.get_live_cek(UserId::new(), material, dev).unwrap().is_none());
    }

    #[test]
    fn revoked_device_refuses_cek() {
        let mut db = Database::open_in_memory().unwrap();
        let owner = UserId::new();
        let dev = device(&mut db, owner);
        db.revoke_device(owner, dev, Utc::now()).unwrap();

        let cek = new_cek(owner, MaterialId::new(), dev, vec![1; 8], 1, 1, Utc::now());
        assert_eq!(
            db.insert_cek_if_device_active(&cek).unwrap(),
            CekInsert::DeviceInactive
        );

        // Wrong owner behaves like a missing device.
        let other = UserId::new();
        let live_dev = device(&mut db, owner);
        let cek = new_cek(other, MaterialId::new(), live_dev, vec![1; 8], 1, 1, Utc::now());
        assert_eq!(
            db.insert_cek_if_device_active(&cek).unwrap(),
            CekInsert::DeviceInactive
        );
        assert!(db.list_all_ceks().unwrap().is_empty());
    }

    #[test]
    fn license_terms_round_trip_and_renew() {
        let mut db = Database::open_in_memory().unwrap();
        let owner = UserId::new();
        let dev = device(&mut db, owner);
        let material = MaterialId::new();
        let now = Utc::now();

        let cek = new_cek(owner, material, dev, vec![1; 8], 1, 1, now);
        assert_eq!(cek.expires_at, now + Duration::days(30));
        db.insert_cek_if_device_active(&cek).unwrap();

        let stored = db.get_cek(cek.id).unwrap();
        assert_eq!(stored.expires_at, cek.expires_at);
        assert_eq!(stored.last_validated_at, now);
        assert!(!stored.is_expired_at(now));
        assert!(stored.is_expired_at(cek.expires_at));
        assert!(stored.grace_lapsed_at(now + Duration::hours(73), Duration::hours(72)));

        let later = now + Duration::hours(10);
        assert!(db.record_license_validation(cek.id, later).unwrap());
        assert_eq!(db.get_cek(cek.id).unwrap().last_validated_at, later);

        let extended = later + Duration::days(30);
        assert!(db.renew_license_if_device_active(cek.id, owner, extended, later).unwrap());
        assert_eq!(db.get_cek(cek.id).unwrap().expires_at, extended);

        // Someone else's id, or a revoked device, leaves the row alone.
        assert!(!db
            .renew_license_if_device_active(cek.id, UserId::new(), now, now)
            .unwrap());
        db.revoke_device(owner, dev, Utc::now()).unwrap();
        assert!(!db.renew_license_if_device_active(cek.id, owner, now, now).unwrap());
        assert_eq!(db.get_cek(cek.id).unwrap().expires_at, extended);
    }

    #[test]
    fn rewrap_updates_in_place() {
        let mut db = Database::open_in_memory().unwrap();
        let owner = UserId::new();
        let dev = device(&mut db, owner);
        let material = MaterialId::new();
        db.insert_material_key(&material_key(material, 1)).unwrap();
        let cek = new_cek(owner, material, dev, vec![1; 8], 1, 1, Utc::now());
        db.insert_cek_if_device_active(&cek).unwrap();

        assert!(db.update_material_key_wrap(material, 1, &[9; 8], 2).unwrap());
        assert!(db.update_cek_wrap(cek.id, &[7; 8], 2).unwrap());

        let key = db.get_material_key(material, 1).unwrap();
        assert_eq!((key.wrapped_key, key.kek_version), (vec![9; 8], 2));
        let cek = db.get_cek(cek.id).unwrap();
        assert_eq!((cek.wrapped_key, cek.kek_version), (vec![7; 8], 2));
        assert_eq!(db.list_material_keys().unwrap().len(), 1);
    }
}
