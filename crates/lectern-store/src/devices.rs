//! CRUD operations for [`Device`] records.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use lectern_shared::types::{DeviceId, UserId};

use crate::codec;
use crate::database::Database;
use crate::error::{conflict_on_unique, not_found, Result, StoreError};
use crate::models::{Device, NewDevice};

const DEVICE_COLUMNS: &str = "id, owner_user_id, fingerprint, display_name, platform,
     registered_at, last_used_at, revoked_at";

/// Result of [`Database::register_device_checked`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered(Device),
    /// The owner already holds `active` non-revoked devices.
    LimitReached { active: u32 },
    /// A non-revoked device with the same fingerprint exists for this owner.
    Duplicate,
}

/// Result of [`Database::revoke_device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked,
    AlreadyRevoked,
    NotFound,
}

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Register a device unless the owner is at `max_active` devices or the
    /// fingerprint is already bound. The limit check and the insert share one
    /// immediate transaction, so two concurrent registrations cannot both
    /// squeeze under the limit.
    pub fn register_device_checked(
        &mut self,
        new: &NewDevice,
        max_active: u32,
        now: DateTime<Utc>,
    ) -> Result<RegisterOutcome> {
        let device = Device {
            id: DeviceId::new(),
            owner_user_id: new.owner_user_id,
            fingerprint: new.fingerprint.clone(),
            display_name: new.display_name.clone(),
            platform: new.platform,
            registered_at: now,
            last_used_at: now,
            revoked_at: None,
        };

        self.immediate(|tx| {
            let active: u32 = tx.query_row(
                "SELECT COUNT(*) FROM devices WHERE owner_user_id = ?1 AND revoked_at IS NULL",
                params![device.owner_user_id.to_string()],
                |row| row.get(0),
            )?;
            if active >= max_active {
                return Ok(RegisterOutcome::LimitReached { active });
            }

            let inserted = tx.execute(
                "INSERT INTO devices
                    (id, owner_user_id, fingerprint, display_name, platform,
                     registered_at, last_used_at, revoked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL)",
                params![
                    device.id.to_string(),
                    device.owner_user_id.to_string(),
                    device.fingerprint,
                    device.display_name,
                    device.platform.as_str(),
                    codec::ts(device.registered_at),
                    codec::ts(device.last_used_at),
                ],
            );

            match inserted.map_err(|e| conflict_on_unique(e, "device fingerprint")) {
                Ok(_) => Ok(RegisterOutcome::Registered(device.clone())),
                Err(StoreError::Conflict(_)) => Ok(RegisterOutcome::Duplicate),
                Err(e) => Err(e),
            }
        })
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_device(&self, id: DeviceId) -> Result<Device> {
        self.conn()
            .query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"),
                params![id.to_string()],
                row_to_device,
            )
            .map_err(not_found)
    }

    /// The device if it exists, belongs to `owner` and is not revoked.
    pub fn active_device_for_owner(&self, owner: UserId, id: DeviceId) -> Result<Option<Device>> {
        let device = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {DEVICE_COLUMNS} FROM devices
                     WHERE id = ?1 AND owner_user_id = ?2 AND revoked_at IS NULL"
                ),
                params![id.to_string(), owner.to_string()],
                row_to_device,
            )
            .optional()?;
        Ok(device)
    }

    /// All devices of `owner`, revoked ones included, newest first.
    pub fn list_devices_for_owner(&self, owner: UserId) -> Result<Vec<Device>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices
             WHERE owner_user_id = ?1
             ORDER BY registered_at DESC, rowid DESC"
        ))?;

        let rows = stmt.query_map(params![owner.to_string()], row_to_device)?;

        let mut devices = Vec::new();
        for row in rows {
            devices.push(row?);
        }
        Ok(devices)
    }

    pub fn count_active_devices(&self, owner: UserId) -> Result<u32> {
        let n = self.conn().query_row(
            "SELECT COUNT(*) FROM devices WHERE owner_user_id = ?1 AND revoked_at IS NULL",
            params![owner.to_string()],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// `false` when the device is missing or revoked.
    pub fn is_device_active(&self, id: DeviceId) -> Result<bool> {
        let active = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM devices WHERE id = ?1 AND revoked_at IS NULL)",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(active)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Refresh `last_used_at`. Returns `false` if no live device matched.
    pub fn touch_device(&self, id: DeviceId, now: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE devices SET last_used_at = ?2 WHERE id = ?1 AND revoked_at IS NULL",
            params![id.to_string(), codec::ts(now)],
        )?;
        Ok(affected > 0)
    }

    /// Soft-delete a device. A revoked device stays revoked; revoking it again
    /// changes nothing.
    pub fn revoke_device(
        &self,
        owner: UserId,
        id: DeviceId,
        now: DateTime<Utc>,
    ) -> Result<RevokeOutcome> {
        let affected = self.conn().execute(
            "UPDATE devices SET revoked_at = ?3
             WHERE id = ?1 AND owner_user_id = ?2 AND revoked_at IS NULL",
            params![id.to_string(), owner.to_string(), codec::ts(now)],
        )?;
        if affected > 0 {
            return Ok(RevokeOutcome::Revoked);
        }

        let exists: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM devices WHERE id = ?1 AND owner_user_id = ?2)",
            params![id.to_string(), owner.to_string()],
            |row| row.get(0),
        )?;
        Ok(if exists {
            RevokeOutcome::AlreadyRevoked
        } else {
            RevokeOutcome::NotFound
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: codec::id(row, 0)?,
        owner_user_id: codec::id(row, 1)?,
        fingerprint: row.get(2)?,
        display_name: row.get(3)?,
        platform: codec::parsed(row, 4)?,
        registered_at: codec::time(row, 5)?,
        last_used_at: codec::time(row, 6)?,
        revoked_at: codec::opt_time(row, 7)?,
    })
}
