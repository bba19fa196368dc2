//! Per-device validation failure counters.

use rusqlite::{params, OptionalExtension, Transaction};

use lectern_shared::types::{DeviceId, UserId};

use crate::codec;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::DeviceRateLimit;

impl Database {
    pub fn get_rate_limit(&self, device: DeviceId) -> Result<Option<DeviceRateLimit>> {
        let limit = self
            .conn()
            .query_row(
                "SELECT device_id, failed_attempts, blocked_until, last_attempt_at
                 FROM device_rate_limits
                 WHERE device_id = ?1",
                params![device.to_string()],
                row_to_rate_limit,
            )
            .optional()?;
        Ok(limit)
    }

    /// Read-modify-write of a device's counter under `BEGIN IMMEDIATE`.
    ///
    /// `f` receives the stored record (`None` before the first attempt) and
    /// returns the record to persist plus a value handed back to the caller.
    /// Concurrent updates for the same device are serialised by SQLite's write
    /// lock, so no two callers ever start from the same snapshot.
    ///
    /// Only the device's owner moves its counter: fails with
    /// [`StoreError::NotFound`] if the device does not exist or belongs to
    /// someone other than `owner`.
    pub fn update_rate_limit<T>(
        &mut self,
        device: DeviceId,
        owner: UserId,
        f: impl FnOnce(Option<DeviceRateLimit>) -> (DeviceRateLimit, T),
    ) -> Result<T> {
        self.immediate(|tx| {
            let exists: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM devices WHERE id = ?1 AND owner_user_id = ?2)",
                params![device.to_string(), owner.to_string()],
                |row| row.get(0),
            )?;
            if !exists {
                return Err(StoreError::NotFound);
            }

            let current = tx
                .query_row(
                    "SELECT device_id, failed_attempts, blocked_until, last_attempt_at
                     FROM device_rate_limits
                     WHERE device_id = ?1",
                    params![device.to_string()],
                    row_to_rate_limit,
                )
                .optional()?;

            let (next, out) = f(current);
            upsert(tx, &next)?;
            Ok(out)
        })
    }
}

fn upsert(tx: &Transaction<'_>, limit: &DeviceRateLimit) -> Result<()> {
    tx.execute(
        "INSERT INTO device_rate_limits (device_id, failed_attempts, blocked_until, last_attempt_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (device_id) DO UPDATE SET
             failed_attempts = excluded.failed_attempts,
             blocked_until   = excluded.blocked_until,
             last_attempt_at = excluded.last_attempt_at",
        params![
            limit.device_id.to_string(),
            limit.failed_attempts,
            codec::opt_ts(limit.blocked_until),
            codec::ts(limit.last_attempt_at),
        ],
    )?;
    Ok(())
}

fn row_to_rate_limit(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceRateLimit> {
    Ok(DeviceRateLimit {
        device_id: codec::id(row, 0)?,
        failed_attempts: row.get(1)?,
        blocked_until: codec::opt_time(row, 2)?,
        last_attempt_at: codec::time(row, 3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::RegisterOutcome;
    use crate::models::NewDevice;
    use chrono::{Duration, Utc};
    use lectern_shared::types::Platform;

    fn device(db: &mut Database) -> (DeviceId, UserId) {
        let owner = UserId::new();
        let new = NewDevice {
            owner_user_id: owner,
            fingerprint: "r".repeat(32),
            display_name: "Phone".into(),
            platform: Platform::Android,
        };
        match db.register_device_checked(&new, 5, Utc::now()).unwrap() {
            RegisterOutcome::Registered(d) => (d.id, owner),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    fn bump(db: &mut Database, dev: DeviceId, owner: UserId) -> u32 {
        let now = Utc::now();
        db.update_rate_limit(dev, owner, |current| {
            let mut rec = current.unwrap_or_else(|| DeviceRateLimit::fresh(dev, now));
            rec.failed_attempts += 1;
            rec.last_attempt_at = now;
            let n = rec.failed_attempts;
            (rec, n)
        })
        .unwrap()
    }

    #[test]
    fn counter_is_created_lazily() {
        let mut db = Database::open_in_memory().unwrap();
        let (dev, owner) = device(&mut db);
        assert!(db.get_rate_limit(dev).unwrap().is_none());

        assert_eq!(bump(&mut db, dev, owner), 1);
        assert_eq!(bump(&mut db, dev, owner), 2);
        assert_eq!(db.get_rate_limit(dev).unwrap().unwrap().failed_attempts, 2);
    }

    #[test]
    fn block_state_round_trips() {
        let mut db = Database::open_in_memory().unwrap();
        let (dev, owner) = device(&mut db);
        let until = Utc::now() + Duration::hours(1);

        db.update_rate_limit(dev, owner, |_| {
            let mut rec = DeviceRateLimit::fresh(dev, Utc::now());
            rec.failed_attempts = 5;
            rec.blocked_until = Some(until);
            (rec, ())
        })
        .unwrap();

        let rec = db.get_rate_limit(dev).unwrap().unwrap();
        assert_eq!(rec.blocked_until, Some(until));
        assert!(rec.is_blocked_at(Utc::now()));
        assert!(!rec.is_blocked_at(until + Duration::seconds(1)));
    }

    #[test]
    fn unknown_device_is_not_found() {
        let mut db = Database::open_in_memory().unwrap();
        let res = db.update_rate_limit(DeviceId::new(), UserId::new(), |_| {
            (DeviceRateLimit::fresh(DeviceId::new(), Utc::now()), ())
        });
        assert!(matches!(res, Err(StoreError::NotFound)));
    }

    #[test]
    fn only_the_owner_moves_the_counter() {
        let mut db = Database::open_in_memory().unwrap();
        let (dev, owner) = device(&mut db);

        let res = db.update_rate_limit(dev, UserId::new(), |_| {
            let mut rec = DeviceRateLimit::fresh(dev, Utc::now());
            rec.failed_attempts = 99;
            (rec, ())
        });
        assert!(matches!(res, Err(StoreError::NotFound)));
        assert!(db.get_rate_limit(dev).unwrap().is_none());

        assert_eq!(bump(&mut db, dev, owner), 1);
    }

    #[test]
    fn updates_serialise_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limits.db");
        let mut a = Database::open_at(&path).unwrap();
        let (dev, owner) = device(&mut a);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let mut db = Database::open_at(&path).unwrap();
                    for _ in 0..5 {
                        bump(&mut db, dev, owner);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(a.get_rate_limit(dev).unwrap().unwrap().failed_attempts, 20);
    }
}
