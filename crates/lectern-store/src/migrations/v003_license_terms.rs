//! License terms on CEK rows: an expiry and the time of the last successful
//! validation, which bounds how long a device may stay offline.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection};

use lectern_shared::constants::DEFAULT_LICENSE_TTL_DAYS;

use crate::codec;

const UP_SQL: &str = r#"
ALTER TABLE offline_ceks ADD COLUMN expires_at        TEXT NOT NULL DEFAULT '';
ALTER TABLE offline_ceks ADD COLUMN last_validated_at TEXT NOT NULL DEFAULT '';
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)?;

    // Existing rows get the default term, counted from their creation.
    let rows: Vec<(String, String)> = {
        let mut stmt = conn.prepare("SELECT id, created_at FROM offline_ceks")?;
        let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        mapped.collect::<Result<_, _>>()?
    };
    for (id, created_at) in rows {
        let created = DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;
        let expires = created + Duration::days(DEFAULT_LICENSE_TTL_DAYS as i64);
        conn.execute(
            "UPDATE offline_ceks SET expires_at = ?2, last_validated_at = ?3 WHERE id = ?1",
            params![id, codec::ts(expires), created_at],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::{v001_initial, v002_job_subscribers};

    #[test]
    fn backfills_existing_rows() {
        let conn = Connection::open_in_memory().unwrap();
        v001_initial::up(&conn).unwrap();
        v002_job_subscribers::up(&conn).unwrap();

        let created = Utc::now();
        conn.execute(
            "INSERT INTO offline_ceks
                (id, owner_user_id, material_id, device_id, wrapped_key,
                 kek_version, key_version, created_at)
             VALUES ('c1', 'u1', 'm1', 'd1', x'00', 1, 1, ?1)",
            params![codec::ts(created)],
        )
        .unwrap();

        up(&conn).unwrap();

        let (expires, validated): (String, String) = conn
            .query_row(
                "SELECT expires_at, last_validated_at FROM offline_ceks WHERE id = 'c1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(expires, codec::ts(created + Duration::days(30)));
        assert_eq!(validated, codec::ts(created));
    }
}
