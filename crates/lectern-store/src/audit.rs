//! Append-only audit log. There is no update or delete helper, and
//! triggers in the schema reject both.

use rusqlite::params;

use lectern_shared::types::{DeviceId, UserId};

use crate::codec;
use crate::database::Database;
use crate::error::Result;
use crate::models::AuditLogEntry;

const AUDIT_COLUMNS: &str = "id, user_id, device_id, action, resource, resource_id,
     ip_address, user_agent, success, error_code, created_at";

impl Database {
    pub fn insert_audit_entry(&self, entry: &AuditLogEntry) -> Result<()> {
        self.conn().execute(
            "INSERT INTO audit_logs
                (id, user_id, device_id, action, resource, resource_id,
                 ip_address, user_agent, success, error_code, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.id.to_string(),
                entry.user_id.to_string(),
                entry.device_id.map(|d| d.to_string()),
                entry.action,
                entry.resource,
                entry.resource_id.to_string(),
                entry.ip_address,
                entry.user_agent,
                entry.success,
                entry.error_code,
                codec::ts(entry.created_at),
            ],
        )?;
        Ok(())
    }

    /// Entries recorded for `user`, newest first.
    pub fn list_audit_for_user(&self, user: UserId, limit: u32) -> Result<Vec<AuditLogEntry>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_logs
             WHERE user_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![user.to_string(), limit], row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Entries recorded for `device`, newest first.
    pub fn list_audit_for_device(&self, device: DeviceId, limit: u32) -> Result<Vec<AuditLogEntry>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_logs
             WHERE device_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![device.to_string(), limit], row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn count_audit_entries(&self, action: &str, success: bool) -> Result<u64> {
        let n = self.conn().query_row(
            "SELECT COUNT(*) FROM audit_logs WHERE action = ?1 AND success = ?2",
            params![action, success],
            |row| row.get(0),
        )?;
        Ok(n)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    Ok(AuditLogEntry {
        id: codec::id(row, 0)?,
        user_id: codec::id(row, 1)?,
        device_id: codec::opt_id(row, 2)?,
        action: row.get(3)?,
        resource: row.get(4)?,
        resource_id: codec::id(row, 5)?,
        ip_address: row.get(6)?,
        user_agent: row.get(7)?,
        success: row.get(8)?,
        error_code: row.get(9)?,
        created_at: codec::time(row, 10)?,
    })
}
