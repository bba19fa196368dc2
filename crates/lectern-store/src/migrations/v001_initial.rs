//! v001 -- Initial schema creation.
//!
//! Creates the core tables: `devices`, `material_keys`, `offline_ceks`,
//! `encryption_jobs`, `device_rate_limits` and `audit_logs`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
///
/// Timestamps are RFC-3339 UTC strings with fixed nanosecond precision, so
/// lexical order equals chronological order.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Devices
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS devices (
    id            TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    owner_user_id TEXT NOT NULL,               -- UUID of the owning user
    fingerprint   TEXT NOT NULL,               -- opaque, >= 32 bytes
    display_name  TEXT NOT NULL,
    platform      TEXT NOT NULL CHECK (platform IN ('ios', 'android', 'desktop')),
    registered_at TEXT NOT NULL,
    last_used_at  TEXT NOT NULL,
    revoked_at    TEXT                         -- soft delete
);

-- A fingerprint may be registered again once its previous row is revoked.
CREATE UNIQUE INDEX IF NOT EXISTS idx_devices_owner_fingerprint_live
    ON devices(owner_user_id, fingerprint)
    WHERE revoked_at IS NULL;

CREATE INDEX IF NOT EXISTS idx_devices_owner ON devices(owner_user_id);

-- ----------------------------------------------------------------
-- Material keys: one content key per (material, version), wrapped
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS material_keys (
    material_id TEXT NOT NULL,
    key_version INTEGER NOT NULL CHECK (key_version >= 1),
    wrapped_key BLOB NOT NULL,                 -- ciphertext under the KEK
    kek_version INTEGER NOT NULL,
    created_at  TEXT NOT NULL,

    PRIMARY KEY (material_id, key_version)
);

-- ----------------------------------------------------------------
-- Per-device CEK rows (append-only across key versions)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS offline_ceks (
    id            TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    owner_user_id TEXT NOT NULL,
    material_id   TEXT NOT NULL,
    device_id     TEXT NOT NULL,               -- FK -> devices(id)
    wrapped_key   BLOB NOT NULL,               -- never leaves the server
    kek_version   INTEGER NOT NULL,
    key_version   INTEGER NOT NULL CHECK (key_version >= 1),
    created_at    TEXT NOT NULL,

    UNIQUE (owner_user_id, material_id, device_id, key_version),
    FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_ceks_tuple
    ON offline_ceks(owner_user_id, material_id, device_id, key_version DESC);

-- ----------------------------------------------------------------
-- Encryption jobs
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS encryption_jobs (
    id            TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    material_id   TEXT NOT NULL,
    key_version   INTEGER NOT NULL CHECK (key_version >= 1),
    owner_user_id TEXT NOT NULL,
    device_id     TEXT NOT NULL,               -- FK -> devices(id)
    license_id    TEXT NOT NULL,               -- CEK row that requested the job
    priority      INTEGER NOT NULL CHECK (priority BETWEEN 1 AND 3),
    status        TEXT NOT NULL CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    error         TEXT,
    retry_count   INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    claim_token   TEXT,                        -- set per claim, guards complete/fail
    created_at    TEXT NOT NULL,
    started_at    TEXT,
    completed_at  TEXT,

    FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE
);

-- At most one unfinished job per artifact.
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_open_per_version
    ON encryption_jobs(material_id, key_version)
    WHERE status <> 'completed';

CREATE INDEX IF NOT EXISTS idx_jobs_queue
    ON encryption_jobs(status, priority, created_at);

-- ----------------------------------------------------------------
-- Device rate limits
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS device_rate_limits (
    device_id       TEXT PRIMARY KEY NOT NULL, -- FK -> devices(id)
    failed_attempts INTEGER NOT NULL DEFAULT 0 CHECK (failed_attempts >= 0),
    blocked_until   TEXT,
    last_attempt_at TEXT NOT NULL,

    FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Audit log (append-only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS audit_logs (
    id          TEXT PRIMARY KEY NOT NULL,     -- UUID v4
    user_id     TEXT NOT NULL,
    device_id   TEXT,                          -- no FK: entries outlive devices
    action      TEXT NOT NULL,
    resource    TEXT NOT NULL,
    resource_id TEXT NOT NULL,
    ip_address  TEXT,
    user_agent  TEXT,
    success     INTEGER NOT NULL,              -- boolean 0/1
    error_code  TEXT,
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_user_ts ON audit_logs(user_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_audit_device_ts ON audit_logs(device_id, created_at DESC);

CREATE TRIGGER IF NOT EXISTS audit_logs_no_update
    BEFORE UPDATE ON audit_logs
BEGIN
    SELECT RAISE(ABORT, 'audit_logs is append-only');
END;

CREATE TRIGGER IF NOT EXISTS audit_logs_no_delete
    BEFORE DELETE ON audit_logs
BEGIN
    SELECT RAISE(ABORT, 'audit_logs is append-only');
END;
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
