use rusqlite::Connection;

// Requests that attached to an existing job instead of creating a new one.
const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS job_subscribers (
    job_id        TEXT NOT NULL,               -- FK -> encryption_jobs(id)
    owner_user_id TEXT NOT NULL,
    device_id     TEXT NOT NULL,               -- FK -> devices(id)
    cek_id        TEXT NOT NULL,               -- CEK row of the attached request
    attached_at   TEXT NOT NULL,

    PRIMARY KEY (job_id, cek_id),
    FOREIGN KEY (job_id) REFERENCES encryption_jobs(id) ON DELETE CASCADE,
    FOREIGN KEY (device_id) REFERENCES devices(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_job_subscribers_owner ON job_subscribers(owner_user_id);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
