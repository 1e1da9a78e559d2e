use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// `schedule_value` holds the JSON parameters for `schedule_type`; a row
/// whose pair no longer parses is skipped at load time, not rejected here.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schedules (
            id              TEXT    NOT NULL PRIMARY KEY,
            job_type        TEXT    NOT NULL,
            schedule_type   TEXT    NOT NULL,   -- daily | weekly | interval | cron
            schedule_value  TEXT    NOT NULL,   -- JSON parameters
            is_active       INTEGER NOT NULL DEFAULT 1,
            next_run_at     TEXT,               -- NULL while inactive
            last_run_at     TEXT,               -- last claimed fire instant
            anchor_at       TEXT    NOT NULL,   -- interval reference point
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_schedules_active ON schedules (is_active);
        CREATE INDEX IF NOT EXISTS idx_schedules_job_type ON schedules (job_type);
        ",
    )?;
    Ok(())
}
