use std::time::Duration;

use rusqlite::Connection;

use crate::error::Result;

/// How long a writer waits on a lock held by another connection or process.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialise the `jobs` table.
///
/// The partial unique index is what makes "one running job per type" hold
/// across connections and orchestrator restarts: a second `running` row for
/// the same `job_type` is rejected by SQLite itself.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id           TEXT NOT NULL PRIMARY KEY,
            job_type     TEXT NOT NULL,
            status       TEXT NOT NULL,          -- running | completed | failed | stopped
            triggered_by TEXT NOT NULL,          -- manual | auto
            details      TEXT NOT NULL DEFAULT '{}',
            started_at   TEXT NOT NULL,
            finished_at  TEXT
        ) STRICT;

        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_one_running
            ON jobs (job_type) WHERE status = 'running';
        CREATE INDEX IF NOT EXISTS idx_jobs_started
            ON jobs (started_at DESC);
        ",
    )?;
    Ok(())
}

/// Initialise the `job_logs` table. May live in a separate database file.
pub fn init_log_db(conn: &Connection) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS job_logs (
            job_id     TEXT NOT NULL PRIMARY KEY,
            content    TEXT NOT NULL,
            updated_at TEXT NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
