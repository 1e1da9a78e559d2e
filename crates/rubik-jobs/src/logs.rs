use std::sync::{Mutex, MutexGuard};

use rubik_core::{db_now, to_db_time};
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::init_log_db;
use crate::error::Result;
use crate::types::JobId;

/// Append-only store of job output, one text blob per job.
///
/// Independent of [`crate::store::JobStore`]: it may sit in its own database
/// file. A row is created by the first append. Each job has exactly one
/// writer (its worker task); the mutex serialises appends from different
/// jobs.
pub struct LogSink {
    db: Mutex<Connection>,
}

impl LogSink {
    pub fn new(conn: Connection) -> Result<Self> {
        init_log_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append `text` exactly as given (callers include the newline).
    pub fn append(&self, job_id: &JobId, text: &str) -> Result<()> {
        let db = self.conn();
        db.execute(
            "INSERT INTO job_logs (job_id, content, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (job_id) DO UPDATE
                SET content = content || excluded.content,
                    updated_at = excluded.updated_at",
            params![job_id.as_str(), text, to_db_time(&db_now())],
        )?;
        Ok(())
    }

    /// Full accumulated output; empty when the job never printed anything.
    pub fn get(&self, job_id: &JobId) -> Result<String> {
        let db = self.conn();
        let content = db
            .query_row(
                "SELECT content FROM job_logs WHERE job_id = ?1",
                [job_id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(content.unwrap_or_default())
    }

    /// The last `lines` lines of output, oldest first.
    pub fn tail(&self, job_id: &JobId, lines: usize) -> Result<Vec<String>> {
        let content = self.get(job_id)?;
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        Ok(all[start..].iter().map(|s| s.to_string()).collect())
    }
}
