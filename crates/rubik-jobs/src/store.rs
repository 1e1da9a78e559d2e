use std::sync::{Mutex, MutexGuard};

use rubik_core::{db_now, from_db_time, to_db_time, TriggeredBy};
use rusqlite::{params, types::Value, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, instrument, warn};

use crate::db::init_db;
use crate::error::{JobError, Result};
use crate::progress::ProgressUpdate;
use crate::types::{
    ExitInfo, ExitOutcome, Job, JobDetails, JobFilter, JobId, JobStatus, DEFAULT_LIST_LIMIT,
};

const JOB_COLUMNS: &str = "id, job_type, status, triggered_by, details, started_at, finished_at";

/// Persistent table of job records.
///
/// Every status change goes through an `IMMEDIATE` transaction that re-reads
/// the row first, so the rules below hold even when the writer racing us is
/// another orchestrator process on the same database file:
///
/// - at most one `running` job per type,
/// - `running` is the only state that can change status,
/// - a `stopped` record keeps that status no matter what the worker reports.
pub struct JobStore {
    db: Mutex<Connection>,
}

impl JobStore {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Atomically check that no job of `job_type` is running and insert a new
    /// `running` record.
    #[instrument(skip(self))]
    pub fn create_running(&self, job_type: &str, triggered_by: TriggeredBy) -> Result<Job> {
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = running_in(&tx, job_type)? {
            return Err(JobError::AlreadyRunning {
                job_type: job_type.to_string(),
                running_id: existing.id.to_string(),
            });
        }

        let job = Job {
            id: JobId::new(),
            job_type: job_type.to_string(),
            status: JobStatus::Running,
            triggered_by,
            started_at: db_now(),
            finished_at: None,
            details: JobDetails::default(),
        };
        let details = serde_json::to_string(&job.details)?;

        let inserted = tx.execute(
            "INSERT INTO jobs (id, job_type, status, triggered_by, details, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
            params![
                job.id.as_str(),
                job.job_type,
                job.status.as_str(),
                job.triggered_by.as_str(),
                details,
                to_db_time(&job.started_at),
            ],
        );
        match inserted {
            Ok(_) => {}
            // The partial unique index caught a writer the SELECT above missed.
            Err(e) if is_unique_violation(&e) => {
                return Err(JobError::AlreadyRunning {
                    job_type: job_type.to_string(),
                    running_id: "unknown".to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;

        debug!(job_id = %job.id, "job record created");
        Ok(job)
    }

    pub fn find(&self, id: &JobId) -> Result<Option<Job>> {
        let db = self.conn();
        find_in(&db, id)
    }

    pub fn get(&self, id: &JobId) -> Result<Job> {
        self.find(id)?.ok_or_else(|| JobError::JobNotFound { id: id.to_string() })
    }

    /// The running job of `job_type`, if any.
    pub fn running(&self, job_type: &str) -> Result<Option<Job>> {
        let db = self.conn();
        running_in(&db, job_type)
    }

    /// Most recently started job of `job_type`.
    pub fn latest(&self, job_type: &str) -> Result<Option<Job>> {
        let db = self.conn();
        let job = db
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE job_type = ?1
                     ORDER BY started_at DESC, id DESC LIMIT 1"
                ),
                [job_type],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// All jobs currently recorded as `running`, oldest first.
    pub fn list_running(&self) -> Result<Vec<Job>> {
        let db = self.conn();
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'running' ORDER BY started_at"
        ))?;
        let jobs = decoded(stmt.query_map([], row_to_job)?);
        Ok(jobs)
    }

    /// Newest-first listing with optional filters.
    #[instrument(skip(self))]
    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE 1 = 1");
        let mut args: Vec<Value> = Vec::new();

        if let Some(ref job_type) = filter.job_type {
            args.push(Value::Text(job_type.clone()));
            sql.push_str(&format!(" AND job_type = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(Value::Text(status.as_str().to_string()));
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(triggered_by) = filter.triggered_by {
            args.push(Value::Text(triggered_by.as_str().to_string()));
            sql.push_str(&format!(" AND triggered_by = ?{}", args.len()));
        }
        let limit = filter.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        args.push(Value::Integer(limit as i64));
        sql.push_str(&format!(
            " ORDER BY started_at DESC, id DESC LIMIT ?{}",
            args.len()
        ));

        let db = self.conn();
        let mut stmt = db.prepare(&sql)?;
        let jobs = decoded(stmt.query_map(rusqlite::params_from_iter(args), row_to_job)?);
        Ok(jobs)
    }

    /// Record the worker's pid so a stop request can find the process even
    /// after this orchestrator restarts.
    pub fn set_pid(&self, id: &JobId, pid: u32) -> Result<Job> {
        self.mutate(id, |job| {
            job.details.pid = Some(pid);
            true
        })
        .map(|(job, _)| job)
    }

    /// Merge a worker-reported progress update. Ignored once terminal.
    pub fn update_progress(&self, id: &JobId, update: ProgressUpdate) -> Result<Job> {
        self.mutate(id, |job| {
            if job.status.is_terminal() {
                return false;
            }
            update.apply(job.details.progress.get_or_insert_with(Default::default));
            true
        })
        .map(|(job, _)| job)
    }

    /// Exit handler write. `running` becomes `completed` or `failed`; a
    /// `stopped` record only gains the exit information and finish time.
    #[instrument(skip(self))]
    pub fn finalize(&self, id: &JobId, outcome: &ExitOutcome) -> Result<Job> {
        self.mutate(id, |job| {
            let now = db_now();
            match job.status {
                JobStatus::Running => {
                    match outcome {
                        ExitOutcome::Exited(exit) => {
                            job.status = if exit.success() {
                                JobStatus::Completed
                            } else {
                                JobStatus::Failed
                            };
                            job.details.attach_exit(exit);
                        }
                        ExitOutcome::Error(reason) => {
                            job.status = JobStatus::Failed;
                            job.details.error = Some(reason.clone());
                        }
                    }
                    job.finished_at = Some(now);
                    true
                }
                JobStatus::Stopped => {
                    match outcome {
                        ExitOutcome::Exited(exit) => job.details.attach_exit(exit),
                        ExitOutcome::Error(reason) => {
                            job.details.error.get_or_insert_with(|| reason.clone());
                        }
                    }
                    job.finished_at = Some(now);
                    info!(job_id = %job.id, "job already stopped; exit recorded without status change");
                    true
                }
                JobStatus::Completed | JobStatus::Failed => false,
            }
        })
        .map(|(job, _)| job)
    }

    /// Flip a running job to `stopped`. Returns `None` when the job was not
    /// running at the moment of the write.
    #[instrument(skip(self))]
    pub fn mark_stopped(&self, id: &JobId) -> Result<Option<Job>> {
        let (job, changed) = self.mutate(id, |job| {
            if job.status != JobStatus::Running {
                return false;
            }
            job.status = JobStatus::Stopped;
            job.finished_at = Some(db_now());
            job.details.stopped = true;
            true
        })?;
        Ok(changed.then_some(job))
    }

    /// Attach post-termination information to a job that is already terminal.
    pub fn attach_exit(&self, id: &JobId, exit: Option<ExitInfo>) -> Result<Job> {
        self.mutate(id, |job| {
            if !job.status.is_terminal() {
                return false;
            }
            if let Some(ref exit) = exit {
                job.details.attach_exit(exit);
            }
            job.finished_at = Some(db_now());
            true
        })
        .map(|(job, _)| job)
    }

    pub fn record_error(&self, id: &JobId, reason: &str) -> Result<Job> {
        self.mutate(id, |job| {
            job.details.error = Some(reason.to_string());
            true
        })
        .map(|(job, _)| job)
    }

    /// Close a job without touching any process. Terminal jobs are returned
    /// exactly as stored.
    #[instrument(skip(self))]
    pub fn force_stop(&self, id: &JobId) -> Result<Job> {
        let (job, changed) = self.mutate(id, |job| {
            if job.status.is_terminal() {
                return false;
            }
            job.status = JobStatus::Stopped;
            job.finished_at = Some(db_now());
            job.details.stopped = true;
            job.details.force_stopped = true;
            true
        })?;
        if changed {
            warn!(job_id = %id, job_type = %job.job_type, "job force-marked stopped");
        }
        Ok(job)
    }

    // --- private helpers ---------------------------------------------------

    /// Read-modify-write one record inside an `IMMEDIATE` transaction.
    /// `apply` returns whether it changed anything worth writing.
    fn mutate<F>(&self, id: &JobId, apply: F) -> Result<(Job, bool)>
    where
        F: FnOnce(&mut Job) -> bool,
    {
        let mut db = self.conn();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut job = find_in(&tx, id)?.ok_or_else(|| JobError::JobNotFound { id: id.to_string() })?;
        let changed = apply(&mut job);
        if changed {
            let details = serde_json::to_string(&job.details)?;
            tx.execute(
                "UPDATE jobs SET status = ?1, finished_at = ?2, details = ?3 WHERE id = ?4",
                params![
                    job.status.as_str(),
                    job.finished_at.as_ref().map(to_db_time),
                    details,
                    id.as_str(),
                ],
            )?;
            tx.commit()?;
        }
        Ok((job, changed))
    }
}

fn find_in(conn: &Connection, id: &JobId) -> Result<Option<Job>> {
    let job = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            [id.as_str()],
            row_to_job,
        )
        .optional()?;
    Ok(job)
}

fn running_in(conn: &Connection, job_type: &str) -> Result<Option<Job>> {
    let job = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_type = ?1 AND status = 'running'"),
            [job_type],
            row_to_job,
        )
        .optional()?;
    Ok(job)
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Map a SQLite row to a `Job`.
/// Keep the rows that decode; log the rest instead of failing the listing.
fn decoded(rows: impl Iterator<Item = rusqlite::Result<Job>>) -> Vec<Job> {
    rows.filter_map(|row| match row {
        Ok(job) => Some(job),
        Err(e) => {
            warn!("skipping unreadable job row: {e}");
            None
        }
    })
    .collect()
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let id: String = row.get(0)?;

    let status: String = row.get(2)?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| conversion_error(2, e))?;

    let triggered_by: String = row.get(3)?;
    let triggered_by = triggered_by
        .parse::<TriggeredBy>()
        .map_err(|e| conversion_error(3, e.to_string()))?;

    // A hand-edited or legacy details blob should not hide the job itself.
    let details: String = row.get(4)?;
    let details = serde_json::from_str(&details).unwrap_or_else(|e| {
        warn!(job_id = %id, "unreadable job details, using empty: {e}");
        JobDetails::default()
    });

    let started_at: String = row.get(5)?;
    let started_at =
        from_db_time(&started_at).ok_or_else(|| conversion_error(5, format!("bad timestamp: {started_at}")))?;
    let finished_at = row
        .get::<_, Option<String>>(6)?
        .map(|s| from_db_time(&s).ok_or_else(|| conversion_error(6, format!("bad timestamp: {s}"))))
        .transpose()?;

    Ok(Job {
        id: JobId(id),
        job_type: row.get(1)?,
        status,
        triggered_by,
        started_at,
        finished_at,
        details,
    })
}

fn conversion_error(idx: usize, msg: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> JobStore {
        JobStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn exited(code: i32) -> ExitOutcome {
        ExitOutcome::Exited(ExitInfo {
            code: Some(code),
            signal: None,
        })
    }

    #[test]
    fn listings_skip_rows_that_do_not_decode() {
        let store = store();
        let good = store.create_running("ohlcv_load", TriggeredBy::Manual).unwrap();
        store
            .conn()
            .execute(
                "INSERT INTO jobs (id, job_type, status, triggered_by, started_at)
                 VALUES ('legacy', 'signal_process', 'running', 'cron', ?1)",
                [to_db_time(&db_now())],
            )
            .unwrap();

        let running = store.list_running().unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, good.id);
        let listed = store.list(&JobFilter::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, good.id);
    }

    #[test]
    fn second_running_job_of_same_type_conflicts() {
        let store = store();
        let first = store.create_running("ohlcv_load", TriggeredBy::Manual).unwrap();

        let err = store
            .create_running("ohlcv_load", TriggeredBy::Auto)
            .unwrap_err();
        assert!(matches!(err, JobError::AlreadyRunning { ref running_id, .. } if *running_id == first.id.0));

        // Original record untouched.
        assert_eq!(store.get(&first.id).unwrap(), first);
        // Other types are unaffected.
        store.create_running("signal_process", TriggeredBy::Manual).unwrap();
    }

    #[test]
    fn exclusivity_holds_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let a = JobStore::new(Connection::open(&path).unwrap()).unwrap();
        let b = JobStore::new(Connection::open(&path).unwrap()).unwrap();

        a.create_running("ohlcv_load", TriggeredBy::Manual).unwrap();
        let err = b.create_running("ohlcv_load", TriggeredBy::Manual).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Conflict);
    }

    #[test]
    fn unique_index_rejects_raw_duplicate_running_rows() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let insert = "INSERT INTO jobs (id, job_type, status, triggered_by, started_at)
                      VALUES (?1, 'x', 'running', 'manual', '2024-01-01T00:00:00.000000Z')";
        conn.execute(insert, ["a"]).unwrap();
        let err = conn.execute(insert, ["b"]).unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[test]
    fn finalize_maps_exit_code_to_status() {
        let store = store();
        let ok = store.create_running("a", TriggeredBy::Manual).unwrap();
        let job = store.finalize(&ok.id, &exited(0)).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.details.exit_code, Some(0));
        assert!(job.finished_at.is_some());

        let bad = store.create_running("b", TriggeredBy::Manual).unwrap();
        let job = store.finalize(&bad.id, &exited(3)).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.details.exit_code, Some(3));

        let broken = store.create_running("c", TriggeredBy::Manual).unwrap();
        let job = store
            .finalize(&broken.id, &ExitOutcome::Error("wait failed".into()))
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.details.error.as_deref(), Some("wait failed"));
    }

    #[test]
    fn stopped_survives_a_later_exit_handler() {
        let store = store();
        let job = store.create_running("ohlcv_load", TriggeredBy::Manual).unwrap();
        let stopped = store.mark_stopped(&job.id).unwrap().expect("was running");
        assert_eq!(stopped.status, JobStatus::Stopped);

        // Worker observes a clean exit after the stop landed.
        let job = store.finalize(&job.id, &exited(0)).unwrap();
        assert_eq!(job.status, JobStatus::Stopped);
        assert!(job.details.stopped);
        assert_eq!(job.details.exit_code, Some(0));
        assert_eq!(store.get(&job.id).unwrap().status, JobStatus::Stopped);
    }

    #[test]
    fn terminal_status_is_never_rewritten() {
        let store = store();
        let job = store.create_running("a", TriggeredBy::Manual).unwrap();
        store.finalize(&job.id, &exited(1)).unwrap();
        let again = store.finalize(&job.id, &exited(0)).unwrap();
        assert_eq!(again.status, JobStatus::Failed);
        assert!(store.mark_stopped(&job.id).unwrap().is_none());
    }

    #[test]
    fn force_stop_is_a_noop_on_terminal_jobs() {
        let store = store();
        let job = store.create_running("a", TriggeredBy::Manual).unwrap();
        let done = store.finalize(&job.id, &exited(0)).unwrap();
        assert_eq!(store.force_stop(&job.id).unwrap(), done);
        assert_eq!(store.get(&job.id).unwrap(), done);

        let other = store.create_running("b", TriggeredBy::Manual).unwrap();
        let stopped = store.mark_stopped(&other.id).unwrap().unwrap();
        assert_eq!(store.force_stop(&other.id).unwrap(), stopped);
    }

    #[test]
    fn force_stop_closes_a_running_job() {
        let store = store();
        let job = store.create_running("a", TriggeredBy::Manual).unwrap();
        let forced = store.force_stop(&job.id).unwrap();
        assert_eq!(forced.status, JobStatus::Stopped);
        assert!(forced.details.force_stopped);
        assert!(forced.finished_at.is_some());
        // The running slot is free again.
        store.create_running("a", TriggeredBy::Manual).unwrap();
    }

    #[test]
    fn unknown_id_is_not_found() {
        let store = store();
        let id = JobId::new();
        assert!(matches!(store.get(&id), Err(JobError::JobNotFound { .. })));
        assert!(matches!(store.force_stop(&id), Err(JobError::JobNotFound { .. })));
    }

    #[test]
    fn progress_merges_until_terminal() {
        let store = store();
        let job = store.create_running("a", TriggeredBy::Manual).unwrap();
        store
            .update_progress(
                &job.id,
                ProgressUpdate {
                    total: Some(10),
                    processed: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        let job = store
            .update_progress(
                &job.id,
                ProgressUpdate {
                    processed: Some(3),
                    last_item: Some("INFY".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let progress = job.details.progress.clone().unwrap();
        assert_eq!(progress.total, 10);
        assert_eq!(progress.processed, 3);
        assert_eq!(progress.last_item.as_deref(), Some("INFY"));

        store.finalize(&job.id, &exited(0)).unwrap();
        let after = store
            .update_progress(
                &job.id,
                ProgressUpdate {
                    processed: Some(9),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(after.details.progress.unwrap().processed, 3);
    }

    #[test]
    fn list_filters_orders_and_limits() {
        let store = store();
        let a = store.create_running("ohlcv_load", TriggeredBy::Manual).unwrap();
        store.finalize(&a.id, &exited(0)).unwrap();
        let b = store.create_running("ohlcv_load", TriggeredBy::Auto).unwrap();
        store.finalize(&b.id, &exited(1)).unwrap();
        let c = store.create_running("signal_process", TriggeredBy::Auto).unwrap();

        let all = store.list(&JobFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, c.id);

        let auto_ohlcv = store
            .list(&JobFilter {
                job_type: Some("ohlcv_load".into()),
                triggered_by: Some(TriggeredBy::Auto),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(auto_ohlcv.len(), 1);
        assert_eq!(auto_ohlcv[0].id, b.id);

        let failed = store
            .list(&JobFilter {
                status: Some(JobStatus::Failed),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(failed.len(), 1);

        let one = store
            .list(&JobFilter {
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(one.len(), 1);

        assert_eq!(store.latest("ohlcv_load").unwrap().unwrap().id, b.id);
        assert_eq!(store.list_running().unwrap().len(), 1);
    }
}
