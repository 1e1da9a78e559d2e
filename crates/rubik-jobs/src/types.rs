//! Shared data types for rubik-jobs.

use chrono::{DateTime, Utc};
use rubik_core::TriggeredBy;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Default page size for [`JobFilter`] when no limit is given.
pub const DEFAULT_LIST_LIMIT: usize = 15;

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// Opaque identifier for a job (UUIDv7, so ids sort by creation time).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
///
/// `Running` is the only non-terminal state; every other state is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    /// Worker exited with code 0.
    Completed,
    /// Worker exited non-zero, died from a signal, or could not be run.
    Failed,
    /// An operator stopped the job. Wins over whatever the worker reports.
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "stopped" => Ok(JobStatus::Stopped),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Exit reporting
// ---------------------------------------------------------------------------

/// How a worker process ended, as far as the OS told us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code; `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    /// Terminating signal number (unix only).
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitInfo {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// What the worker task hands to the store when the process is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(ExitInfo),
    /// The process could not be spawned or waited on.
    Error(String),
}

// ---------------------------------------------------------------------------
// Details / progress
// ---------------------------------------------------------------------------

/// Structured metadata persisted as JSON in the `details` column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Set by a stop request.
    #[serde(default, skip_serializing_if = "is_false")]
    pub stopped: bool,
    /// Set by force-stop: the record was closed without signalling anything.
    #[serde(default, skip_serializing_if = "is_false")]
    pub force_stopped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<JobProgress>,
}

impl JobDetails {
    pub(crate) fn attach_exit(&mut self, exit: &ExitInfo) {
        self.exit_code = exit.code;
        self.signal = exit.signal;
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Counters reported by the worker itself via `@progress` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub succeeded: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub skipped: u64,
    #[serde(default)]
    pub up_to_date: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_item: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobProgress {
    /// Percentage of `total` processed, rounded to two decimals.
    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let pct = self.processed as f64 / self.total as f64 * 100.0;
        (pct * 100.0).round() / 100.0
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One tracked execution of an external worker program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub triggered_by: TriggeredBy,
    pub started_at: DateTime<Utc>,
    /// Unset while the job is running.
    pub finished_at: Option<DateTime<Utc>>,
    pub details: JobDetails,
}

/// Query parameters for `JobStore::list`. Unset fields do not filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub job_type: Option<String>,
    pub status: Option<JobStatus>,
    pub triggered_by: Option<TriggeredBy>,
    /// Defaults to [`DEFAULT_LIST_LIMIT`].
    pub limit: Option<usize>,
}

/// Latest-run summary for one job type, shaped for a dashboard panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusSummary {
    pub job_type: String,
    /// The latest job's status, or `"idle"` if the type never ran.
    pub status: String,
    pub job: Option<Job>,
    pub progress: Option<JobProgress>,
    pub percent_complete: f64,
    /// Last lines of the latest job's output.
    pub log_preview: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_running_is_non_terminal() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
    }

    #[test]
    fn details_omit_unset_fields() {
        let details = JobDetails {
            pid: Some(42),
            ..Default::default()
        };
        assert_eq!(serde_json::to_string(&details).unwrap(), r#"{"pid":42}"#);
    }

    #[test]
    fn details_tolerate_legacy_keys() {
        // Records written before progress tracking carried extra keys.
        let details: JobDetails =
            serde_json::from_str(r#"{"pid":7,"returncode":0,"stopped":true}"#).unwrap();
        assert_eq!(details.pid, Some(7));
        assert!(details.stopped);
        assert_eq!(details.exit_code, None);
    }

    #[test]
    fn percent_complete_rounds_and_handles_zero_total() {
        let mut p = JobProgress::default();
        assert_eq!(p.percent_complete(), 0.0);
        p.total = 3;
        p.processed = 1;
        assert_eq!(p.percent_complete(), 33.33);
    }
}
