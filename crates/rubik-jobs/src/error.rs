//! Error types for the rubik-jobs crate.

use thiserror::Error;

use crate::types::JobStatus;

/// Coarse classification callers branch on (retry, surface to operator, …).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidState,
    HandleUnavailable,
    Process,
    Timeout,
    Storage,
}

/// All errors that can originate from job operations.
#[derive(Debug, Error)]
pub enum JobError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// `details` column could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The job type is not in the registry.
    #[error("Unknown job type: {job_type}")]
    UnknownJobType { job_type: String },

    /// The registry entry points at a program or script that does not exist.
    #[error("Executable not found for {job_type}: {path}")]
    ExecutableMissing { job_type: String, path: String },

    /// Another job of the same type holds the running slot.
    #[error("{job_type} job is already running ({running_id})")]
    AlreadyRunning { job_type: String, running_id: String },

    #[error("Job {id} is not currently running (status: {status})")]
    NotRunning { id: String, status: JobStatus },

    /// Neither a live handle nor a persisted pid exists for a running job.
    #[error("Job {id} process handle not available; use force-stop")]
    HandleUnavailable { id: String },

    /// The worker could not be spawned. The job record is already `failed`.
    #[error("Failed to spawn {job_type} (job {id}): {reason}")]
    Spawn {
        id: String,
        job_type: String,
        reason: String,
    },

    #[error("Failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    /// Both the SIGTERM and SIGKILL waits expired.
    #[error("Process {pid} still alive after {waited_ms}ms")]
    TerminationTimeout { pid: u32, waited_ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::JobNotFound { .. }
            | JobError::UnknownJobType { .. }
            | JobError::ExecutableMissing { .. } => ErrorKind::NotFound,
            JobError::AlreadyRunning { .. } => ErrorKind::Conflict,
            JobError::NotRunning { .. } => ErrorKind::InvalidState,
            JobError::HandleUnavailable { .. } => ErrorKind::HandleUnavailable,
            JobError::Spawn { .. } | JobError::Signal { .. } | JobError::Io(_) => {
                ErrorKind::Process
            }
            JobError::TerminationTimeout { .. } => ErrorKind::Timeout,
            JobError::Database(_) | JobError::Serialization(_) => ErrorKind::Storage,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, JobError>;
