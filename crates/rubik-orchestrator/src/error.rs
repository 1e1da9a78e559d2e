use rubik_core::CoreError;
use rubik_jobs::{ErrorKind, JobError};
use rubik_scheduler::SchedulerError;
use thiserror::Error;

/// Every failure the orchestrator facade can surface to a caller.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Schedule(#[from] SchedulerError),

    #[error(transparent)]
    Config(#[from] CoreError),

    /// A schedule or status query named a type missing from the registry.
    #[error("Unknown job type: {job_type}")]
    UnknownJobType { job_type: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Short, stable error code for callers to branch on.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::Job(e) => match e.kind() {
                ErrorKind::NotFound => "NOT_FOUND",
                ErrorKind::Conflict => "CONFLICT",
                ErrorKind::InvalidState => "INVALID_STATE",
                ErrorKind::HandleUnavailable => "HANDLE_UNAVAILABLE",
                ErrorKind::Process => "PROCESS_ERROR",
                ErrorKind::Timeout => "TERMINATION_TIMEOUT",
                ErrorKind::Storage => "DATABASE_ERROR",
            },
            OrchestratorError::Schedule(e) => match e {
                SchedulerError::ScheduleNotFound { .. } => "NOT_FOUND",
                SchedulerError::InvalidSchedule(_) => "INVALID_SCHEDULE",
                SchedulerError::Database(_) | SchedulerError::Serialization(_) => "DATABASE_ERROR",
            },
            OrchestratorError::Config(_) => "CONFIG_ERROR",
            OrchestratorError::UnknownJobType { .. } => "NOT_FOUND",
            OrchestratorError::Database(_) => "DATABASE_ERROR",
            OrchestratorError::InvalidInput(_) => "INVALID_INPUT",
            OrchestratorError::Serialization(_) | OrchestratorError::Io(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rubik_jobs::JobStatus;

    #[test]
    fn codes_distinguish_caller_reactions() {
        let cases: Vec<(OrchestratorError, &str)> = vec![
            (JobError::JobNotFound { id: "x".into() }.into(), "NOT_FOUND"),
            (
                JobError::UnknownJobType {
                    job_type: "x".into(),
                }
                .into(),
                "NOT_FOUND",
            ),
            (
                JobError::AlreadyRunning {
                    job_type: "x".into(),
                    running_id: "y".into(),
                }
                .into(),
                "CONFLICT",
            ),
            (
                JobError::NotRunning {
                    id: "x".into(),
                    status: JobStatus::Completed,
                }
                .into(),
                "INVALID_STATE",
            ),
            (
                JobError::HandleUnavailable { id: "x".into() }.into(),
                "HANDLE_UNAVAILABLE",
            ),
            (
                JobError::TerminationTimeout {
                    pid: 1,
                    waited_ms: 15_000,
                }
                .into(),
                "TERMINATION_TIMEOUT",
            ),
            (
                SchedulerError::InvalidSchedule("x".into()).into(),
                "INVALID_SCHEDULE",
            ),
            (
                SchedulerError::ScheduleNotFound { id: "x".into() }.into(),
                "NOT_FOUND",
            ),
            (CoreError::Config("x".into()).into(), "CONFIG_ERROR"),
        ];
        for (err, code) in cases {
            assert_eq!(err.code(), code, "{err}");
        }
    }
}
