//! rubik-jobs: supervised execution of long-running data pipeline workers.
//!
//! A job is one run of an external program from the registry. The
//! [`supervisor::Supervisor`] writes a `running` record, spawns the worker in
//! its own process group, and hands it to a Tokio task that streams every
//! output line into the [`logs::LogSink`] as it arrives and finalizes the
//! record on exit. A stop request marks the record `stopped` *before*
//! signalling, so the worker's exit handler can never overwrite it.
//!
//! # Pieces
//!
//! | Module       | Responsibility                                             |
//! |--------------|------------------------------------------------------------|
//! | `store`      | `jobs` table, atomic check-and-create, status transitions  |
//! | `logs`       | append-only per-job output text                            |
//! | `process`    | live handle table, signalling, bounded termination         |
//! | `supervisor` | start / stop / force-stop and the per-job worker task      |
//! | `chain`      | start dependent job types after a successful run           |
//! | `progress`   | `@progress {json}` lines emitted by workers                |

pub mod chain;
pub mod db;
pub mod error;
pub mod logs;
pub mod process;
pub mod progress;
pub mod store;
pub mod supervisor;
pub mod types;

pub use error::{ErrorKind, JobError, Result};
pub use logs::LogSink;
pub use process::{ProcessHandle, ProcessTable};
pub use store::JobStore;
pub use supervisor::Supervisor;
pub use types::{
    ExitInfo, ExitOutcome, Job, JobDetails, JobFilter, JobId, JobProgress, JobStatus,
    JobStatusSummary,
};
