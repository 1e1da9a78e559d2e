//! `rubik-orchestrator`: wires the job supervisor and the schedule engine
//! into one process and exposes them through a CLI.

pub mod cli;
pub mod db;
pub mod error;
pub mod orchestrator;
pub mod router;

pub use error::{OrchestratorError, Result};
pub use orchestrator::Orchestrator;
