//! `rubik-core`: configuration and shared vocabulary for the RubikView job
//! orchestrator.
//!
//! Everything here is plain data: the job registry, chain rules, supervisor
//! and scheduler tuning, plus the handful of enums and timestamp helpers that
//! both `rubik-jobs` and `rubik-scheduler` need to agree on.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ChainRule, JobSpec, RubikConfig};
pub use error::{CoreError, Result};
pub use types::{db_now, from_db_time, to_db_time, TriggeredBy};
