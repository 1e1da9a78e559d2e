//! `rubik-scheduler`: recurring job triggers with SQLite persistence.
//!
//! # Overview
//!
//! Schedules live in the `schedules` table ([`store::ScheduleStore`]). The
//! [`engine::ScheduleEngine`] keeps one Tokio timer per active schedule;
//! when a timer comes due it claims that instant in the store (so a given
//! instant fires at most once) and emits a [`engine::ScheduleFire`] for the
//! caller to turn into a job start. A periodic reconciliation pass picks up
//! edits made by other processes.
//!
//! # Schedule variants
//!
//! | Variant    | `schedule_value`                               | Fires                          |
//! |------------|------------------------------------------------|--------------------------------|
//! | `daily`    | `{"hour": 9, "minute": 0}`                     | every day at HH:MM UTC         |
//! | `weekly`   | `{"day_of_week": 0, "hour": 9, "minute": 0}`   | one weekday (0 = Monday)       |
//! | `interval` | `{"hours": N}` / `{"minutes": N}` / `{"days": N}` | every N units from the anchor |
//! | `cron`     | `{"minute", "hour", "day", "month", "day_of_week"}` | standard five-field cron   |

pub mod db;
pub mod engine;
pub mod error;
pub mod schedule;
pub mod store;
pub mod types;

pub use engine::{ScheduleEngine, ScheduleFire, SyncReport};
pub use error::{Result, SchedulerError};
pub use schedule::{calculate_next_run, next_fire};
pub use store::ScheduleStore;
pub use types::{CronField, CronSpec, IntervalSpec, Schedule, ScheduleId, ScheduleSpec, ScheduleUpdate};
