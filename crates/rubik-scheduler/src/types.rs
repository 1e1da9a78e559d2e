use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};

/// Opaque identifier for a schedule (UUIDv7).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleId(pub String);

impl ScheduleId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ScheduleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ScheduleId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// When a schedule fires. All times are UTC.
///
/// Serialized as `{"schedule_type": "...", "schedule_value": {...}}`, the
/// same pair persisted in the `schedules` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "schedule_type",
    content = "schedule_value",
    rename_all = "snake_case"
)]
pub enum ScheduleSpec {
    /// Every day at HH:MM.
    Daily {
        #[serde(default = "default_hour")]
        hour: u32,
        #[serde(default)]
        minute: u32,
    },

    /// One weekday (0 = Monday … 6 = Sunday) at HH:MM.
    Weekly {
        #[serde(default)]
        day_of_week: u32,
        #[serde(default = "default_hour")]
        hour: u32,
        #[serde(default)]
        minute: u32,
    },

    /// Every N hours, minutes or days, counted from the schedule's anchor.
    Interval(IntervalSpec),

    /// Five-field cron.
    Cron(CronSpec),
}

fn default_hour() -> u32 {
    9
}

impl ScheduleSpec {
    /// Build from the persisted `(schedule_type, schedule_value)` pair.
    pub fn from_parts(schedule_type: &str, value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(serde_json::json!({
            "schedule_type": schedule_type,
            "schedule_value": value,
        }))
        .map_err(|e| SchedulerError::InvalidSchedule(format!("{schedule_type}: {e}")))
    }

    pub fn schedule_type(&self) -> &'static str {
        match self {
            ScheduleSpec::Daily { .. } => "daily",
            ScheduleSpec::Weekly { .. } => "weekly",
            ScheduleSpec::Interval(_) => "interval",
            ScheduleSpec::Cron(_) => "cron",
        }
    }

    /// The `schedule_value` half of the persisted pair.
    pub fn schedule_value(&self) -> Result<serde_json::Value> {
        let mut tagged = serde_json::to_value(self)?;
        Ok(tagged
            .get_mut("schedule_value")
            .map(serde_json::Value::take)
            .unwrap_or_default())
    }
}

/// Exactly one unit must be set, to a non-zero count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<u32>,
}

/// Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSpec {
    #[serde(default)]
    pub minute: CronField,
    #[serde(default)]
    pub hour: CronField,
    #[serde(default)]
    pub day: CronField,
    #[serde(default)]
    pub month: CronField,
    /// 0 or 7 = Sunday, 1 = Monday; names (`mon`, `fri`) also accepted.
    #[serde(default)]
    pub day_of_week: CronField,
}

/// A cron field as it appears in JSON: a bare number or an expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CronField {
    Number(u32),
    Expr(String),
}

impl Default for CronField {
    fn default() -> Self {
        CronField::Expr("*".to_string())
    }
}

impl fmt::Display for CronField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CronField::Number(n) => write!(f, "{n}"),
            CronField::Expr(s) => f.write_str(s.trim()),
        }
    }
}

/// A persisted recurring trigger bound to one job type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub job_type: String,
    #[serde(flatten)]
    pub spec: ScheduleSpec,
    pub is_active: bool,
    /// Unset while inactive.
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Reference point for interval schedules: creation time, reset
    /// whenever the definition changes.
    pub anchor_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial edit for `ScheduleStore::update`. Unset fields are kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleUpdate {
    pub spec: Option<ScheduleSpec>,
    pub is_active: Option<bool>,
}
