use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Who asked for a job to run.
///
/// `Auto` covers both schedule firings and chain triggers; callers that
/// need to tell them apart look at the log line emitted at start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Manual,
    Auto,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggeredBy::Manual => "manual",
            TriggeredBy::Auto => "auto",
        }
    }
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggeredBy {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggeredBy::Manual),
            "auto" => Ok(TriggeredBy::Auto),
            other => Err(CoreError::InvalidValue {
                field: "triggered_by",
                value: other.to_string(),
            }),
        }
    }
}

/// Render a timestamp for a SQLite TEXT column.
///
/// Fixed width (microseconds, `Z` suffix) so that lexical comparison in SQL
/// matches chronological order.
pub fn to_db_time(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time truncated to the precision stored in the database, so a
/// record built in memory compares equal to the same record read back.
pub fn db_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Parse a timestamp previously written by [`to_db_time`] (any RFC 3339 is accepted).
pub fn from_db_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
