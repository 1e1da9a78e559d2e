//! Worker-reported progress.
//!
//! Workers print `@progress {"total":500,"processed":12,"last_item":"INFY"}`
//! on their normal output. The supervisor merges each such object into the
//! job's `details.progress`; the line itself still goes to the log verbatim.
//! Fields missing from an update keep their previous value.

use serde::Deserialize;
use tracing::debug;

use crate::types::JobProgress;

pub const PROGRESS_PREFIX: &str = "@progress";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProgressUpdate {
    pub total: Option<u64>,
    pub processed: Option<u64>,
    pub succeeded: Option<u64>,
    pub failed: Option<u64>,
    pub skipped: Option<u64>,
    pub up_to_date: Option<u64>,
    pub last_item: Option<String>,
    pub message: Option<String>,
}

impl ProgressUpdate {
    pub fn apply(self, progress: &mut JobProgress) {
        if let Some(v) = self.total {
            progress.total = v;
        }
        if let Some(v) = self.processed {
            progress.processed = v;
        }
        if let Some(v) = self.succeeded {
            progress.succeeded = v;
        }
        if let Some(v) = self.failed {
            progress.failed = v;
        }
        if let Some(v) = self.skipped {
            progress.skipped = v;
        }
        if let Some(v) = self.up_to_date {
            progress.up_to_date = v;
        }
        if self.last_item.is_some() {
            progress.last_item = self.last_item;
        }
        if self.message.is_some() {
            progress.message = self.message;
        }
    }
}

/// Parse one output line. Anything that is not a well-formed progress line
/// yields `None`.
pub fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    let rest = line.trim_end().strip_prefix(PROGRESS_PREFIX)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    match serde_json::from_str(rest.trim_start()) {
        Ok(update) => Some(update),
        Err(e) => {
            debug!("ignoring malformed progress line: {e}");
            None
        }
    }
}
