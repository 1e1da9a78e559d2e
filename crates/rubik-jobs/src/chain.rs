//! Dependent job types started after a successful upstream run.

use std::sync::Arc;

use rubik_core::{ChainRule, TriggeredBy};
use tracing::{info, warn};

use crate::supervisor::Supervisor;
use crate::types::{Job, JobStatus};

#[derive(Debug, Clone, Default)]
pub struct ChainTrigger {
    rules: Vec<ChainRule>,
}

impl ChainTrigger {
    pub fn new(rules: Vec<ChainRule>) -> Self {
        Self { rules }
    }

    /// Downstream job types owed a run after `job` finalized. Empty unless
    /// the job completed.
    pub fn downstream_of<'a>(&'a self, job: &'a Job) -> impl Iterator<Item = &'a str> + 'a {
        let completed = job.status == JobStatus::Completed;
        self.rules
            .iter()
            .filter(move |rule| completed && rule.upstream == job.job_type)
            .map(|rule| rule.downstream.as_str())
    }

    /// Start every owed downstream job. A downstream already running is
    /// skipped; failures are logged and never reach the upstream.
    pub(crate) fn on_finalized(&self, supervisor: &Arc<Supervisor>, job: &Job) -> Vec<Job> {
        let mut started = Vec::new();
        for downstream in self.downstream_of(job) {
            match supervisor.store().running(downstream) {
                Ok(Some(running)) => {
                    info!(
                        upstream_id = %job.id,
                        downstream,
                        running_id = %running.id,
                        "downstream already running; chain skipped"
                    );
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(upstream_id = %job.id, downstream, "chain check failed: {e}");
                    continue;
                }
            }

            match supervisor.start(downstream, TriggeredBy::Auto) {
                Ok(next) => {
                    info!(upstream_id = %job.id, downstream_id = %next.id, downstream, "chain triggered");
                    started.push(next);
                }
                Err(e) => warn!(upstream_id = %job.id, downstream, "chain trigger failed: {e}"),
            }
        }
        started
    }
}
