//! The single entry point the CLI drives: job control plus schedule CRUD,
//! with every schedule edit pushed straight into the live engine.

use std::sync::Arc;
use std::time::Duration;

use rubik_core::{RubikConfig, TriggeredBy};
use rubik_jobs::{
    Job, JobFilter, JobId, JobStatusSummary, JobStore, LogSink, ProcessTable, Supervisor,
};
use rubik_scheduler::{
    Schedule, ScheduleEngine, ScheduleFire, ScheduleId, ScheduleSpec, ScheduleStore,
    ScheduleUpdate,
};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};

use crate::db::open_db;
use crate::error::{OrchestratorError, Result};

/// Capacity of the fired-schedule channel between engine and router.
pub const FIRE_CHANNEL_CAPACITY: usize = 256;

pub struct Orchestrator {
    supervisor: Arc<Supervisor>,
    engine: Arc<ScheduleEngine>,
}

impl Orchestrator {
    /// Open every store named by `config` and wire the supervisor and the
    /// schedule engine. The returned receiver carries fired schedules; hand
    /// it to [`crate::router::spawn_fire_router`] when serving.
    pub fn open(config: &RubikConfig) -> Result<(Self, mpsc::Receiver<ScheduleFire>)> {
        let jobs = JobStore::new(open_db(&config.database.path)?)?;
        let logs = LogSink::new(open_db(config.database.log_path())?)?;
        let schedules = ScheduleStore::new(open_db(&config.database.path)?)?;

        let supervisor = Supervisor::new(
            config,
            Arc::new(jobs),
            Arc::new(logs),
            Arc::new(ProcessTable::new()),
        );

        let (fired_tx, fired_rx) = mpsc::channel(FIRE_CHANNEL_CAPACITY);
        let engine = ScheduleEngine::new(
            Arc::new(schedules),
            fired_tx,
            Duration::from_secs(config.scheduler.reconcile_interval_secs),
        );

        Ok((
            Self {
                supervisor: Arc::new(supervisor),
                engine: Arc::new(engine),
            },
            fired_rx,
        ))
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn engine(&self) -> &Arc<ScheduleEngine> {
        &self.engine
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    pub fn start_job(&self, job_type: &str) -> Result<Job> {
        Ok(self.supervisor.start(job_type, TriggeredBy::Manual)?)
    }

    pub async fn stop_job(&self, id: &JobId) -> Result<Job> {
        Ok(self.supervisor.stop(id).await?)
    }

    pub fn force_mark_stopped(&self, id: &JobId) -> Result<Job> {
        Ok(self.supervisor.force_mark_stopped(id)?)
    }

    pub fn get_job(&self, id: &JobId) -> Result<Job> {
        Ok(self.supervisor.store().get(id)?)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        Ok(self.supervisor.store().list(filter)?)
    }

    /// Full output of a job. Unknown ids are an error, not an empty log.
    pub fn get_job_log(&self, id: &JobId) -> Result<String> {
        self.supervisor.store().get(id)?;
        Ok(self.supervisor.logs().get(id)?)
    }

    /// Dashboard summary of the latest run of `job_type`.
    pub fn job_status(&self, job_type: &str, preview_lines: usize) -> Result<JobStatusSummary> {
        self.ensure_job_type(job_type)?;
        let Some(job) = self.supervisor.store().latest(job_type)? else {
            return Ok(JobStatusSummary {
                job_type: job_type.to_string(),
                status: "idle".to_string(),
                job: None,
                progress: None,
                percent_complete: 0.0,
                log_preview: Vec::new(),
            });
        };

        let log_preview = self.supervisor.logs().tail(&job.id, preview_lines)?;
        let progress = job.details.progress.clone();
        Ok(JobStatusSummary {
            job_type: job_type.to_string(),
            status: job.status.to_string(),
            percent_complete: progress
                .as_ref()
                .map(|p| p.percent_complete())
                .unwrap_or(0.0),
            progress,
            job: Some(job),
            log_preview,
        })
    }

    pub fn stuck_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.supervisor.stuck_jobs()?)
    }

    // -----------------------------------------------------------------------
    // Schedules
    // -----------------------------------------------------------------------

    #[instrument(skip(self, spec), fields(schedule_type = spec.schedule_type()))]
    pub fn create_schedule(
        &self,
        job_type: &str,
        spec: ScheduleSpec,
        is_active: bool,
    ) -> Result<Schedule> {
        self.ensure_job_type(job_type)?;
        let mut schedule = self.engine.store().insert(job_type, spec, is_active)?;
        schedule.next_run_at = self.engine.install(&schedule)?;
        info!(schedule_id = %schedule.id, next_run_at = ?schedule.next_run_at, "schedule created");
        Ok(schedule)
    }

    #[instrument(skip(self, update))]
    pub fn update_schedule(&self, id: &ScheduleId, update: ScheduleUpdate) -> Result<Schedule> {
        let mut schedule = self.engine.store().update(id, update)?;
        schedule.next_run_at = self.engine.install(&schedule)?;
        info!(is_active = schedule.is_active, next_run_at = ?schedule.next_run_at, "schedule updated");
        Ok(schedule)
    }

    #[instrument(skip(self))]
    pub fn delete_schedule(&self, id: &ScheduleId) -> Result<()> {
        self.engine.store().delete(id)?;
        self.engine.cancel(id);
        info!("schedule deleted");
        Ok(())
    }

    pub fn get_schedule(&self, id: &ScheduleId) -> Result<Schedule> {
        Ok(self.engine.store().get(id)?)
    }

    pub fn list_schedules(&self, job_type: Option<&str>) -> Result<Vec<Schedule>> {
        Ok(self.engine.store().list(job_type)?)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Stop every job this process is supervising. Records whose process is
    /// owned elsewhere are left alone.
    pub async fn shutdown(&self) {
        let running = match self.supervisor.store().list_running() {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!("could not list running jobs at shutdown: {e}");
                return;
            }
        };
        for job in running {
            if !self.supervisor.processes().contains(&job.id) {
                continue;
            }
            match self.supervisor.stop(&job.id).await {
                Ok(stopped) => info!(job_id = %stopped.id, job_type = %stopped.job_type, "stopped at shutdown"),
                Err(e) => warn!(job_id = %job.id, "stop at shutdown failed: {e}"),
            }
        }
    }

    fn ensure_job_type(&self, job_type: &str) -> Result<()> {
        if self.supervisor.has_job_type(job_type) {
            Ok(())
        } else {
            Err(OrchestratorError::UnknownJobType {
                job_type: job_type.to_string(),
            })
        }
    }
}
