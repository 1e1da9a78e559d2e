//! Turns fired schedules into job starts.

use std::sync::Arc;

use rubik_core::TriggeredBy;
use rubik_jobs::{ErrorKind, Supervisor};
use rubik_scheduler::ScheduleFire;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Spawn the fire router: every [`ScheduleFire`] becomes
/// `start(job_type, auto)`. A start refused because the type is already
/// running is expected and logged at info; anything else at warn.
pub fn spawn_fire_router(
    supervisor: Arc<Supervisor>,
    mut fired_rx: mpsc::Receiver<ScheduleFire>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(fire) = fired_rx.recv().await {
            match supervisor.start(&fire.job_type, TriggeredBy::Auto) {
                Ok(job) => info!(
                    schedule_id = %fire.schedule_id,
                    job_id = %job.id,
                    job_type = %fire.job_type,
                    "scheduled job started"
                ),
                Err(e) if e.kind() == ErrorKind::Conflict => info!(
                    schedule_id = %fire.schedule_id,
                    job_type = %fire.job_type,
                    "scheduled start skipped: {e}"
                ),
                Err(e) => warn!(
                    schedule_id = %fire.schedule_id,
                    job_type = %fire.job_type,
                    "scheduled start failed: {e}"
                ),
            }
        }
        debug!("fire channel closed; router stopped");
    })
}
