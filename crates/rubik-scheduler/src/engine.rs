use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{Result, SchedulerError};
use crate::schedule::calculate_next_run;
use crate::store::ScheduleStore;
use crate::types::{Schedule, ScheduleId};

/// A schedule reached its due instant and won the claim for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleFire {
    pub schedule_id: ScheduleId,
    pub job_type: String,
    pub due_at: DateTime<Utc>,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub installed: usize,
    pub cancelled: usize,
    pub skipped: usize,
}

struct TimerSlot {
    /// `updated_at` of the schedule the timer was built from.
    version: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Keeps one live timer per active schedule.
///
/// Timers hold only the store and the fire channel, never the engine, so
/// aborting a slot's handle is all it takes to cancel one.
pub struct ScheduleEngine {
    store: Arc<ScheduleStore>,
    fired_tx: mpsc::Sender<ScheduleFire>,
    timers: Mutex<HashMap<ScheduleId, TimerSlot>>,
    reconcile_interval: Duration,
}

impl ScheduleEngine {
    /// Fired schedules are delivered on `fired_tx`. Sends use `try_send`, so
    /// a full channel drops the run (logged) instead of stalling a timer.
    pub fn new(
        store: Arc<ScheduleStore>,
        fired_tx: mpsc::Sender<ScheduleFire>,
        reconcile_interval: Duration,
    ) -> Self {
        Self {
            store,
            fired_tx,
            timers: Mutex::new(HashMap::new()),
            reconcile_interval: reconcile_interval.max(Duration::from_secs(1)),
        }
    }

    pub fn store(&self) -> &Arc<ScheduleStore> {
        &self.store
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<ScheduleId, TimerSlot>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Startup reconciliation: install a timer for every active schedule.
    /// One bad schedule is logged and skipped. Returns how many timers run.
    pub fn load_active(&self) -> Result<usize> {
        let mut installed = 0;
        for schedule in self.store.list_active()? {
            match self.install(&schedule) {
                Ok(Some(_)) => installed += 1,
                Ok(None) => {}
                Err(e) => warn!(schedule_id = %schedule.id, "schedule not loaded: {e}"),
            }
        }
        info!(installed, "schedules loaded");
        Ok(installed)
    }

    /// Install (or replace) the timer for `schedule` and persist its next
    /// fire time. Inactive schedules only lose their timer.
    pub fn install(&self, schedule: &Schedule) -> Result<Option<DateTime<Utc>>> {
        self.cancel(&schedule.id);
        if !schedule.is_active {
            return Ok(None);
        }

        let now = Utc::now();
        let reference = schedule.last_run_at.map_or(now, |last| last.max(now));
        let next = calculate_next_run(schedule, reference).ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!(
                "{} schedule {} has no next run",
                schedule.spec.schedule_type(),
                schedule.id
            ))
        })?;
        self.store.set_next_run(&schedule.id, Some(next))?;
        self.arm(schedule, next);
        debug!(schedule_id = %schedule.id, job_type = %schedule.job_type, next = %next, "timer installed");
        Ok(Some(next))
    }

    /// Spawn the timer for `schedule` and take its slot. Whatever timer held
    /// the slot is aborted under the same lock, so two installs racing for
    /// one id always leave exactly one timer running.
    fn arm(&self, schedule: &Schedule, due: DateTime<Utc>) {
        let mut timers = self.timers();
        let handle = tokio::spawn(timer_loop(
            Arc::clone(&self.store),
            self.fired_tx.clone(),
            schedule.id.clone(),
            due,
        ));
        let displaced = timers.insert(
            schedule.id.clone(),
            TimerSlot {
                version: schedule.updated_at,
                handle,
            },
        );
        if let Some(old) = displaced {
            old.handle.abort();
        }
    }

    /// Cancel the live timer for `id`, if any. Persisted history is untouched.
    pub fn cancel(&self, id: &ScheduleId) -> bool {
        match self.timers().remove(id) {
            Some(slot) => {
                slot.handle.abort();
                debug!(schedule_id = %id, "timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn active_timers(&self) -> usize {
        self.timers().len()
    }

    /// Bring live timers in line with the store: install missing or dead
    /// ones, replace edited ones, cancel deleted or deactivated ones.
    pub fn sync(&self) -> Result<SyncReport> {
        let active = self.store.list_active()?;
        let mut report = SyncReport::default();

        let stale: Vec<ScheduleId> = {
            let timers = self.timers();
            timers
                .keys()
                .filter(|id| !active.iter().any(|s| &s.id == *id))
                .cloned()
                .collect()
        };
        for id in stale {
            if self.cancel(&id) {
                report.cancelled += 1;
            }
        }

        for schedule in &active {
            let current = self
                .timers()
                .get(&schedule.id)
                .is_some_and(|slot| slot.version == schedule.updated_at && !slot.handle.is_finished());
            if current {
                continue;
            }
            match self.install(schedule) {
                Ok(_) => report.installed += 1,
                Err(e) => {
                    warn!(schedule_id = %schedule.id, "schedule skipped: {e}");
                    report.skipped += 1;
                }
            }
        }

        if report != SyncReport::default() {
            info!(
                installed = report.installed,
                cancelled = report.cancelled,
                skipped = report.skipped,
                "schedules reconciled"
            );
        }
        Ok(report)
    }

    /// Main loop: load active schedules, then reconcile every
    /// `reconcile_interval` until `shutdown` broadcasts `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("schedule engine started");
        if let Err(e) = self.load_active() {
            error!("schedule load failed: {e}");
        }

        let mut interval = tokio::time::interval(self.reconcile_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sync() {
                        error!("schedule reconciliation failed: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("schedule engine shutting down");
                        break;
                    }
                }
            }
        }

        for (_, slot) in self.timers().drain() {
            slot.handle.abort();
        }
    }
}

async fn timer_loop(
    store: Arc<ScheduleStore>,
    tx: mpsc::Sender<ScheduleFire>,
    id: ScheduleId,
    mut due: DateTime<Utc>,
) {
    loop {
        let wait = (due - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        match fire_due(&store, &tx, &id, due) {
            Ok(Some(next)) => due = next,
            Ok(None) => break,
            Err(e) => {
                // The reconciliation pass reinstalls finished timers.
                error!(schedule_id = %id, "timer stopped: {e}");
                break;
            }
        }
    }
}

/// Fire `id` for `due` if it is still active and nobody claimed `due` yet.
/// Returns the following fire time, or `None` when the timer should end.
pub(crate) fn fire_due(
    store: &ScheduleStore,
    tx: &mpsc::Sender<ScheduleFire>,
    id: &ScheduleId,
    due: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let Some(schedule) = store.find(id)? else {
        debug!(schedule_id = %id, "schedule deleted; timer ends");
        return Ok(None);
    };
    if !schedule.is_active {
        return Ok(None);
    }

    // A late wake-up skips straight to the next future instant.
    let next = calculate_next_run(&schedule, Utc::now().max(due));
    if !store.claim_fire(id, due, next)? {
        debug!(schedule_id = %id, due = %due, "fire already claimed");
        return Ok(next);
    }

    info!(schedule_id = %id, job_type = %schedule.job_type, due = %due, "schedule fired");
    let fire = ScheduleFire {
        schedule_id: id.clone(),
        job_type: schedule.job_type.clone(),
        due_at: due,
    };
    if tx.try_send(fire).is_err() {
        warn!(schedule_id = %id, "fire channel full or closed; run dropped");
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IntervalSpec, ScheduleSpec, ScheduleUpdate};
    use rubik_core::{db_now, to_db_time};
    use rusqlite::Connection;

    fn every(minutes: u32) -> ScheduleSpec {
        ScheduleSpec::Interval(IntervalSpec {
            minutes: Some(minutes),
            ..Default::default()
        })
    }

    fn engine() -> (Arc<ScheduleEngine>, mpsc::Receiver<ScheduleFire>) {
        let store = Arc::new(ScheduleStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let (tx, rx) = mpsc::channel(16);
        (
            Arc::new(ScheduleEngine::new(store, tx, Duration::from_secs(60))),
            rx,
        )
    }

    #[test]
    fn fire_due_claims_once_across_disable_and_enable() {
        let store = ScheduleStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let s = store.insert("ohlcv_load", every(30), true).unwrap();
        let due = s.next_run_at.unwrap();

        let next = fire_due(&store, &tx, &s.id, due).unwrap();
        assert!(next.unwrap() > due);
        let fire = rx.try_recv().unwrap();
        assert_eq!(fire.job_type, "ohlcv_load");
        assert_eq!(fire.due_at, due);

        // Toggle the schedule; a timer that survived the toggle wakes for
        // the same instant again.
        for active in [false, true] {
            store
                .update(
                    &s.id,
                    ScheduleUpdate {
                        is_active: Some(active),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        fire_due(&store, &tx, &s.id, due).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn fire_due_ends_for_inactive_or_deleted_schedule() {
        let store = ScheduleStore::new(Connection::open_in_memory().unwrap()).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let s = store.insert("ohlcv_load", every(30), false).unwrap();
        assert_eq!(fire_due(&store, &tx, &s.id, db_now()).unwrap(), None);

        store.delete(&s.id).unwrap();
        assert_eq!(fire_due(&store, &tx, &s.id, db_now()).unwrap(), None);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn install_replaces_existing_timer() {
        let (engine, _rx) = engine();
        let s = engine.store().insert("ohlcv_load", every(30), true).unwrap();

        let first = engine.install(&s).unwrap();
        let second = engine.install(&s).unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.active_timers(), 1);

        assert!(engine.cancel(&s.id));
        assert!(!engine.cancel(&s.id));
        assert_eq!(engine.active_timers(), 0);
        // Cancelling leaves the persisted record alone.
        assert!(engine.store().get(&s.id).unwrap().is_active);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_a_slot_aborts_the_timer_it_displaces() {
        let (engine, mut rx) = engine();
        let s = engine.store().insert("ohlcv_load", every(1), true).unwrap();
        let early = s.next_run_at.unwrap();
        let late = early + chrono::Duration::seconds(30);

        // Two installs that both got past `cancel` before either took the slot.
        engine.arm(&s, early);
        engine.arm(&s, late);
        assert_eq!(engine.active_timers(), 1);

        let fire = tokio::time::timeout(Duration::from_secs(300), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fire.due_at, late);
        assert_eq!(engine.store().get(&s.id).unwrap().last_run_at, Some(late));
    }

    #[tokio::test]
    async fn load_skips_unusable_schedules() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rubik.db");
        let store = Arc::new(ScheduleStore::new(Connection::open(&path).unwrap()).unwrap());
        let (tx, _rx) = mpsc::channel(16);
        let engine = ScheduleEngine::new(Arc::clone(&store), tx, Duration::from_secs(60));

        let good = store.insert("ohlcv_load", every(30), true).unwrap();
        let raw = Connection::open(&path).unwrap();
        let now = to_db_time(&db_now());
        for (id, kind, value) in [
            ("unparsable", "interval", "{oops"),
            ("out-of-range", "daily", r#"{"hour": 30}"#),
            ("unknown-kind", "hourly", "{}"),
        ] {
            raw.execute(
                "INSERT INTO schedules (id, job_type, schedule_type, schedule_value, is_active,
                                        anchor_at, created_at, updated_at)
                 VALUES (?1, 'signal_process', ?2, ?3, 1, ?4, ?4, ?4)",
                rusqlite::params![id, kind, value, now],
            )
            .unwrap();
        }

        assert_eq!(engine.load_active().unwrap(), 1);
        assert_eq!(engine.active_timers(), 1);
        assert!(engine.store().get(&good.id).unwrap().next_run_at.is_some());
    }

    #[tokio::test]
    async fn sync_follows_store_edits() {
        let (engine, _rx) = engine();
        let a = engine.store().insert("ohlcv_load", every(30), true).unwrap();
        let b = engine.store().insert("signal_process", every(60), true).unwrap();

        let report = engine.sync().unwrap();
        assert_eq!(report.installed, 2);
        assert_eq!(engine.sync().unwrap(), SyncReport::default());

        engine
            .store()
            .update(
                &a.id,
                ScheduleUpdate {
                    spec: Some(every(15)),
                    ..Default::default()
                },
            )
            .unwrap();
        engine.store().delete(&b.id).unwrap();

        let report = engine.sync().unwrap();
        assert_eq!(report.installed, 1);
        assert_eq!(report.cancelled, 1);
        assert_eq!(engine.active_timers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_delivers_fire_at_due_instant() {
        let (engine, mut rx) = engine();
        let s = engine.store().insert("ohlcv_load", every(1), true).unwrap();
        let next = engine.install(&s).unwrap().unwrap();

        let fire = tokio::time::timeout(Duration::from_secs(120), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fire.schedule_id, s.id);
        assert_eq!(fire.due_at, next);
        assert_eq!(engine.store().get(&s.id).unwrap().last_run_at, Some(next));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (engine, _rx) = engine();
        engine.store().insert("ohlcv_load", every(30), true).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(Arc::clone(&engine).run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.active_timers(), 1);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(engine.active_timers(), 0);
    }
}
