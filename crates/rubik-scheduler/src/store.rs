use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rubik_core::{db_now, from_db_time, to_db_time};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, instrument, warn};

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::schedule::calculate_next_run;
use crate::types::{Schedule, ScheduleId, ScheduleSpec, ScheduleUpdate};

const SELECT_COLUMNS: &str = "SELECT id, job_type, schedule_type, schedule_value, is_active,
        next_run_at, last_run_at, anchor_at, created_at, updated_at
 FROM schedules";

/// Persistent store for schedule definitions and their fire bookkeeping.
pub struct ScheduleStore {
    db: Mutex<Connection>,
}

/// A row as stored, before the definition is parsed.
struct RawSchedule {
    id: String,
    job_type: String,
    schedule_type: String,
    schedule_value: String,
    is_active: bool,
    next_run_at: Option<String>,
    last_run_at: Option<String>,
    anchor_at: String,
    created_at: String,
    updated_at: String,
}

impl ScheduleStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist a new schedule. Active schedules get their first
    /// `next_run_at` computed immediately.
    #[instrument(skip(self))]
    pub fn insert(&self, job_type: &str, spec: ScheduleSpec, is_active: bool) -> Result<Schedule> {
        spec.validate()?;
        let now = db_now();
        let mut schedule = Schedule {
            id: ScheduleId::new(),
            job_type: job_type.to_string(),
            spec,
            is_active,
            next_run_at: None,
            last_run_at: None,
            anchor_at: now,
            created_at: now,
            updated_at: now,
        };
        if is_active {
            schedule.next_run_at = Some(next_or_invalid(&schedule, now)?);
        }

        self.conn().execute(
            "INSERT INTO schedules
             (id, job_type, schedule_type, schedule_value, is_active,
              next_run_at, last_run_at, anchor_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?7, ?7)",
            params![
                schedule.id.as_str(),
                schedule.job_type,
                schedule.spec.schedule_type(),
                serde_json::to_string(&schedule.spec.schedule_value()?)?,
                schedule.is_active,
                schedule.next_run_at.as_ref().map(to_db_time),
                to_db_time(&now),
            ],
        )?;
        info!(schedule_id = %schedule.id, job_type, kind = schedule.spec.schedule_type(), "schedule created");
        Ok(schedule)
    }

    pub fn find(&self, id: &ScheduleId) -> Result<Option<Schedule>> {
        let raw = self
            .conn()
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE id = ?1"),
                [id.as_str()],
                raw_from_row,
            )
            .optional()?;
        raw.map(parse_raw).transpose()
    }

    pub fn get(&self, id: &ScheduleId) -> Result<Schedule> {
        self.find(id)?
            .ok_or_else(|| SchedulerError::ScheduleNotFound { id: id.to_string() })
    }

    /// All schedules, newest first, optionally for one job type. Rows whose
    /// definition no longer parses are logged and skipped.
    pub fn list(&self, job_type: Option<&str>) -> Result<Vec<Schedule>> {
        let rows = match job_type {
            Some(job_type) => self.query(
                &format!("{SELECT_COLUMNS} WHERE job_type = ?1 ORDER BY created_at DESC, id DESC"),
                &[&job_type],
            )?,
            None => self.query(
                &format!("{SELECT_COLUMNS} ORDER BY created_at DESC, id DESC"),
                &[],
            )?,
        };
        Ok(parse_all(rows))
    }

    pub fn list_active(&self) -> Result<Vec<Schedule>> {
        let rows = self.query(
            &format!("{SELECT_COLUMNS} WHERE is_active = 1 ORDER BY created_at"),
            &[],
        )?;
        Ok(parse_all(rows))
    }

    /// Apply a partial edit. A new definition resets the interval anchor;
    /// `next_run_at` is recomputed for active schedules and cleared otherwise.
    #[instrument(skip(self))]
    pub fn update(&self, id: &ScheduleId, update: ScheduleUpdate) -> Result<Schedule> {
        let mut schedule = self.get(id)?;
        let now = db_now();

        if let Some(spec) = update.spec {
            spec.validate()?;
            if spec != schedule.spec {
                schedule.spec = spec;
                schedule.anchor_at = now;
            }
        }
        if let Some(is_active) = update.is_active {
            schedule.is_active = is_active;
        }
        schedule.next_run_at = if schedule.is_active {
            let reference = schedule.last_run_at.map_or(now, |last| last.max(now));
            Some(next_or_invalid(&schedule, reference)?)
        } else {
            None
        };
        schedule.updated_at = now;

        self.conn().execute(
            "UPDATE schedules SET schedule_type = ?2, schedule_value = ?3, is_active = ?4,
                    next_run_at = ?5, anchor_at = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                id.as_str(),
                schedule.spec.schedule_type(),
                serde_json::to_string(&schedule.spec.schedule_value()?)?,
                schedule.is_active,
                schedule.next_run_at.as_ref().map(to_db_time),
                to_db_time(&schedule.anchor_at),
                to_db_time(&now),
            ],
        )?;
        info!(schedule_id = %id, is_active = schedule.is_active, "schedule updated");
        Ok(schedule)
    }

    #[instrument(skip(self))]
    pub fn delete(&self, id: &ScheduleId) -> Result<()> {
        let n = self
            .conn()
            .execute("DELETE FROM schedules WHERE id = ?1", [id.as_str()])?;
        if n == 0 {
            return Err(SchedulerError::ScheduleNotFound { id: id.to_string() });
        }
        info!(schedule_id = %id, "schedule deleted");
        Ok(())
    }

    /// Engine bookkeeping; leaves `updated_at` alone so timers are not
    /// considered edited.
    pub fn set_next_run(&self, id: &ScheduleId, next: Option<DateTime<Utc>>) -> Result<()> {
        self.conn().execute(
            "UPDATE schedules SET next_run_at = ?2 WHERE id = ?1",
            params![id.as_str(), next.as_ref().map(to_db_time)],
        )?;
        Ok(())
    }

    /// Claim the fire at `due`: record it as the last run and store `next`.
    ///
    /// Returns `false` when the schedule is inactive, gone, or `due` was
    /// already claimed, so each due instant fires at most once no matter how
    /// many timers race for it.
    pub fn claim_fire(
        &self,
        id: &ScheduleId,
        due: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let due = to_db_time(&due);
        let n = self.conn().execute(
            "UPDATE schedules SET last_run_at = ?2, next_run_at = ?3
             WHERE id = ?1 AND is_active = 1
               AND (last_run_at IS NULL OR last_run_at < ?2)",
            params![id.as_str(), due, next.as_ref().map(to_db_time)],
        )?;
        Ok(n == 1)
    }

    // --- private helpers ---------------------------------------------------

    fn query(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<RawSchedule>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, raw_from_row)?
            .filter_map(|row| match row {
                Ok(raw) => Some(raw),
                Err(e) => {
                    warn!("skipping unreadable schedule row: {e}");
                    None
                }
            })
            .collect();
        Ok(rows)
    }
}

fn next_or_invalid(schedule: &Schedule, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
    calculate_next_run(schedule, reference).ok_or_else(|| {
        SchedulerError::InvalidSchedule(format!(
            "{} schedule has no next run",
            schedule.spec.schedule_type()
        ))
    })
}

fn raw_from_row(row: &Row<'_>) -> rusqlite::Result<RawSchedule> {
    Ok(RawSchedule {
        id: row.get(0)?,
        job_type: row.get(1)?,
        schedule_type: row.get(2)?,
        schedule_value: row.get(3)?,
        is_active: row.get(4)?,
        next_run_at: row.get(5)?,
        last_run_at: row.get(6)?,
        anchor_at: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn parse_raw(raw: RawSchedule) -> Result<Schedule> {
    let value: serde_json::Value = serde_json::from_str(&raw.schedule_value).map_err(|e| {
        SchedulerError::InvalidSchedule(format!("schedule {}: bad schedule_value: {e}", raw.id))
    })?;
    let spec = ScheduleSpec::from_parts(&raw.schedule_type, value)?;
    let time = |field: &str, value: &str| {
        from_db_time(value).ok_or_else(|| {
            SchedulerError::InvalidSchedule(format!("schedule {}: bad {field}: {value}", raw.id))
        })
    };

    Ok(Schedule {
        spec,
        is_active: raw.is_active,
        next_run_at: raw.next_run_at.as_deref().and_then(from_db_time),
        last_run_at: raw.last_run_at.as_deref().and_then(from_db_time),
        anchor_at: time("anchor_at", &raw.anchor_at)?,
        created_at: time("created_at", &raw.created_at)?,
        updated_at: time("updated_at", &raw.updated_at)?,
        id: ScheduleId(raw.id),
        job_type: raw.job_type,
    })
}

fn parse_all(rows: Vec<RawSchedule>) -> Vec<Schedule> {
    rows.into_iter()
        .filter_map(|raw| {
            let id = raw.id.clone();
            match parse_raw(raw) {
                Ok(schedule) => Some(schedule),
                Err(e) => {
                    warn!(schedule_id = %id, "skipping unreadable schedule: {e}");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IntervalSpec;

    fn store() -> ScheduleStore {
        ScheduleStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn every(minutes: u32) -> ScheduleSpec {
        ScheduleSpec::Interval(IntervalSpec {
            minutes: Some(minutes),
            ..Default::default()
        })
    }

    #[test]
    fn insert_computes_next_run_and_reads_back() {
        let store = store();
        let created = store
            .insert("ohlcv_load", ScheduleSpec::Daily { hour: 9, minute: 0 }, true)
            .unwrap();
        let next = created.next_run_at.unwrap();
        assert!(next > created.created_at);
        assert_eq!(store.get(&created.id).unwrap(), created);
    }

    #[test]
    fn inactive_schedule_has_no_next_run() {
        let store = store();
        let created = store.insert("ohlcv_load", every(30), false).unwrap();
        assert_eq!(created.next_run_at, None);
        assert!(store.list_active().unwrap().is_empty());
        assert_eq!(store.list(None).unwrap().len(), 1);
    }

    #[test]
    fn insert_rejects_values_that_never_fire() {
        let store = store();
        let err = store
            .insert("ohlcv_load", ScheduleSpec::Daily { hour: 25, minute: 0 }, true)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
        assert!(store.list(None).unwrap().is_empty());
    }

    #[test]
    fn list_filters_by_job_type_newest_first() {
        let store = store();
        let a = store.insert("ohlcv_load", every(30), true).unwrap();
        let b = store.insert("signal_process", every(60), true).unwrap();
        let c = store.insert("ohlcv_load", every(90), true).unwrap();

        let ids: Vec<_> = store.list(None).unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![c.id.clone(), b.id.clone(), a.id.clone()]);

        let ids: Vec<_> = store
            .list(Some("ohlcv_load"))
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![c.id, a.id]);
    }

    #[test]
    fn update_resets_anchor_only_when_definition_changes() {
        let store = store();
        let created = store.insert("ohlcv_load", every(30), true).unwrap();

        let toggled = store
            .update(
                &created.id,
                ScheduleUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!toggled.is_active);
        assert_eq!(toggled.next_run_at, None);
        assert_eq!(toggled.anchor_at, created.anchor_at);
        assert!(toggled.updated_at >= created.updated_at);

        let same = store
            .update(
                &created.id,
                ScheduleUpdate {
                    spec: Some(every(30)),
                    is_active: Some(true),
                },
            )
            .unwrap();
        assert_eq!(same.anchor_at, created.anchor_at);
        assert!(same.next_run_at.is_some());

        let changed = store
            .update(
                &created.id,
                ScheduleUpdate {
                    spec: Some(every(45)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(changed.anchor_at >= same.updated_at);
        assert_eq!(changed.spec, every(45));
        assert_eq!(store.get(&created.id).unwrap(), changed);
    }

    #[test]
    fn update_and_delete_unknown_schedule() {
        let store = store();
        let missing = ScheduleId::new();
        assert!(matches!(
            store.update(&missing, ScheduleUpdate::default()),
            Err(SchedulerError::ScheduleNotFound { .. })
        ));
        assert!(matches!(
            store.delete(&missing),
            Err(SchedulerError::ScheduleNotFound { .. })
        ));
    }

    #[test]
    fn claim_fire_accepts_each_instant_once() {
        let store = store();
        let s = store.insert("ohlcv_load", every(30), true).unwrap();
        let due = s.next_run_at.unwrap();
        let next = due + chrono::Duration::minutes(30);

        assert!(store.claim_fire(&s.id, due, Some(next)).unwrap());
        assert!(!store.claim_fire(&s.id, due, Some(next)).unwrap());

        let after = store.get(&s.id).unwrap();
        assert_eq!(after.last_run_at, Some(due));
        assert_eq!(after.next_run_at, Some(next));
        // Fire bookkeeping is not an edit.
        assert_eq!(after.updated_at, s.updated_at);

        assert!(store.claim_fire(&s.id, next, None).unwrap());
    }

    #[test]
    fn claim_fire_refuses_inactive_schedule() {
        let store = store();
        let s = store.insert("ohlcv_load", every(30), false).unwrap();
        assert!(!store.claim_fire(&s.id, db_now(), None).unwrap());
    }

    #[test]
    fn unreadable_rows_are_skipped_in_listings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("schedules.db");
        let store = ScheduleStore::new(Connection::open(&path).unwrap()).unwrap();
        let good = store.insert("ohlcv_load", every(30), true).unwrap();

        let raw = Connection::open(&path).unwrap();
        let now = to_db_time(&db_now());
        raw.execute(
            "INSERT INTO schedules (id, job_type, schedule_type, schedule_value, is_active,
                                    anchor_at, created_at, updated_at)
             VALUES ('bad', 'ohlcv_load', 'interval', '{not json', 1, ?1, ?1, ?1)",
            [&now],
        )
        .unwrap();

        let active = store.list_active().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, good.id);
        assert!(matches!(
            store.get(&ScheduleId::from("bad")),
            Err(SchedulerError::InvalidSchedule(_))
        ));
    }
}
