use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};

use crate::error::{Result, SchedulerError};
use crate::types::{CronSpec, IntervalSpec, Schedule, ScheduleSpec};

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Earliest fire time of `schedule` strictly after `now`.
///
/// `None` means the schedule value cannot produce a fire time (out of range
/// hour, zero interval, unparsable cron field, ...).
pub fn calculate_next_run(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    next_fire(&schedule.spec, schedule.anchor_at, now)
}

/// [`calculate_next_run`] on the bare definition. `anchor` only matters for
/// interval schedules.
pub fn next_fire(
    spec: &ScheduleSpec,
    anchor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match spec {
        ScheduleSpec::Daily { hour, minute } => {
            let time = NaiveTime::from_hms_opt(*hour, *minute, 0)?;
            let candidate = now.date_naive().and_time(time).and_utc();
            if candidate > now {
                Some(candidate)
            } else {
                candidate.checked_add_signed(Duration::days(1))
            }
        }

        ScheduleSpec::Weekly {
            day_of_week,
            hour,
            minute,
        } => {
            if *day_of_week > 6 {
                return None;
            }
            let time = NaiveTime::from_hms_opt(*hour, *minute, 0)?;
            let today = now.weekday().num_days_from_monday() as i64;
            let days_ahead = (*day_of_week as i64 - today).rem_euclid(7);
            let candidate = now
                .date_naive()
                .checked_add_signed(Duration::days(days_ahead))?
                .and_time(time)
                .and_utc();
            if candidate > now {
                Some(candidate)
            } else {
                candidate.checked_add_signed(Duration::days(7))
            }
        }

        ScheduleSpec::Interval(interval) => {
            let period = interval_period(interval)?;
            let step = period.num_seconds();
            let elapsed = (now - anchor).num_seconds();
            // Smallest k >= 1 with anchor + k * period > now.
            let k = if now < anchor { 1 } else { elapsed / step + 1 };
            let offset = Duration::try_seconds(step.checked_mul(k)?)?;
            let next = anchor.checked_add_signed(offset)?;
            // Sub-second remainder of `now - anchor` can leave `next == now`.
            if next <= now {
                next.checked_add_signed(period)
            } else {
                Some(next)
            }
        }

        ScheduleSpec::Cron(cron) => {
            let expression = cron_expression(cron)?;
            cron::Schedule::from_str(&expression)
                .ok()?
                .after(&now)
                .next()
        }
    }
}

impl ScheduleSpec {
    /// Reject definitions that can never fire.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(SchedulerError::InvalidSchedule(reason));
        match self {
            ScheduleSpec::Daily { hour, minute } | ScheduleSpec::Weekly { hour, minute, .. }
                if *hour > 23 || *minute > 59 =>
            {
                invalid(format!("time {hour:02}:{minute:02} is out of range"))
            }
            ScheduleSpec::Weekly { day_of_week, .. } if *day_of_week > 6 => invalid(format!(
                "day_of_week {day_of_week} is out of range (0 = Monday .. 6 = Sunday)"
            )),
            ScheduleSpec::Interval(interval) => match interval_period(interval) {
                None => invalid(
                    "interval needs exactly one of hours, minutes or days, greater than zero"
                        .to_string(),
                ),
                Some(period) if Utc::now().checked_add_signed(period).is_none() => {
                    invalid(format!("interval of {} days is too long", period.num_days()))
                }
                Some(_) => Ok(()),
            },
            ScheduleSpec::Cron(cron) => {
                let expression = cron_expression(cron)
                    .ok_or_else(|| SchedulerError::InvalidSchedule("bad day_of_week".to_string()))?;
                cron::Schedule::from_str(&expression).map_err(|e| {
                    SchedulerError::InvalidSchedule(format!("cron '{expression}': {e}"))
                })?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn interval_period(interval: &IntervalSpec) -> Option<Duration> {
    match (interval.hours, interval.minutes, interval.days) {
        (Some(n), None, None) if n > 0 => Duration::try_hours(n as i64),
        (None, Some(n), None) if n > 0 => Duration::try_minutes(n as i64),
        (None, None, Some(n)) if n > 0 => Duration::try_days(n as i64),
        _ => None,
    }
}

/// Six-field expression for the `cron` crate: a zero seconds field, then the
/// five standard fields with numeric weekdays rewritten as names (the crate
/// numbers Sunday as 1).
fn cron_expression(cron: &CronSpec) -> Option<String> {
    Some(format!(
        "0 {} {} {} {} {}",
        cron.minute,
        cron.hour,
        cron.day,
        cron.month,
        weekday_field(&cron.day_of_week.to_string())?
    ))
}

/// Rewrite a standard weekday field (0/7 = Sunday) into day names. Parts
/// that already use names pass through.
fn weekday_field(field: &str) -> Option<String> {
    if field == "*" || field == "?" {
        return Some(field.to_string());
    }

    let mut days: Vec<usize> = Vec::new();
    let mut named: Vec<String> = Vec::new();
    for part in field.split(',') {
        if part.chars().any(|c| c.is_ascii_alphabetic()) {
            named.push(part.to_ascii_uppercase());
            continue;
        }
        let (base, step) = match part.split_once('/') {
            Some((base, step)) => (base, step.parse::<usize>().ok().filter(|s| *s > 0)?),
            None => (part, 1),
        };
        let (lo, hi) = match base.split_once('-') {
            _ if base == "*" => (0, 6),
            Some((a, b)) => (a.parse::<usize>().ok()?, b.parse::<usize>().ok()?),
            None => {
                let d = base.parse::<usize>().ok()?;
                (d, if step > 1 { 6 } else { d })
            }
        };
        if lo > hi || hi > 7 {
            return None;
        }
        for d in (lo..=hi).step_by(step) {
            let d = d % 7;
            if !days.contains(&d) {
                days.push(d);
            }
        }
    }

    days.sort_unstable();
    let mut parts: Vec<String> = days.iter().map(|d| WEEKDAY_NAMES[*d].to_string()).collect();
    parts.extend(named);
    Some(parts.join(","))
}
