//! Recurring schedule calculation.
//!
//! A [`RecurringSpec`] is a value object: construct it with one of the fluent
//! constructors, optionally bound it with `with_max_runs`/`with_run_until`,
//! and ask it for the next due time with [`RecurringSpec::calculate_next_run`].
//! The engine never interprets the schedule kind itself — it only ever calls
//! `calculate_next_run`.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The trigger component of a recurring schedule. Exactly one kind is active
/// per spec; bounds (`max_runs`, `run_until_utc`) live alongside it on
/// [`RecurringSpec`] rather than per-kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecurringKind {
    /// Fire once, immediately, then stop.
    RunNow,
    /// Fire once, at an absolute time, then stop.
    SpecificRunTime(DateTime<Utc>),
    /// Fire once, after a relative delay from the moment the spec is
    /// evaluated, then stop.
    InitialDelay(Duration),
    /// Evaluate a cron expression (5- or 6-field, as accepted by the `cron`
    /// crate) for the next occurrence strictly after `now`.
    Cron(String),
    /// Every `n` seconds.
    Second(u32),
    /// Every `n` minutes.
    Minute(u32),
    /// Every `n` hours.
    Hour(u32),
    /// Every `interval` days, optionally restricted to a day-of-week mask
    /// (bit 0 = Monday .. bit 6 = Sunday) and/or fired at a fixed time of day.
    Day {
        interval: u32,
        day_of_week_mask: Option<u8>,
        time_of_day: Option<NaiveTime>,
    },
    /// Every `interval` months, optionally pinned to a day-of-month and/or a
    /// fixed time of day.
    Month {
        interval: u32,
        day_of_month: Option<u32>,
        time_of_day: Option<NaiveTime>,
    },
}

/// A complete recurring schedule: a trigger plus optional bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringSpec {
    pub kind: RecurringKind,
    pub max_runs: Option<u32>,
    pub run_until_utc: Option<DateTime<Utc>>,
}

impl RecurringSpec {
    fn new(kind: RecurringKind) -> Self {
        RecurringSpec {
            kind,
            max_runs: None,
            run_until_utc: None,
        }
    }

    pub fn run_now() -> Self {
        Self::new(RecurringKind::RunNow)
    }

    pub fn specific_run_time(at: DateTime<Utc>) -> Self {
        Self::new(RecurringKind::SpecificRunTime(at))
    }

    pub fn initial_delay(delay: Duration) -> Self {
        Self::new(RecurringKind::InitialDelay(delay))
    }

    /// Parse and validate a cron expression eagerly, so a malformed schedule
    /// fails at configuration time rather than the first time it is due.
    pub fn cron(expression: impl Into<String>) -> Result<Self, cron::error::Error> {
        let expression = expression.into();
        let _ = expression.parse::<cron::Schedule>()?;
        Ok(Self::new(RecurringKind::Cron(expression)))
    }

    pub fn every_seconds(n: u32) -> Self {
        Self::new(RecurringKind::Second(n.max(1)))
    }

    pub fn every_minutes(n: u32) -> Self {
        Self::new(RecurringKind::Minute(n.max(1)))
    }

    pub fn every_hours(n: u32) -> Self {
        Self::new(RecurringKind::Hour(n.max(1)))
    }

    pub fn every_days(interval: u32) -> Self {
        Self::new(RecurringKind::Day {
            interval: interval.max(1),
            day_of_week_mask: None,
            time_of_day: None,
        })
    }

    pub fn every_months(interval: u32) -> Self {
        Self::new(RecurringKind::Month {
            interval: interval.max(1),
            day_of_month: None,
            time_of_day: None,
        })
    }

    /// Restrict a `Day` schedule to specific weekdays (bit 0 = Monday .. bit
    /// 6 = Sunday). No-op on other kinds.
    pub fn on_days_of_week(mut self, mask: u8) -> Self {
        if let RecurringKind::Day {
            day_of_week_mask, ..
        } = &mut self.kind
        {
            *day_of_week_mask = Some(mask);
        }
        self
    }

    /// Pin a `Month` schedule to a specific day of month (1-31, clamped to
    /// the month's actual length). No-op on other kinds.
    pub fn on_day_of_month(mut self, day: u32) -> Self {
        if let RecurringKind::Month { day_of_month, .. } = &mut self.kind {
            *day_of_month = Some(day.clamp(1, 31));
        }
        self
    }

    /// Pin a `Day` or `Month` schedule to a fixed time of day. No-op on other
    /// kinds.
    pub fn at_time(mut self, time: NaiveTime) -> Self {
        match &mut self.kind {
            RecurringKind::Day { time_of_day, .. } => *time_of_day = Some(time),
            RecurringKind::Month { time_of_day, .. } => *time_of_day = Some(time),
            _ => {}
        }
        self
    }

    pub fn with_max_runs(mut self, max_runs: u32) -> Self {
        self.max_runs = Some(max_runs);
        self
    }

    pub fn with_run_until(mut self, until: DateTime<Utc>) -> Self {
        self.run_until_utc = Some(until);
        self
    }

    fn bounds_exhausted(&self, now: DateTime<Utc>, current_run_count: u32) -> bool {
        if let Some(max_runs) = self.max_runs {
            if current_run_count >= max_runs {
                return true;
            }
        }
        if let Some(until) = self.run_until_utc {
            if now >= until {
                return true;
            }
        }
        false
    }

    /// Returns the next due time strictly after `now`, or `None` if bounds
    /// are exhausted or the trigger is a one-shot that has already fired
    /// (`current_run_count > 0`).
    pub fn calculate_next_run(
        &self,
        now: DateTime<Utc>,
        current_run_count: u32,
    ) -> Option<DateTime<Utc>> {
        if self.bounds_exhausted(now, current_run_count) {
            return None;
        }

        match &self.kind {
            RecurringKind::RunNow => {
                if current_run_count == 0 {
                    Some(now)
                } else {
                    None
                }
            }
            RecurringKind::SpecificRunTime(at) => {
                if current_run_count == 0 {
                    Some(*at)
                } else {
                    None
                }
            }
            RecurringKind::InitialDelay(delay) => {
                if current_run_count == 0 {
                    Some(now + ChronoDuration::from_std(*delay).unwrap_or_default())
                } else {
                    None
                }
            }
            RecurringKind::Cron(expression) => {
                let schedule: cron::Schedule = expression
                    .parse()
                    .expect("cron expression validated at construction");
                schedule.after(&now).next()
            }
            RecurringKind::Second(n) => Some(now + ChronoDuration::seconds(*n as i64)),
            RecurringKind::Minute(n) => Some(now + ChronoDuration::minutes(*n as i64)),
            RecurringKind::Hour(n) => Some(now + ChronoDuration::hours(*n as i64)),
            RecurringKind::Day {
                interval,
                day_of_week_mask,
                time_of_day,
            } => Some(next_day_occurrence(now, *interval, *day_of_week_mask, *time_of_day)),
            RecurringKind::Month {
                interval,
                day_of_month,
                time_of_day,
            } => Some(next_month_occurrence(
                now,
                *interval,
                *day_of_month,
                *time_of_day,
            )),
        }
    }
}

fn at_time_of(date_time: DateTime<Utc>, time_of_day: Option<NaiveTime>) -> DateTime<Utc> {
    match time_of_day {
        Some(t) => date_time
            .with_hour(t.hour())
            .and_then(|d| d.with_minute(t.minute()))
            .and_then(|d| d.with_second(t.second()))
            .unwrap_or(date_time),
        None => date_time,
    }
}

/// Weekday bitmask: Monday = bit 0 .. Sunday = bit 6.
fn weekday_bit(day: chrono::Weekday) -> u8 {
    1 << day.num_days_from_monday()
}

fn next_day_occurrence(
    now: DateTime<Utc>,
    interval: u32,
    day_of_week_mask: Option<u8>,
    time_of_day: Option<NaiveTime>,
) -> DateTime<Utc> {
    match day_of_week_mask {
        None => at_time_of(now + ChronoDuration::days(interval as i64), time_of_day),
        Some(mask) => {
            // Walk forward day by day (bounded — a week always contains a match
            // unless the mask is empty) looking for the next allowed weekday.
            for offset in 1..=14i64 {
                let candidate = now + ChronoDuration::days(offset);
                if mask & weekday_bit(candidate.weekday()) != 0 {
                    let candidate = at_time_of(candidate, time_of_day);
                    if candidate > now {
                        return candidate;
                    }
                }
            }
            // No weekday matched the mask within two weeks (empty mask) — fall
            // back to the plain interval so the schedule still makes progress.
            at_time_of(now + ChronoDuration::days(interval.max(1) as i64), time_of_day)
        }
    }
}

fn add_months(date_time: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    let total_months = date_time.month0() as i64 + months as i64;
    let year = date_time.year() + (total_months / 12) as i32;
    let month = (total_months % 12) as u32 + 1;
    let day = date_time.day();
    let days_in_month = days_in_month(year, month);
    date_time
        .with_year(year)
        .and_then(|d| d.with_month(month))
        .and_then(|d| d.with_day(day.min(days_in_month)))
        .unwrap_or(date_time)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        chrono::NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        chrono::NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    let this = chrono::NaiveDate::from_ymd_opt(year, month, 1);
    match (this, next) {
        (Some(this), Some(next)) => (next - this).num_days() as u32,
        _ => 28,
    }
}

fn next_month_occurrence(
    now: DateTime<Utc>,
    interval: u32,
    day_of_month: Option<u32>,
    time_of_day: Option<NaiveTime>,
) -> DateTime<Utc> {
    let mut candidate = add_months(now, interval.max(1));
    if let Some(day) = day_of_month {
        let days_in_month = days_in_month(candidate.year(), candidate.month());
        candidate = candidate
            .with_day(day.clamp(1, days_in_month))
            .unwrap_or(candidate);
    }
    at_time_of(candidate, time_of_day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_now_fires_once() {
        let spec = RecurringSpec::run_now();
        let now = Utc::now();
        assert_eq!(spec.calculate_next_run(now, 0), Some(now));
        assert_eq!(spec.calculate_next_run(now, 1), None);
    }

    #[test]
    fn second_interval_advances_from_now() {
        let spec = RecurringSpec::every_seconds(5);
        let now = Utc::now();
        assert_eq!(
            spec.calculate_next_run(now, 3),
            Some(now + ChronoDuration::seconds(5))
        );
    }

    #[test]
    fn max_runs_exhausts_schedule() {
        let spec = RecurringSpec::every_seconds(1).with_max_runs(3);
        let now = Utc::now();
        assert!(spec.calculate_next_run(now, 2).is_some());
        assert_eq!(spec.calculate_next_run(now, 3), None);
    }

    #[test]
    fn run_until_exhausts_schedule() {
        let now = Utc::now();
        let spec = RecurringSpec::every_minutes(1).with_run_until(now);
        assert_eq!(spec.calculate_next_run(now, 0), None);
    }

    #[test]
    fn cron_rejects_invalid_expression_at_construction() {
        assert!(RecurringSpec::cron("not a cron expression").is_err());
    }

    #[test]
    fn cron_next_run_is_strictly_future() {
        let spec = RecurringSpec::cron("0 * * * * *").unwrap();
        let now = Utc::now();
        let next = spec.calculate_next_run(now, 0).unwrap();
        assert!(next > now);
    }

    #[test]
    fn monthly_clamps_day_of_month_to_shorter_months() {
        let spec = RecurringSpec::every_months(1).on_day_of_month(31);
        let now = DateTime::parse_from_rfc3339("2026-01-31T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let next = spec.calculate_next_run(now, 0).unwrap();
        assert_eq!(next.month(), 2);
        assert_eq!(next.day(), 28);
    }

    #[test]
    fn weekly_mask_finds_next_matching_weekday() {
        // Monday bit only.
        let spec = RecurringSpec::every_days(1).on_days_of_week(0b0000001);
        let now = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z") // Thursday
            .unwrap()
            .with_timezone(&Utc);
        let next = spec.calculate_next_run(now, 0).unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Mon);
        assert!(next > now);
    }
}
