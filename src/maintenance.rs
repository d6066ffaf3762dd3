//! Maintenance window evaluation: one-time windows and cron-recurring
//! windows with an explicit duration, evaluated in the window's own
//! timezone so DST transitions and leap days behave the way an operator
//! scheduling "every Sunday 2-4am America/Chicago" expects.
//!
//! Ported from `maintenance_windows.py`, which uses `croniter` to find the
//! most recent prior occurrence of a cron expression and compares `now`
//! against `[prev_occurrence, prev_occurrence + duration)`. The `cron`
//! crate doesn't expose a "previous occurrence" query directly, so we walk
//! backward from `now` one schedule entry at a time (the schedules here
//! are human cadences - minutes apart at the tightest - so this converges
//! in a handful of steps).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::str::FromStr;

use crate::store::models::MaintenanceWindowRow;
use crate::store::{Store, StoreError};

/// Why a window does or doesn't currently apply.
///
/// When more than one window covers `check_time`, the one whose coverage
/// ends soonest is reported - the window that most immediately constrains
/// what happens next for the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenanceStatus {
    pub in_maintenance: bool,
    pub window_id: Option<i64>,
    pub window_name: Option<String>,
    pub maintenance_end: Option<DateTime<Utc>>,
}

/// A single window's recurrence, parsed from its stored fields.
#[derive(Debug, Clone)]
enum Recurrence {
    OneTime,
    Cron(String),
}

fn parse_recurrence(row: &MaintenanceWindowRow) -> Recurrence {
    match &row.recurrence {
        Some(expr) if !expr.trim().is_empty() => Recurrence::Cron(expr.clone()),
        _ => Recurrence::OneTime,
    }
}

/// How far back to search for a prior cron occurrence before giving up.
/// A year comfortably covers even quarterly maintenance cadences.
const MAX_LOOKBACK: ChronoDuration = ChronoDuration::days(366);

fn most_recent_occurrence(schedule: &Schedule, tz: Tz, now: DateTime<Tz>) -> Option<DateTime<Tz>> {
    // `cron::Schedule` only iterates forward, so seed the search far enough
    // back to find the occurrence immediately preceding `now`, then walk
    // forward keeping the last occurrence that doesn't exceed it.
    let search_start = now - MAX_LOOKBACK;
    let mut last = None;
    for occurrence in schedule.after(&search_start) {
        if occurrence > now {
            break;
        }
        last = Some(occurrence);
    }
    let _ = tz;
    last
}

/// If `window` covers `at` (UTC), return the UTC instant its coverage ends.
fn window_coverage_end(window: &MaintenanceWindowRow, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let tz: Tz = window.timezone.parse().unwrap_or(chrono_tz::UTC);
    let at_tz = at.with_timezone(&tz);

    match parse_recurrence(window) {
        Recurrence::OneTime => {
            if at >= window.start_time && at < window.end_time {
                Some(window.end_time)
            } else {
                None
            }
        }
        Recurrence::Cron(expr) => {
            let schedule = Schedule::from_str(&expr).ok()?;
            let duration = window.end_time - window.start_time;
            if duration <= ChronoDuration::zero() {
                return None;
            }
            let prev = most_recent_occurrence(&schedule, tz, at_tz)?;
            let end_tz = prev + duration;
            if at_tz < end_tz {
                Some(end_tz.with_timezone(&Utc))
            } else {
                None
            }
        }
    }
}

/// Evaluate whether `window` covers `at` (UTC), converting to the window's
/// own timezone for the comparison.
pub fn window_covers(window: &MaintenanceWindowRow, at: DateTime<Utc>) -> bool {
    window_coverage_end(window, at).is_some()
}

/// Evaluate every window applicable to `service_id` and summarize, per
/// spec §4.7. `check_time` defaults to "now" when absent.
///
/// # Errors
///
/// Returns an error if the store lookup of applicable windows fails.
pub async fn get_maintenance_status(
    store: &Store,
    service_id: i64,
    check_time: Option<DateTime<Utc>>,
) -> Result<MaintenanceStatus, StoreError> {
    let at = check_time.unwrap_or_else(Utc::now);
    let windows = store.maintenance_windows_for_service(service_id).await?;
    Ok(summarize(&windows, at))
}

/// Pure variant of [`get_maintenance_status`] over an already-fetched window
/// set, used by callers (and tests) that have the windows in hand.
pub fn summarize(windows: &[MaintenanceWindowRow], at: DateTime<Utc>) -> MaintenanceStatus {
    let most_relevant = windows
        .iter()
        .filter_map(|w| window_coverage_end(w, at).map(|end| (w, end)))
        .min_by_key(|(_, end)| *end);

    match most_relevant {
        Some((window, end)) => MaintenanceStatus {
            in_maintenance: true,
            window_id: Some(window.id),
            window_name: Some(window.name.clone()),
            maintenance_end: Some(end),
        },
        None => MaintenanceStatus {
            in_maintenance: false,
            window_id: None,
            window_name: None,
            maintenance_end: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn one_time_window(start: DateTime<Utc>, end: DateTime<Utc>) -> MaintenanceWindowRow {
        MaintenanceWindowRow {
            id: 1,
            name: "one-time".to_owned(),
            start_time: start,
            end_time: end,
            timezone: "UTC".to_owned(),
            recurrence: None,
            service_ids: vec![],
            created_at: start,
        }
    }

    #[test]
    fn one_time_window_covers_its_range() {
        let start = Utc.with_ymd_and_hms(2026, 7, 1, 2, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 7, 1, 4, 0, 0).unwrap();
        let window = one_time_window(start, end);
        assert!(window_covers(&window, start + ChronoDuration::minutes(30)));
        assert!(!window_covers(&window, end + ChronoDuration::minutes(1)));
        assert!(!window_covers(&window, start - ChronoDuration::minutes(1)));
    }

    #[test]
    fn cron_window_covers_duration_after_prior_occurrence() {
        let mut window = one_time_window(
            Utc.with_ymd_and_hms(2026, 1, 1, 2, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 1, 4, 0, 0).unwrap(),
        );
        window.recurrence = Some("0 0 2 * * * *".to_owned());
        window.timezone = "UTC".to_owned();

        let sunday_230am = Utc.with_ymd_and_hms(2026, 7, 26, 2, 30, 0).unwrap();
        assert!(window_covers(&window, sunday_230am));

        let sunday_5am = Utc.with_ymd_and_hms(2026, 7, 26, 5, 0, 0).unwrap();
        assert!(!window_covers(&window, sunday_5am));
    }

    #[test]
    fn maintenance_status_reports_the_covering_window() {
        let window = one_time_window(
            Utc.with_ymd_and_hms(2026, 7, 26, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 7, 27, 0, 0, 0).unwrap(),
        );
        let status = summarize(&[window], Utc.with_ymd_and_hms(2026, 7, 26, 12, 0, 0).unwrap());
        assert!(status.in_maintenance);
        assert_eq!(status.window_id, Some(1));
        assert_eq!(status.window_name, Some("one-time".to_owned()));
        assert_eq!(status.maintenance_end, Some(Utc.with_ymd_and_hms(2026, 7, 27, 0, 0, 0).unwrap()));
    }

    #[test]
    fn maintenance_status_picks_the_soonest_ending_window_when_overlapping() {
        let soon = one_time_window(
            Utc.with_ymd_and_hms(2026, 7, 26, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 7, 26, 13, 0, 0).unwrap(),
        );
        let mut later = one_time_window(
            Utc.with_ymd_and_hms(2026, 7, 26, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 7, 27, 0, 0, 0).unwrap(),
        );
        later.id = 2;
        later.name = "later".to_owned();

        let status = summarize(&[later, soon], Utc.with_ymd_and_hms(2026, 7, 26, 12, 0, 0).unwrap());
        assert_eq!(status.window_id, Some(1));
        assert_eq!(status.window_name, Some("one-time".to_owned()));
    }

    #[test]
    fn no_coverage_when_no_window_applies() {
        let window = one_time_window(
            Utc.with_ymd_and_hms(2026, 7, 26, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 7, 27, 0, 0, 0).unwrap(),
        );
        let status = summarize(&[window], Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap());
        assert!(!status.in_maintenance);
        assert_eq!(status.window_id, None);
        assert_eq!(status.maintenance_end, None);
    }
}
