//! Job-run start/completion correlation, duration statistics, and stale-run
//! detection.
//!
//! Ported from `job_runs.py`. A run is identified by `(service_id, run_id)`;
//! a `STARTED` event opens the row, a `COMPLETED`/`FAILED` event closes it
//! and computes `duration_ms`. A completion with no matching start is still
//! recorded - `duration_ms = 0` - per spec §9's resolution of that edge
//! case, since there's no way to know how long the run actually took.

use chrono::{DateTime, Utc};

use crate::store::models::{HeartbeatStatus, JobRun};
use crate::store::{Store, StoreError};

/// A run older than this with no completion is considered stale.
pub const DEFAULT_STALE_AFTER_SECS: i64 = 3600;

/// Record a `STARTED` heartbeat as the opening half of a job run.
///
/// Returns `None` if a run with this `run_id` already exists for the
/// service (a duplicate start is ignored, not an error).
pub async fn record_job_start(
    store: &Store,
    service_id: i64,
    run_id: &str,
    started_at: DateTime<Utc>,
) -> Result<Option<i64>, StoreError> {
    if store.get_job_run(service_id, run_id).await?.is_some() {
        return Ok(None);
    }
    let id = store.insert_job_start(service_id, run_id, started_at).await?;
    Ok(Some(id))
}

/// Record a `COMPLETED`/`FAILED` heartbeat as the closing half of a job
/// run, computing `duration_ms` from the matching start if one exists.
///
/// Returns `None` if a run with this `run_id` was already completed
/// (duplicate completion; not an error, just a no-op after the first).
pub async fn record_job_completion(
    store: &Store,
    service_id: i64,
    run_id: &str,
    status: HeartbeatStatus,
    completed_at: DateTime<Utc>,
) -> Result<Option<i64>, StoreError> {
    let status_str = status.as_str();
    match store.get_job_run(service_id, run_id).await? {
        None => {
            let id = store
                .insert_completion_only_run(service_id, run_id, completed_at, status_str)
                .await?;
            Ok(Some(id))
        }
        Some(existing) if existing.completed_at.is_some() => {
            // Already completed once; a second completion event for the
            // same run_id is a no-op rather than overwriting history.
            Ok(None)
        }
        Some(existing) => {
            let duration_ms = match existing.started_at {
                Some(started) => {
                    let delta = completed_at - started;
                    delta.num_milliseconds().max(0)
                }
                None => 0,
            };
            store
                .complete_job_run(existing.id, completed_at, duration_ms, status_str)
                .await?;
            Ok(Some(existing.id))
        }
    }
}

/// Summary statistics over a service's completed run durations.
#[derive(Debug, Clone, PartialEq)]
pub struct DurationStats {
    pub count: usize,
    pub min_ms: i64,
    pub max_ms: i64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Linear-interpolation percentile over a sorted slice, matching the
/// original's `numpy`-equivalent method (`R-7` / Excel `PERCENTILE.INC`).
fn percentile(sorted: &[i64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = p * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower] as f64;
    }
    let fraction = rank - lower as f64;
    let lower_val = sorted[lower] as f64;
    let upper_val = sorted[upper] as f64;
    lower_val + (upper_val - lower_val) * fraction
}

/// Compute duration statistics over the most recent `limit` completed runs.
pub async fn duration_stats(store: &Store, service_id: i64, limit: i64) -> Result<Option<DurationStats>, StoreError> {
    let runs = store.completed_runs_for_service(service_id, limit).await?;
    let mut durations: Vec<i64> = runs.into_iter().filter_map(|r| r.duration_ms).collect();
    if durations.is_empty() {
        return Ok(None);
    }
    durations.sort_unstable();
    Ok(Some(DurationStats {
        count: durations.len(),
        min_ms: *durations.first().expect("non-empty"),
        max_ms: *durations.last().expect("non-empty"),
        p50_ms: percentile(&durations, 0.50),
        p95_ms: percentile(&durations, 0.95),
        p99_ms: percentile(&durations, 0.99),
    }))
}

/// `STARTED` runs that have exceeded [`DEFAULT_STALE_AFTER_SECS`] with no
/// completion, excluding runs already flagged `STALE_ALERTED`.
pub async fn find_stale_runs(
    store: &Store,
    now: DateTime<Utc>,
    stale_after_secs: i64,
    service_id: Option<i64>,
) -> Result<Vec<JobRun>, StoreError> {
    let older_than = now - chrono::Duration::seconds(stale_after_secs);
    store.stale_runs(older_than, service_id).await
}

/// Mark a stale run as alerted so the monitor loop doesn't re-alert on it
/// every tick.
pub async fn mark_stale_alerted(store: &Store, run_id: i64) -> Result<(), StoreError> {
    store.mark_stale_run_alerted(run_id).await
}

/// Whether a completed run's duration exceeded the service's configured
/// `max_duration_ms`.
pub fn exceeded_max_duration(duration_ms: i64, max_duration_ms: Option<i64>) -> bool {
    match max_duration_ms {
        Some(max) => duration_ms > max,
        None => false,
    }
}

/// Why a duration-threshold alert was raised for a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationAlertType {
    /// A `STARTED` run ran longer than `max_duration_ms` with no completion.
    Stale,
    /// A completed run's `duration_ms` exceeded `max_duration_ms`.
    Exceeded,
}

/// A duration-threshold alert raised by the job run tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurationAlert {
    pub service_id: i64,
    pub run_id: String,
    pub alert_type: DurationAlertType,
    pub elapsed_ms: i64,
    pub max_duration_ms: i64,
}

/// Scan for stale `STARTED` runs and emit duration alerts, marking each
/// alerted run `STALE_ALERTED` so the same run never alerts twice.
pub async fn check_stale_runs(
    store: &Store,
    now: DateTime<Utc>,
    stale_after_secs: i64,
) -> Result<Vec<DurationAlert>, StoreError> {
    let stale = find_stale_runs(store, now, stale_after_secs, None).await?;
    let mut alerts = Vec::new();
    for run in stale {
        let Some(started) = run.started_at else { continue };
        let Some(service) = store.get_service(run.service_id).await? else {
            continue;
        };
        let Some(max_duration_ms) = service.max_duration_ms else {
            continue;
        };
        let elapsed_ms = (now - started).num_milliseconds().max(0);
        if elapsed_ms > max_duration_ms {
            alerts.push(DurationAlert {
                service_id: run.service_id,
                run_id: run.run_id,
                alert_type: DurationAlertType::Stale,
                elapsed_ms,
                max_duration_ms,
            });
            mark_stale_alerted(store, run.id).await?;
        }
    }
    Ok(alerts)
}

/// Check whether a just-completed run's duration warrants an "exceeded"
/// alert, given the owning service's `max_duration_ms`.
pub fn check_completed_duration(
    service_id: i64,
    run_id: &str,
    duration_ms: i64,
    max_duration_ms: Option<i64>,
) -> Option<DurationAlert> {
    let max_duration_ms = max_duration_ms?;
    if duration_ms > max_duration_ms {
        Some(DurationAlert {
            service_id,
            run_id: run_id.to_owned(),
            alert_type: DurationAlertType::Exceeded,
            elapsed_ms: duration_ms,
            max_duration_ms,
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::Service;

    async fn seed_service(store: &Store) -> i64 {
        let now = Utc::now();
        store
            .insert_service(&Service {
                id: 0,
                heartbeat_name: "svc".to_owned(),
                service_name: "svc".to_owned(),
                active: true,
                muted: false,
                down: false,
                alert_interval: 5,
                threshold: 1,
                grace_period_seconds: 0,
                team_id: None,
                priority: "p3".to_owned(),
                runbook: None,
                max_duration_ms: Some(1000),
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("insert service")
    }

    #[tokio::test]
    async fn start_then_completion_computes_duration() {
        let store = Store::open_in_memory().await.expect("open store");
        let service_id = seed_service(&store).await;
        let started = Utc::now();

        record_job_start(&store, service_id, "run-1", started)
            .await
            .expect("start");
        let completed = started + chrono::Duration::milliseconds(2500);
        record_job_completion(&store, service_id, "run-1", HeartbeatStatus::Completed, completed)
            .await
            .expect("complete");

        let run = store
            .get_job_run(service_id, "run-1")
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(run.duration_ms, Some(2500));
        assert_eq!(run.status, "COMPLETED");
    }

    #[tokio::test]
    async fn completion_only_run_has_zero_duration() {
        let store = Store::open_in_memory().await.expect("open store");
        let service_id = seed_service(&store).await;
        let completed = Utc::now();

        record_job_completion(&store, service_id, "run-2", HeartbeatStatus::Completed, completed)
            .await
            .expect("complete");

        let run = store
            .get_job_run(service_id, "run-2")
            .await
            .expect("lookup")
            .expect("exists");
        assert_eq!(run.duration_ms, Some(0));
    }

    #[tokio::test]
    async fn duplicate_start_is_a_no_op() {
        let store = Store::open_in_memory().await.expect("open store");
        let service_id = seed_service(&store).await;
        let started = Utc::now();

        let first = record_job_start(&store, service_id, "run-3", started).await.expect("start");
        assert!(first.is_some());
        let second = record_job_start(&store, service_id, "run-3", started).await.expect("start");
        assert!(second.is_none());
    }

    #[test]
    fn percentile_matches_linear_interpolation() {
        let sorted = vec![10, 20, 30, 40, 100];
        assert_eq!(percentile(&sorted, 0.5), 30.0);
        assert!((percentile(&sorted, 0.95) - 84.0).abs() < 1e-9);
    }

    #[test]
    fn exceeded_max_duration_checks_threshold() {
        assert!(exceeded_max_duration(1500, Some(1000)));
        assert!(!exceeded_max_duration(500, Some(1000)));
        assert!(!exceeded_max_duration(500, None));
    }

    #[test]
    fn completed_duration_alert_fires_only_over_threshold() {
        assert!(check_completed_duration(1, "run", 2000, Some(1000)).is_some());
        assert!(check_completed_duration(1, "run", 500, Some(1000)).is_none());
        assert!(check_completed_duration(1, "run", 5000, None).is_none());
    }

    #[tokio::test]
    async fn stale_run_alerts_once_then_is_excluded() {
        let store = Store::open_in_memory().await.expect("open store");
        let service_id = seed_service(&store).await;
        let started = Utc::now() - chrono::Duration::hours(2);
        record_job_start(&store, service_id, "run-stale", started)
            .await
            .expect("start");

        let now = Utc::now();
        let alerts = check_stale_runs(&store, now, DEFAULT_STALE_AFTER_SECS)
            .await
            .expect("check stale");
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, DurationAlertType::Stale);

        let alerts_again = check_stale_runs(&store, now, DEFAULT_STALE_AFTER_SECS)
            .await
            .expect("check stale again");
        assert!(alerts_again.is_empty());
    }
}
