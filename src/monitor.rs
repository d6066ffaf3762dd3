//! The heartbeat monitor loop: per-service evaluation, alert open/continue/close,
//! and hand-off into the trigger evaluator.
//!
//! Ported from `monitor.py`'s `queryForNoHeartbeat`/`sendAlert`/`closeAlert`
//! trio, restructured as a bounded-concurrency sweep with a keyed lock per
//! service (spec §4.1: "each service must be processed by at most one worker
//! at a time"), matching the worker-pool shape of the teacher's daemon loop
//! in `flatline/src/main.rs`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, warn};

use crate::alert_router::{self, AlertRouter, NotificationPayload, Severity};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::maintenance;
use crate::store::models::{Service, ServicePatch};
use crate::store::{Store, StoreError};
use crate::trigger;

/// Working-hours classification parameters for schedule-aware routing.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleConfig {
    pub timezone: Tz,
    pub business_hours_start_hour: u32,
    pub business_hours_end_hour: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::Chicago,
            business_hours_start_hour: 9,
            business_hours_end_hour: 17,
        }
    }
}

/// Outcome of evaluating a single service during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    Healthy,
    SkippedGracePeriod,
    NeverHeartbeat,
    AlertOpened,
    AlertContinued,
    AlertClosed,
}

/// Aggregate counters for one monitor tick, used for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub services_evaluated: usize,
    pub skipped_grace_period: usize,
    pub never_heartbeat: usize,
    pub alerts_opened: usize,
    pub alerts_continued: usize,
    pub alerts_closed: usize,
    pub errors: usize,
}

impl TickSummary {
    fn record(&mut self, outcome: ServiceOutcome) {
        self.services_evaluated += 1;
        match outcome {
            ServiceOutcome::Healthy => {}
            ServiceOutcome::SkippedGracePeriod => self.skipped_grace_period += 1,
            ServiceOutcome::NeverHeartbeat => self.never_heartbeat += 1,
            ServiceOutcome::AlertOpened => self.alerts_opened += 1,
            ServiceOutcome::AlertContinued => self.alerts_continued += 1,
            ServiceOutcome::AlertClosed => self.alerts_closed += 1,
        }
    }
}

/// Drives repeated monitor ticks over the store's active services.
pub struct Monitor {
    store: Arc<Store>,
    router: Arc<AlertRouter>,
    circuit_breaker_config: CircuitBreakerConfig,
    schedule: ScheduleConfig,
    concurrency: usize,
    service_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl Monitor {
    /// Build a monitor over `store`, routing alerts through `router`.
    pub fn new(store: Arc<Store>, router: Arc<AlertRouter>, circuit_breaker_config: CircuitBreakerConfig, concurrency: usize) -> Self {
        Self::with_schedule(store, router, circuit_breaker_config, ScheduleConfig::default(), concurrency)
    }

    /// Build a monitor with an explicit schedule-aware routing configuration.
    pub fn with_schedule(
        store: Arc<Store>,
        router: Arc<AlertRouter>,
        circuit_breaker_config: CircuitBreakerConfig,
        schedule: ScheduleConfig,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            router,
            circuit_breaker_config,
            schedule,
            concurrency: concurrency.max(1),
            service_locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, service_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.service_locks.lock().expect("monitor service-lock registry poisoned");
        locks.entry(service_id).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
    }

    /// Run one sweep over every active service at `now`.
    ///
    /// A single service's failure (store error) is logged and does not stop
    /// the sweep, per spec §4.1's failure semantics.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickSummary {
        let services = match self.store.list_active_services().await {
            Ok(services) => services,
            Err(e) => {
                warn!(error = %e, "failed to list active services for monitor tick");
                return TickSummary::default();
            }
        };

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.concurrency));
        let mut tasks = tokio::task::JoinSet::new();

        for service in services {
            let semaphore = semaphore.clone();
            let lock = self.lock_for(service.id);
            let store = self.store.clone();
            let router = self.router.clone();
            let circuit_breaker_config = self.circuit_breaker_config;
            let schedule = self.schedule;

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("monitor semaphore closed");
                let _guard = lock.lock().await;
                evaluate_service(&store, &router, circuit_breaker_config, schedule, &service, now).await
            });
        }

        let mut summary = TickSummary::default();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(outcome)) => summary.record(outcome),
                Ok(Err(e)) => {
                    warn!(error = %e, "service evaluation failed");
                    summary.errors += 1;
                }
                Err(join_error) => {
                    warn!(error = %join_error, "service evaluation task panicked");
                    summary.errors += 1;
                }
            }
        }
        summary
    }
}

/// Evaluate one service: never-heartbeat path, grace-period gate, then
/// open/continue/close.
async fn evaluate_service(
    store: &Store,
    router: &AlertRouter,
    circuit_breaker_config: CircuitBreakerConfig,
    schedule: ScheduleConfig,
    service: &Service,
    now: DateTime<Utc>,
) -> Result<ServiceOutcome, StoreError> {
    let last_heartbeat = store.last_heartbeat_time(service.id).await?;

    if service.grace_period_seconds > 0 {
        if let Some(last_seen) = last_heartbeat {
            let grace_total = chrono::Duration::minutes(service.alert_interval) + chrono::Duration::seconds(service.grace_period_seconds);
            if now - last_seen < grace_total {
                debug!(service = %service.service_name, "within grace period, skipping evaluation");
                return Ok(ServiceOutcome::SkippedGracePeriod);
            }
        }
    }

    // A service that has never sent a heartbeat has no "last seen" time to
    // measure a miss against; it gets a standing registration notice every
    // tick (muted services excepted) rather than an opened alert, per
    // spec §4.1's never-heartbeat path.
    if last_heartbeat.is_none() {
        notify_never_heartbeat(store, router, schedule, service, now).await;
        return Ok(ServiceOutcome::NeverHeartbeat);
    }

    let window_start = now - chrono::Duration::minutes(service.alert_interval);
    let heartbeat_count = store.heartbeat_count_since(service.id, window_start).await?;

    if heartbeat_count < service.threshold {
        open_or_continue_alert(store, router, circuit_breaker_config, schedule, service, last_heartbeat, now).await
    } else if service.down {
        close_alert(store, router, service, now).await
    } else {
        Ok(ServiceOutcome::Healthy)
    }
}

async fn open_or_continue_alert(
    store: &Store,
    router: &AlertRouter,
    circuit_breaker_config: CircuitBreakerConfig,
    schedule: ScheduleConfig,
    service: &Service,
    last_seen: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<ServiceOutcome, StoreError> {
    if !service.down {
        store
            .update_service(
                service.id,
                &ServicePatch {
                    down: Some(true),
                    ..Default::default()
                },
            )
            .await?;
    }

    let maintenance_status = maintenance::get_maintenance_status(store, service.id, Some(now)).await?;

    let outcome = match store.active_alert(service.id).await? {
        None => {
            let alert_id = store.insert_alert(service.id, now).await?;
            if !service.muted && !maintenance_status.in_maintenance {
                notify_down(store, router, schedule, service, alert_id, last_seen, now).await;
            } else if maintenance_status.in_maintenance {
                debug!(service = %service.service_name, window = ?maintenance_status.window_name, "alert opened during maintenance, notification suppressed");
            }
            evaluate_trigger(store, circuit_breaker_config, service, alert_id, 1, now).await;
            ServiceOutcome::AlertOpened
        }
        Some(alert) => {
            let alert_cycle = store.increment_alert_cycle(alert.id).await?;
            let renotify_every = (service.alert_interval.saturating_mul(60) / 15).max(1);
            if !service.muted && !maintenance_status.in_maintenance && alert_cycle % renotify_every == 0 {
                notify_down(store, router, schedule, service, alert.id, last_seen, now).await;
            }
            if service.muted {
                let auto_unmute_every = (1440_i64 / 15).max(1);
                if alert_cycle % auto_unmute_every == 0 {
                    store
                        .update_service(
                            service.id,
                            &ServicePatch {
                                muted: Some(false),
                                ..Default::default()
                            },
                        )
                        .await?;
                }
            }
            evaluate_trigger(store, circuit_breaker_config, service, alert.id, alert_cycle, now).await;
            ServiceOutcome::AlertContinued
        }
    };
    Ok(outcome)
}

async fn close_alert(store: &Store, router: &AlertRouter, service: &Service, now: DateTime<Utc>) -> Result<ServiceOutcome, StoreError> {
    store
        .update_service(
            service.id,
            &ServicePatch {
                down: Some(false),
                muted: Some(false),
                ..Default::default()
            },
        )
        .await?;

    if let Some(alert) = store.active_alert(service.id).await? {
        store.close_alert(alert.id, now).await?;

        if let Some(reference) = alert.external_reference_id.as_deref().filter(|s| !s.is_empty()) {
            if let Err(e) = router.resolve_pagerduty(reference).await {
                warn!(error = %e, service = %service.service_name, "failed to resolve pagerduty incident");
            }
        }

        let payload = NotificationPayload {
            title: format!("{} has recovered", service.service_name),
            body: format!("heartbeat `{}` has recovered as of {}", service.heartbeat_name, now.to_rfc3339()),
            severity: Severity::Info,
            context: serde_json::json!({
                "service_id": service.id,
                "service_name": service.service_name,
                "recovered_at": now,
            }),
        };
        // Recovery notifications are never suppressed by maintenance or mute:
        // both exist to quiet an ongoing incident, not its resolution.
        if let Err(e) = router.notify_all(store, service, &payload).await {
            warn!(error = %e, service = %service.service_name, "failed to send recovery notification");
        }
    }

    Ok(ServiceOutcome::AlertClosed)
}

async fn notify_down(
    store: &Store,
    router: &AlertRouter,
    schedule: ScheduleConfig,
    service: &Service,
    alert_id: i64,
    last_seen: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) {
    let last_seen_str = last_seen.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_owned());
    let payload = NotificationPayload {
        title: format!("Medic - heartbeat failure for {}", service.heartbeat_name),
        body: format!(
            "no heartbeat detected for `{}` (service `{}`) since {}",
            service.heartbeat_name, service.service_name, last_seen_str
        ),
        severity: match service.priority.as_str() {
            "p1" => Severity::Critical,
            "p2" | "p3" => Severity::Warning,
            _ => Severity::Warning,
        },
        context: serde_json::json!({
            "service_id": service.id,
            "service_name": service.service_name,
            "last_seen": last_seen,
            "runbook": service.runbook,
            "color": alert_router::priority_color(&service.priority),
        }),
    };
    let period = alert_router::classify_period(now, schedule.timezone, schedule.business_hours_start_hour, schedule.business_hours_end_hour);
    match router.route_alert_with_schedule(store, service, &payload, period).await {
        Ok(results) => {
            if let Some(reference) = AlertRouter::pagerduty_reference(&results) {
                if let Err(e) = store.set_alert_external_reference(alert_id, &reference).await {
                    warn!(error = %e, service = %service.service_name, "failed to persist pagerduty dedup key");
                }
            }
        }
        Err(e) => {
            warn!(error = %e, service = %service.service_name, "failed to send failure notification");
        }
    }
}

/// Send the standing registration notice for a service that has never sent
/// a heartbeat, per spec §4.1's never-heartbeat path. Unlike a down alert,
/// this opens no [`Alert`](crate::store::models::Alert) row and repeats
/// every tick - mute is the only suppression.
async fn notify_never_heartbeat(store: &Store, router: &AlertRouter, schedule: ScheduleConfig, service: &Service, now: DateTime<Utc>) {
    if service.muted {
        return;
    }
    let payload = NotificationPayload {
        title: format!("Medic - {} awaiting first heartbeat", service.heartbeat_name),
        body: format!(
            ":elmofire: `{}` has been registered in medic but has not yet sent a heartbeat. This message will repeat until muted. :elmofire:",
            service.service_name
        ),
        severity: Severity::Warning,
        context: serde_json::json!({
            "service_id": service.id,
            "service_name": service.service_name,
            "color": alert_router::priority_color(&service.priority),
        }),
    };
    let period = alert_router::classify_period(now, schedule.timezone, schedule.business_hours_start_hour, schedule.business_hours_end_hour);
    if let Err(e) = router.route_alert_with_schedule(store, service, &payload, period).await {
        warn!(error = %e, service = %service.service_name, "failed to send never-heartbeat notification");
    }
}

/// Evaluate playbook triggers for this alert cycle.
///
/// Ported from `playbook_alert_integration.py`'s `trigger_playbook_for_alert`:
/// called on every cycle (not only when the alert first opens), since
/// `consecutive_failures` is the growing `alert_cycle` count and triggers can
/// be configured at any threshold above 1.
async fn evaluate_trigger(store: &Store, circuit_breaker_config: CircuitBreakerConfig, service: &Service, alert_id: i64, alert_cycle: i64, now: DateTime<Utc>) {
    match trigger::evaluate(store, circuit_breaker_config, service.id, &service.service_name, alert_id, alert_cycle, now).await {
        Ok(trigger::TriggerOutcome::NoMatch) => {}
        Ok(trigger::TriggerOutcome::CircuitBreakerOpen { trigger_id, message }) => {
            debug!(service = %service.service_name, trigger_id, %message, "playbook trigger matched but circuit breaker is open");
        }
        Ok(trigger::TriggerOutcome::Started { trigger_id, execution_id }) => {
            debug!(service = %service.service_name, trigger_id, execution_id, "playbook execution started from trigger");
        }
        Err(e) => {
            warn!(error = %e, service = %service.service_name, "trigger evaluation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::Service;

    fn sample_service(id: i64, threshold: i64, alert_interval: i64, grace_period_seconds: i64) -> Service {
        let now = Utc::now();
        Service {
            id,
            heartbeat_name: format!("svc-{id}"),
            service_name: format!("svc-{id}"),
            active: true,
            muted: false,
            down: false,
            alert_interval,
            threshold,
            grace_period_seconds,
            team_id: None,
            priority: "p2".to_owned(),
            runbook: None,
            max_duration_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn router() -> AlertRouter {
        AlertRouter::new(Vec::new())
    }

    #[tokio::test]
    async fn missing_heartbeats_open_an_alert() {
        let store = Store::open_in_memory().await.expect("open store");
        let mut service = sample_service(0, 1, 5, 0);
        service.id = store.insert_service(&service).await.expect("insert service");

        let now = Utc::now();
        store.insert_heartbeat_event(service.id, "UP", now - chrono::Duration::minutes(30), None).await.expect("seed heartbeat");

        let outcome = evaluate_service(
            &store,
            &router(),
            CircuitBreakerConfig { window_secs: 3600, max_executions: 5 },
            ScheduleConfig::default(),
            &service,
            now,
        )
        .await
        .expect("evaluate");
        assert_eq!(outcome, ServiceOutcome::AlertOpened);

        let updated = store.get_service(service.id).await.expect("get").expect("exists");
        assert!(updated.down);

        let alert = store.active_alert(service.id).await.expect("active alert").expect("exists");
        assert_eq!(alert.alert_cycle, 1);
    }

    #[tokio::test]
    async fn recovered_service_closes_its_alert() {
        let store = Store::open_in_memory().await.expect("open store");
        let mut service = sample_service(0, 1, 5, 0);
        service.id = store.insert_service(&service).await.expect("insert service");
        let now = Utc::now();

        store
            .insert_heartbeat_event(service.id, "UP", now - chrono::Duration::minutes(30), None)
            .await
            .expect("seed heartbeat");

        evaluate_service(
            &store,
            &router(),
            CircuitBreakerConfig { window_secs: 3600, max_executions: 5 },
            ScheduleConfig::default(),
            &service,
            now,
        )
        .await
        .expect("open alert");

        store
            .insert_heartbeat_event(service.id, "UP", now, None)
            .await
            .expect("insert heartbeat");
        let mut down_service = store.get_service(service.id).await.expect("get").expect("exists");
        down_service.down = true;

        let outcome = evaluate_service(
            &store,
            &router(),
            CircuitBreakerConfig { window_secs: 3600, max_executions: 5 },
            ScheduleConfig::default(),
            &down_service,
            now,
        )
        .await
        .expect("evaluate");
        assert_eq!(outcome, ServiceOutcome::AlertClosed);

        let updated = store.get_service(service.id).await.expect("get").expect("exists");
        assert!(!updated.down);
        assert!(store.active_alert(service.id).await.expect("active alert").is_none());
    }

    #[tokio::test]
    async fn grace_period_suppresses_evaluation_after_recent_heartbeat() {
        let store = Store::open_in_memory().await.expect("open store");
        let mut service = sample_service(0, 1, 5, 120);
        service.id = store.insert_service(&service).await.expect("insert service");
        let now = Utc::now();

        store
            .insert_heartbeat_event(service.id, "UP", now - chrono::Duration::seconds(30), None)
            .await
            .expect("insert heartbeat");

        let outcome = evaluate_service(
            &store,
            &router(),
            CircuitBreakerConfig { window_secs: 3600, max_executions: 5 },
            ScheduleConfig::default(),
            &service,
            now,
        )
        .await
        .expect("evaluate");
        assert_eq!(outcome, ServiceOutcome::SkippedGracePeriod);
    }

    #[tokio::test]
    async fn service_with_no_heartbeat_ever_is_reported_never_heartbeat() {
        let store = Store::open_in_memory().await.expect("open store");
        let mut service = sample_service(0, 1, 5, 0);
        service.id = store.insert_service(&service).await.expect("insert service");

        let outcome = evaluate_service(
            &store,
            &router(),
            CircuitBreakerConfig { window_secs: 3600, max_executions: 5 },
            ScheduleConfig::default(),
            &service,
            Utc::now(),
        )
        .await
        .expect("evaluate");
        assert_eq!(outcome, ServiceOutcome::NeverHeartbeat);

        let updated = store.get_service(service.id).await.expect("get").expect("exists");
        assert!(!updated.down);
        assert!(store.active_alert(service.id).await.expect("active alert").is_none());
    }

    #[tokio::test]
    async fn healthy_service_needs_no_action() {
        let store = Store::open_in_memory().await.expect("open store");
        let mut service = sample_service(0, 1, 5, 0);
        service.id = store.insert_service(&service).await.expect("insert service");
        let now = Utc::now();

        store.insert_heartbeat_event(service.id, "UP", now, None).await.expect("insert heartbeat");

        let outcome = evaluate_service(
            &store,
            &router(),
            CircuitBreakerConfig { window_secs: 3600, max_executions: 5 },
            ScheduleConfig::default(),
            &service,
            now,
        )
        .await
        .expect("evaluate");
        assert_eq!(outcome, ServiceOutcome::Healthy);
    }

    #[tokio::test]
    async fn tick_sweeps_all_active_services() {
        let store = Arc::new(Store::open_in_memory().await.expect("open store"));
        let now = Utc::now();
        let mut a = sample_service(0, 1, 5, 0);
        a.id = store.insert_service(&a).await.expect("insert");
        let mut b = sample_service(0, 1, 5, 0);
        b.heartbeat_name = "svc-b".to_owned();
        b.service_name = "svc-b".to_owned();
        b.id = store.insert_service(&b).await.expect("insert");
        for service_id in [a.id, b.id] {
            store
                .insert_heartbeat_event(service_id, "UP", now - chrono::Duration::minutes(30), None)
                .await
                .expect("seed heartbeat");
        }

        let monitor = Monitor::new(store.clone(), Arc::new(router()), CircuitBreakerConfig { window_secs: 3600, max_executions: 5 }, 4);
        let summary = monitor.tick(now).await;
        assert_eq!(summary.services_evaluated, 2);
        assert_eq!(summary.alerts_opened, 2);
        assert_eq!(summary.errors, 0);
    }
}
