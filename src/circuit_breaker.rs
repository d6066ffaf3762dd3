//! Stateless admission control for playbook executions.
//!
//! Ported from `circuit_breaker.py`: rather than an in-memory counter (which
//! would reset on restart and drift across workers), admission is decided
//! by a fresh `COUNT(*)` of executions started for the service within the
//! trailing window. Slower than a counter, correct across restarts and
//! concurrent workers - the store is the source of truth.

use chrono::{DateTime, Utc};

use crate::store::{Store, StoreError};

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub window_secs: i64,
    pub max_executions: i64,
}

/// Whether a new playbook execution may be admitted for a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerStatus {
    pub allowed: bool,
    pub executions_in_window: i64,
    pub max_executions: i64,
    pub message: String,
}

/// Evaluate whether a new execution is admitted for `service_id` at `now`.
pub async fn check(
    store: &Store,
    config: CircuitBreakerConfig,
    service_id: i64,
    now: DateTime<Utc>,
) -> Result<CircuitBreakerStatus, StoreError> {
    let since = now - chrono::Duration::seconds(config.window_secs);
    let count = store.execution_count_since(service_id, since).await?;
    let allowed = count < config.max_executions;
    let message = if allowed {
        format!(
            "{count}/{} executions in the last {}s",
            config.max_executions, config.window_secs
        )
    } else {
        format!(
            "circuit open: {count} executions in the last {}s exceeds limit of {}",
            config.window_secs, config.max_executions
        )
    };
    Ok(CircuitBreakerStatus {
        allowed,
        executions_in_window: count,
        max_executions: config.max_executions,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{ExecutionStatus, Service};

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
                max_duration_ms: None,
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("insert service")
    }

    #[tokio::test]
    async fn admits_until_max_executions_reached() {
        let store = Store::open_in_memory().await.expect("open store");
        let service_id = seed_service(&store).await;
        let playbook_id = store
            .insert_playbook("p", "", "steps: []", 1, "none", None)
            .await
            .expect("insert playbook");

        let config = CircuitBreakerConfig {
            window_secs: 3600,
            max_executions: 2,
        };
        let now = Utc::now();

        let status = check(&store, config, service_id, now).await.expect("check");
        assert!(status.allowed);

        for _ in 0..2 {
            store
                .insert_execution(
                    playbook_id,
                    Some(service_id),
                    ExecutionStatus::Running,
                    &serde_json::json!({}),
                )
                .await
                .expect("insert execution");
        }

        let status = check(&store, config, service_id, now).await.expect("check");
        assert!(!status.allowed);
        assert_eq!(status.executions_in_window, 2);
    }
}
