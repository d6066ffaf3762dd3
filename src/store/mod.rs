//! Typed operations over Medic's persisted rows, backed by SQLite.
//!
//! Grounded in the teacher's `flatline::db::StateDb`: `sqlx` + SQLite in
//! WAL mode, schema applied via `include_str!` + `sqlx::raw_sql` on open,
//! upserts via `ON CONFLICT ... DO UPDATE SET`, and row-tuple-to-struct
//! mapper functions for queries with more than a couple of columns.

pub mod models;

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value as Json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;

use models::{
    Alert, ExecutionStatus, HeartbeatEvent, JobRun, MaintenanceWindowRow, NotificationTarget,
    PlaybookExecution, PlaybookRow, PlaybookTrigger, RegisteredScript, SecretRow, Service,
    ServicePatch, SnapshotActionType, SnapshotRow, StepResult, StepResultStatus, Team,
    WebhookConfig, WebhookDelivery,
};

/// Errors surfaced by [`Store`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite/sqlx failure.
    #[error("store backend error: {0}")]
    Backend(#[from] sqlx::Error),
    /// A row that should exist (by id or unique key) was not found.
    #[error("not found")]
    NotFound,
    /// A uniqueness or state invariant was violated (e.g. duplicate job run).
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Result alias for [`Store`] operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Medic's SQLite-backed persistence layer.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema migration.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// migration fails to apply.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open medic store at {}", path.display()))?;

        let migration_sql = include_str!("../../migrations/001_medic_schema.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply medic schema migration")?;

        Ok(Self { pool })
    }

    /// Open an in-memory store, primarily for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory medic store")?;

        let migration_sql = include_str!("../../migrations/001_medic_schema.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply medic schema migration")?;

        Ok(Self { pool })
    }

    // -- Services --

    /// Insert a new service, returning its assigned id.
    pub async fn insert_service(&self, s: &Service) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO services (heartbeat_name, service_name, active, muted, down,
                alert_interval, threshold, grace_period_seconds, team_id, priority, runbook,
                max_duration_ms, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
        )
        .bind(&s.heartbeat_name)
        .bind(&s.service_name)
        .bind(s.active)
        .bind(s.muted)
        .bind(s.down)
        .bind(s.alert_interval)
        .bind(s.threshold)
        .bind(s.grace_period_seconds)
        .bind(s.team_id)
        .bind(&s.priority)
        .bind(&s.runbook)
        .bind(s.max_duration_ms)
        .bind(s.created_at)
        .bind(s.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Look up a service by its unique (case-insensitive) heartbeat name.
    pub async fn get_service_by_heartbeat_name(&self, name: &str) -> StoreResult<Option<Service>> {
        let row = sqlx::query_as::<_, ServiceRow>(
            "SELECT id, heartbeat_name, service_name, active, muted, down, alert_interval,
                threshold, grace_period_seconds, team_id, priority, runbook, max_duration_ms,
                created_at, updated_at
             FROM services WHERE heartbeat_name = ?1 COLLATE NOCASE",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(service_row_into))
    }

    /// Look up a service by id.
    pub async fn get_service(&self, id: i64) -> StoreResult<Option<Service>> {
        let row = sqlx::query_as::<_, ServiceRow>(
            "SELECT id, heartbeat_name, service_name, active, muted, down, alert_interval,
                threshold, grace_period_seconds, team_id, priority, runbook, max_duration_ms,
                created_at, updated_at
             FROM services WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(service_row_into))
    }

    /// List all services with `active = true`, excluding the literal name
    /// `"fakeservice"` per spec §4.1.
    pub async fn list_active_services(&self) -> StoreResult<Vec<Service>> {
        let rows = sqlx::query_as::<_, ServiceRow>(
            "SELECT id, heartbeat_name, service_name, active, muted, down, alert_interval,
                threshold, grace_period_seconds, team_id, priority, runbook, max_duration_ms,
                created_at, updated_at
             FROM services WHERE active = 1 AND service_name != 'fakeservice'",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(service_row_into).collect())
    }

    /// Apply a typed patch to a service, touching only present fields.
    ///
    /// Grounded in spec §9's "dynamic SQL string concat" design note: a
    /// strongly-typed patch instead of building `UPDATE` strings at runtime.
    pub async fn update_service(&self, id: i64, patch: &ServicePatch) -> StoreResult<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE services SET
                service_name = COALESCE(?2, service_name),
                active = COALESCE(?3, active),
                muted = COALESCE(?4, muted),
                down = COALESCE(?5, down),
                alert_interval = COALESCE(?6, alert_interval),
                threshold = COALESCE(?7, threshold),
                grace_period_seconds = COALESCE(?8, grace_period_seconds),
                team_id = CASE WHEN ?9 THEN ?10 ELSE team_id END,
                priority = COALESCE(?11, priority),
                runbook = CASE WHEN ?12 THEN ?13 ELSE runbook END,
                max_duration_ms = CASE WHEN ?14 THEN ?15 ELSE max_duration_ms END,
                updated_at = ?16
             WHERE id = ?1",
        )
        .bind(id)
        .bind(&patch.service_name)
        .bind(patch.active)
        .bind(patch.muted)
        .bind(patch.down)
        .bind(patch.alert_interval)
        .bind(patch.threshold)
        .bind(patch.grace_period_seconds)
        .bind(patch.team_id.is_some())
        .bind(patch.team_id.flatten())
        .bind(&patch.priority)
        .bind(patch.runbook.is_some())
        .bind(patch.runbook.clone().flatten())
        .bind(patch.max_duration_ms.is_some())
        .bind(patch.max_duration_ms.flatten())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Overwrite a service row wholesale from snapshot data, preserving
    /// `id` and `heartbeat_name`. Used by [`crate::snapshots`] restore.
    pub async fn overwrite_service(&self, id: i64, s: &Service) -> StoreResult<()> {
        sqlx::query(
            "UPDATE services SET
                service_name = ?2, active = ?3, muted = ?4, down = ?5, alert_interval = ?6,
                threshold = ?7, grace_period_seconds = ?8, team_id = ?9, priority = ?10,
                runbook = ?11, max_duration_ms = ?12, updated_at = ?13
             WHERE id = ?1",
        )
        .bind(id)
        .bind(&s.service_name)
        .bind(s.active)
        .bind(s.muted)
        .bind(s.down)
        .bind(s.alert_interval)
        .bind(s.threshold)
        .bind(s.grace_period_seconds)
        .bind(s.team_id)
        .bind(&s.priority)
        .bind(&s.runbook)
        .bind(s.max_duration_ms)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- Heartbeat events --

    /// Record a heartbeat event. Append-only.
    pub async fn insert_heartbeat_event(
        &self,
        service_id: i64,
        status: &str,
        time: DateTime<Utc>,
        run_id: Option<&str>,
    ) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO heartbeat_events (service_id, status, time, run_id) VALUES (?1,?2,?3,?4)",
        )
        .bind(service_id)
        .bind(status)
        .bind(time)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Most recent heartbeat time for a service, if any have ever arrived.
    pub async fn last_heartbeat_time(&self, service_id: i64) -> StoreResult<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            "SELECT time FROM heartbeat_events WHERE service_id = ?1 ORDER BY time DESC LIMIT 1",
        )
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(t,)| t))
    }

    /// Count of heartbeat events for a service since `since`.
    pub async fn heartbeat_count_since(
        &self,
        service_id: i64,
        since: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM heartbeat_events WHERE service_id = ?1 AND time >= ?2",
        )
        .bind(service_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Count of heartbeat events matching an optional status filter, used by
    /// the Condition step's `heartbeat_received` poll.
    pub async fn heartbeat_count_since_with_status(
        &self,
        service_id: i64,
        since: DateTime<Utc>,
        status: Option<&str>,
    ) -> StoreResult<i64> {
        let row: (i64,) = match status {
            Some(status) => {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM heartbeat_events
                     WHERE service_id = ?1 AND time >= ?2 AND status = ?3",
                )
                .bind(service_id)
                .bind(since)
                .bind(status)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM heartbeat_events WHERE service_id = ?1 AND time >= ?2",
                )
                .bind(service_id)
                .bind(since)
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(row.0)
    }

    // -- Alerts --

    /// The currently active alert for a service, if any.
    pub async fn active_alert(&self, service_id: i64) -> StoreResult<Option<Alert>> {
        let row = sqlx::query_as::<_, AlertRow>(
            "SELECT id, service_id, active, alert_cycle, external_reference_id, created_date, closed_date
             FROM alerts WHERE service_id = ?1 AND active = 1 ORDER BY id DESC LIMIT 1",
        )
        .bind(service_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(alert_row_into))
    }

    /// Insert a new active alert, returning its id.
    pub async fn insert_alert(&self, service_id: i64, created_date: DateTime<Utc>) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO alerts (service_id, active, alert_cycle, created_date) VALUES (?1,1,1,?2)",
        )
        .bind(service_id)
        .bind(created_date)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Increment `alert_cycle` on an alert.
    pub async fn increment_alert_cycle(&self, alert_id: i64) -> StoreResult<i64> {
        sqlx::query("UPDATE alerts SET alert_cycle = alert_cycle + 1 WHERE id = ?1")
            .bind(alert_id)
            .execute(&self.pool)
            .await?;
        let row: (i64,) = sqlx::query_as("SELECT alert_cycle FROM alerts WHERE id = ?1")
            .bind(alert_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Persist a PagerDuty dedup key onto an alert.
    pub async fn set_alert_external_reference(&self, alert_id: i64, dedup_key: &str) -> StoreResult<()> {
        sqlx::query("UPDATE alerts SET external_reference_id = ?2 WHERE id = ?1")
            .bind(alert_id)
            .bind(dedup_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Close an alert: `active = 0`, `closed_date = now`.
    pub async fn close_alert(&self, alert_id: i64, closed_date: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE alerts SET active = 0, closed_date = ?2 WHERE id = ?1")
            .bind(alert_id)
            .bind(closed_date)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// List alerts, optionally filtered to `active = true`, 100 most recent.
    pub async fn list_alerts(&self, active_only: bool) -> StoreResult<Vec<Alert>> {
        let rows = if active_only {
            sqlx::query_as::<_, AlertRow>(
                "SELECT id, service_id, active, alert_cycle, external_reference_id, created_date, closed_date
                 FROM alerts WHERE active = 1 ORDER BY id DESC LIMIT 100",
            )
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as::<_, AlertRow>(
                "SELECT id, service_id, active, alert_cycle, external_reference_id, created_date, closed_date
                 FROM alerts ORDER BY id DESC LIMIT 100",
            )
            .fetch_all(&self.pool)
            .await?
        };
        Ok(rows.into_iter().map(alert_row_into).collect())
    }

    // -- Teams --

    /// Insert a team, returning its assigned id.
    pub async fn insert_team(&self, name: &str, slack_channel_id: Option<&str>) -> StoreResult<i64> {
        let result = sqlx::query("INSERT INTO teams (name, slack_channel_id) VALUES (?1, ?2)")
            .bind(name)
            .bind(slack_channel_id)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Look up a team by id.
    pub async fn get_team(&self, id: i64) -> StoreResult<Option<Team>> {
        let row: Option<(i64, String, Option<String>)> =
            sqlx::query_as("SELECT id, name, slack_channel_id FROM teams WHERE id = ?1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id, name, slack_channel_id)| Team {
            id,
            name,
            slack_channel_id,
        }))
    }

    // -- Notification targets --

    /// Enabled notification targets for a service, ordered by priority ascending.
    pub async fn notification_targets_for_service(
        &self,
        service_id: i64,
    ) -> StoreResult<Vec<NotificationTarget>> {
        let rows = sqlx::query_as::<_, NotificationTargetRow>(
            "SELECT id, service_id, type, config, priority, enabled, period
             FROM notification_targets WHERE service_id = ?1 AND enabled = 1 ORDER BY priority ASC",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(notification_target_row_into).collect()
    }

    /// Register a notification target for a service, returning its id.
    pub async fn insert_notification_target(
        &self,
        service_id: i64,
        target_type: &str,
        config: &Json,
        priority: i64,
        enabled: bool,
        period: &str,
    ) -> StoreResult<i64> {
        let config_str = serde_json::to_string(config).unwrap_or_else(|_| "{}".to_owned());
        let result = sqlx::query(
            "INSERT INTO notification_targets (service_id, type, config, priority, enabled, period)
             VALUES (?1,?2,?3,?4,?5,?6)",
        )
        .bind(service_id)
        .bind(target_type)
        .bind(config_str)
        .bind(priority)
        .bind(enabled)
        .bind(period)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    // -- Playbooks & triggers --

    /// Look up a playbook by id.
    pub async fn get_playbook(&self, id: i64) -> StoreResult<Option<PlaybookRow>> {
        let row = sqlx::query_as::<_, PlaybookDbRow>(
            "SELECT id, name, description, yaml_content, version, approval,
                approval_timeout_minutes, created_at
             FROM playbooks WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(playbook_row_into))
    }

    /// Insert a parsed playbook, returning its id.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_playbook(
        &self,
        name: &str,
        description: &str,
        yaml_content: &str,
        version: i64,
        approval: &str,
        approval_timeout_minutes: Option<i64>,
    ) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO playbooks (name, description, yaml_content, version, approval,
                approval_timeout_minutes, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
        )
        .bind(name)
        .bind(description)
        .bind(yaml_content)
        .bind(version)
        .bind(approval)
        .bind(approval_timeout_minutes)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// List every registered playbook, most recently created first.
    pub async fn list_playbooks(&self) -> StoreResult<Vec<PlaybookRow>> {
        let rows = sqlx::query_as::<_, PlaybookDbRow>(
            "SELECT id, name, description, yaml_content, version, approval,
                approval_timeout_minutes, created_at
             FROM playbooks ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(playbook_row_into).collect())
    }

    /// Triggers whose `service_pattern` could plausibly match, for the
    /// caller to regex/glob-match and rank by specificity.
    pub async fn all_playbook_triggers(&self) -> StoreResult<Vec<PlaybookTrigger>> {
        let rows: Vec<(i64, i64, String, i64)> = sqlx::query_as(
            "SELECT id, playbook_id, service_pattern, consecutive_failures FROM playbook_triggers",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(
                |(id, playbook_id, service_pattern, consecutive_failures)| PlaybookTrigger {
                    id,
                    playbook_id,
                    service_pattern,
                    consecutive_failures,
                },
            )
            .collect())
    }

    // -- Playbook executions --

    /// Create a new playbook execution.
    pub async fn insert_execution(
        &self,
        playbook_id: i64,
        service_id: Option<i64>,
        status: ExecutionStatus,
        context: &Json,
    ) -> StoreResult<i64> {
        let now = Utc::now();
        let context_str = serde_json::to_string(context).unwrap_or_else(|_| "{}".to_owned());
        let result = sqlx::query(
            "INSERT INTO playbook_executions
                (playbook_id, service_id, status, current_step, context, created_at, updated_at)
             VALUES (?1,?2,?3,0,?4,?5,?5)",
        )
        .bind(playbook_id)
        .bind(service_id)
        .bind(status.as_str())
        .bind(context_str)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Look up an execution by id.
    pub async fn get_execution(&self, id: i64) -> StoreResult<Option<PlaybookExecution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(
            "SELECT id, playbook_id, service_id, status, current_step, context, resume_at,
                created_at, updated_at
             FROM playbook_executions WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(execution_row_into).transpose()
    }

    /// Executions currently in an active (resumable) state.
    pub async fn active_executions(&self) -> StoreResult<Vec<PlaybookExecution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(
            "SELECT id, playbook_id, service_id, status, current_step, context, resume_at,
                created_at, updated_at
             FROM playbook_executions WHERE status IN ('running', 'waiting')",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(execution_row_into).collect()
    }

    /// Count of executions started for a service since `since`. The basis
    /// for the circuit breaker's stateless admission check (spec §4.4):
    /// always a fresh `COUNT`, never an in-memory counter.
    pub async fn execution_count_since(
        &self,
        service_id: i64,
        since: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM playbook_executions WHERE service_id = ?1 AND created_at >= ?2",
        )
        .bind(service_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Update execution status, current_step, context, and resume_at.
    pub async fn update_execution(
        &self,
        id: i64,
        status: ExecutionStatus,
        current_step: i64,
        context: &Json,
        resume_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let context_str = serde_json::to_string(context).unwrap_or_else(|_| "{}".to_owned());
        sqlx::query(
            "UPDATE playbook_executions SET status = ?2, current_step = ?3, context = ?4,
                resume_at = ?5, updated_at = ?6
             WHERE id = ?1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(current_step)
        .bind(context_str)
        .bind(resume_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- Step results --

    /// Insert a step result row, returning its id.
    pub async fn insert_step_result(
        &self,
        execution_id: i64,
        step_name: &str,
        step_index: i64,
        status: StepResultStatus,
    ) -> StoreResult<i64> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO step_results (execution_id, step_name, step_index, status, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?5)",
        )
        .bind(execution_id)
        .bind(step_name)
        .bind(step_index)
        .bind(status.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Update a step result's terminal status, output (truncated by the
    /// caller to 4096 bytes per spec §3), and error message.
    pub async fn update_step_result(
        &self,
        id: i64,
        status: StepResultStatus,
        output: Option<&str>,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE step_results SET status = ?2, output = ?3, error_message = ?4, updated_at = ?5
             WHERE id = ?1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(output)
        .bind(error_message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// List step results for an execution, ordered by step index.
    pub async fn step_results_for_execution(&self, execution_id: i64) -> StoreResult<Vec<StepResult>> {
        let rows = sqlx::query_as::<_, StepResultRow>(
            "SELECT id, execution_id, step_name, step_index, status, output, error_message,
                created_at, updated_at
             FROM step_results WHERE execution_id = ?1 ORDER BY step_index ASC",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(step_result_row_into).collect()
    }

    // -- Registered scripts --

    /// Look up a registered script by name. Only pre-registered scripts
    /// may be executed (spec §4.3 Script step).
    pub async fn get_registered_script(&self, name: &str) -> StoreResult<Option<RegisteredScript>> {
        let row: Option<(String, String, String, i64)> = sqlx::query_as(
            "SELECT name, content, interpreter, default_timeout_seconds
             FROM registered_scripts WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(
            |(name, content, interpreter, default_timeout_seconds)| RegisteredScript {
                name,
                content,
                interpreter,
                default_timeout_seconds,
            },
        ))
    }

    // -- Secrets --

    /// Upsert a secret's ciphertext/nonce/tag by name.
    pub async fn upsert_secret(&self, row: &SecretRow) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO secrets (name, ciphertext, nonce, tag, description, actor, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?7)
             ON CONFLICT(name) DO UPDATE SET
                ciphertext = ?2, nonce = ?3, tag = ?4, description = ?5, actor = ?6, updated_at = ?7",
        )
        .bind(&row.name)
        .bind(&row.ciphertext)
        .bind(&row.nonce)
        .bind(&row.tag)
        .bind(&row.description)
        .bind(&row.actor)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Look up a secret by name.
    pub async fn get_secret(&self, name: &str) -> StoreResult<Option<SecretRow>> {
        let row = sqlx::query_as::<_, SecretDbRow>(
            "SELECT name, ciphertext, nonce, tag, description, actor, created_at, updated_at
             FROM secrets WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(secret_row_into))
    }

    // -- Webhooks & deliveries --

    /// Register a webhook target, returning its id. `service_id = None`
    /// registers a global webhook applicable to every service.
    pub async fn insert_webhook(&self, service_id: Option<i64>, url: &str, headers: &Json) -> StoreResult<i64> {
        let headers_str = serde_json::to_string(headers).unwrap_or_else(|_| "{}".to_owned());
        let result = sqlx::query("INSERT INTO webhooks (url, headers, enabled, service_id) VALUES (?1, ?2, 1, ?3)")
            .bind(url)
            .bind(headers_str)
            .bind(service_id)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    /// Enable or disable a webhook.
    pub async fn set_webhook_enabled(&self, webhook_id: i64, enabled: bool) -> StoreResult<()> {
        sqlx::query("UPDATE webhooks SET enabled = ?1 WHERE id = ?2")
            .bind(enabled)
            .bind(webhook_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Webhooks applicable to a service: global (`service_id IS NULL`) or
    /// scoped to this service. Includes disabled webhooks - callers
    /// (`WebhookDeliverer::deliver_to_all`) short-circuit those to a failed
    /// outcome rather than skip them, per spec §4.6.
    pub async fn webhooks_for_service(&self, service_id: Option<i64>) -> StoreResult<Vec<WebhookConfig>> {
        let rows = sqlx::query_as::<_, WebhookRow>(
            "SELECT id, url, headers, enabled, service_id FROM webhooks
             WHERE service_id IS NULL OR service_id = ?1",
        )
        .bind(service_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(webhook_row_into).collect()
    }

    /// Insert a new delivery row with `status = pending`, returning its id.
    pub async fn insert_delivery(&self, webhook_id: i64, payload: &Json) -> StoreResult<i64> {
        let payload_str = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_owned());
        let result = sqlx::query(
            "INSERT INTO webhook_deliveries (webhook_id, payload, status, attempts, created_at)
             VALUES (?1,?2,'pending',0,?3)",
        )
        .bind(webhook_id)
        .bind(payload_str)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Update a delivery row after an attempt.
    #[allow(clippy::too_many_arguments)]
    pub async fn update_delivery(
        &self,
        id: i64,
        status: &str,
        attempts: i64,
        response_code: Option<i64>,
        response_body: Option<&str>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE webhook_deliveries SET status = ?2, attempts = ?3, last_attempt_at = ?4,
                response_code = ?5, response_body = ?6
             WHERE id = ?1",
        )
        .bind(id)
        .bind(status)
        .bind(attempts)
        .bind(Utc::now())
        .bind(response_code)
        .bind(response_body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Look up a delivery record by id.
    pub async fn get_delivery(&self, id: i64) -> StoreResult<Option<WebhookDelivery>> {
        let row = sqlx::query_as::<_, DeliveryRow>(
            "SELECT id, webhook_id, payload, status, attempts, last_attempt_at, response_code,
                response_body, created_at
             FROM webhook_deliveries WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(delivery_row_into).transpose()
    }

    // -- Maintenance windows --

    /// All maintenance windows applicable to a service (`service_ids = '[]'`
    /// or containing `service_id`); the caller still evaluates time/cron.
    pub async fn maintenance_windows_for_service(
        &self,
        service_id: i64,
    ) -> StoreResult<Vec<MaintenanceWindowRow>> {
        let rows = sqlx::query_as::<_, MaintenanceWindowDbRow>(
            "SELECT id, name, start_time, end_time, timezone, recurrence, service_ids, created_at
             FROM maintenance_windows",
        )
        .fetch_all(&self.pool)
        .await?;
        let all: Vec<MaintenanceWindowRow> = rows
            .into_iter()
            .map(maintenance_window_row_into)
            .collect::<Result<_, _>>()?;
        Ok(all
            .into_iter()
            .filter(|w| w.service_ids.is_empty() || w.service_ids.contains(&service_id))
            .collect())
    }

    /// All maintenance windows, unfiltered.
    pub async fn all_maintenance_windows(&self) -> StoreResult<Vec<MaintenanceWindowRow>> {
        let rows = sqlx::query_as::<_, MaintenanceWindowDbRow>(
            "SELECT id, name, start_time, end_time, timezone, recurrence, service_ids, created_at
             FROM maintenance_windows",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(maintenance_window_row_into).collect()
    }

    // -- Job runs --

    /// Look up a job run by `(service_id, run_id)`.
    pub async fn get_job_run(&self, service_id: i64, run_id: &str) -> StoreResult<Option<JobRun>> {
        let row = sqlx::query_as::<_, JobRunRow>(
            "SELECT id, service_id, run_id, started_at, completed_at, duration_ms, status
             FROM job_runs WHERE service_id = ?1 AND run_id = ?2",
        )
        .bind(service_id)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(job_run_row_into))
    }

    /// Insert a new `STARTED` job run, returning its id.
    pub async fn insert_job_start(
        &self,
        service_id: i64,
        run_id: &str,
        started_at: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO job_runs (service_id, run_id, started_at, status) VALUES (?1,?2,?3,'STARTED')",
        )
        .bind(service_id)
        .bind(run_id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Insert a completion-only job run (no prior `STARTED` row), with
    /// `duration_ms = 0` per spec §9's open-question resolution.
    pub async fn insert_completion_only_run(
        &self,
        service_id: i64,
        run_id: &str,
        completed_at: DateTime<Utc>,
        status: &str,
    ) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO job_runs (service_id, run_id, started_at, completed_at, duration_ms, status)
             VALUES (?1,?2,?3,?3,0,?4)",
        )
        .bind(service_id)
        .bind(run_id)
        .bind(completed_at)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Complete an existing `STARTED` run in place.
    pub async fn complete_job_run(
        &self,
        id: i64,
        completed_at: DateTime<Utc>,
        duration_ms: i64,
        status: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE job_runs SET completed_at = ?2, duration_ms = ?3, status = ?4 WHERE id = ?1",
        )
        .bind(id)
        .bind(completed_at)
        .bind(duration_ms)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark a stale run as alerted to prevent duplicate stale-run alerts.
    pub async fn mark_stale_run_alerted(&self, id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE job_runs SET status = 'STALE_ALERTED' WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Completed runs (non-null duration) for a service, most recent first,
    /// capped at `limit`.
    pub async fn completed_runs_for_service(&self, service_id: i64, limit: i64) -> StoreResult<Vec<JobRun>> {
        let rows = sqlx::query_as::<_, JobRunRow>(
            "SELECT id, service_id, run_id, started_at, completed_at, duration_ms, status
             FROM job_runs
             WHERE service_id = ?1 AND duration_ms IS NOT NULL AND status IN ('COMPLETED', 'FAILED')
             ORDER BY completed_at DESC LIMIT ?2",
        )
        .bind(service_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(job_run_row_into).collect())
    }

    /// `STARTED` runs older than `older_than_seconds` with no completion.
    pub async fn stale_runs(
        &self,
        older_than: DateTime<Utc>,
        service_id: Option<i64>,
    ) -> StoreResult<Vec<JobRun>> {
        let rows = match service_id {
            Some(sid) => {
                sqlx::query_as::<_, JobRunRow>(
                    "SELECT id, service_id, run_id, started_at, completed_at, duration_ms, status
                     FROM job_runs
                     WHERE service_id = ?1 AND status = 'STARTED' AND started_at < ?2",
                )
                .bind(sid)
                .bind(older_than)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRunRow>(
                    "SELECT id, service_id, run_id, started_at, completed_at, duration_ms, status
                     FROM job_runs WHERE status = 'STARTED' AND started_at < ?1",
                )
                .bind(older_than)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().map(job_run_row_into).collect())
    }

    // -- Snapshots --

    /// Capture a before-mutation snapshot, returning its id.
    pub async fn insert_snapshot(
        &self,
        service_id: i64,
        snapshot_data: &Json,
        action_type: SnapshotActionType,
        actor: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let data_str = serde_json::to_string(snapshot_data).unwrap_or_else(|_| "{}".to_owned());
        let result = sqlx::query(
            "INSERT INTO snapshots (service_id, snapshot_data, action_type, actor, created_at)
             VALUES (?1,?2,?3,?4,?5)",
        )
        .bind(service_id)
        .bind(data_str)
        .bind(action_type.as_str())
        .bind(actor)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Look up a snapshot by id.
    pub async fn get_snapshot(&self, id: i64) -> StoreResult<Option<SnapshotRow>> {
        let row = sqlx::query_as::<_, SnapshotDbRow>(
            "SELECT id, service_id, snapshot_data, action_type, actor, created_at, restored_at
             FROM snapshots WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(snapshot_row_into).transpose()
    }

    /// Mark a snapshot restored.
    pub async fn mark_snapshot_restored(&self, id: i64, restored_at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE snapshots SET restored_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(restored_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Paginated, filtered snapshot query. `limit` must already be clamped
    /// to `[1, 250]` by the caller per spec §4.11.
    pub async fn query_snapshots(
        &self,
        service_id: Option<i64>,
        action_type: Option<SnapshotActionType>,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<(Vec<SnapshotRow>, i64)> {
        // Built with fixed clauses rather than string concatenation: every
        // filter binds a placeholder, `NULL` filters pass through unchanged.
        let rows = sqlx::query_as::<_, SnapshotDbRow>(
            "SELECT id, service_id, snapshot_data, action_type, actor, created_at, restored_at
             FROM snapshots
             WHERE (?1 IS NULL OR service_id = ?1)
               AND (?2 IS NULL OR action_type = ?2)
               AND (?3 IS NULL OR created_at >= ?3)
               AND (?4 IS NULL OR created_at < ?4)
             ORDER BY created_at DESC
             LIMIT ?5 OFFSET ?6",
        )
        .bind(service_id)
        .bind(action_type.map(SnapshotActionType::as_str))
        .bind(start_date)
        .bind(end_date)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM snapshots
             WHERE (?1 IS NULL OR service_id = ?1)
               AND (?2 IS NULL OR action_type = ?2)
               AND (?3 IS NULL OR created_at >= ?3)
               AND (?4 IS NULL OR created_at < ?4)",
        )
        .bind(service_id)
        .bind(action_type.map(SnapshotActionType::as_str))
        .bind(start_date)
        .bind(end_date)
        .fetch_one(&self.pool)
        .await?;

        let entries: Vec<SnapshotRow> = rows.into_iter().map(snapshot_row_into).collect::<Result<_, _>>()?;
        Ok((entries, total.0))
    }
}

// -- Raw row types and converters --

#[derive(sqlx::FromRow)]
struct ServiceRow {
    id: i64,
    heartbeat_name: String,
    service_name: String,
    active: bool,
    muted: bool,
    down: bool,
    alert_interval: i64,
    threshold: i64,
    grace_period_seconds: i64,
    team_id: Option<i64>,
    priority: String,
    runbook: Option<String>,
    max_duration_ms: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn service_row_into(r: ServiceRow) -> Service {
    Service {
        id: r.id,
        heartbeat_name: r.heartbeat_name,
        service_name: r.service_name,
        active: r.active,
        muted: r.muted,
        down: r.down,
        alert_interval: r.alert_interval,
        threshold: r.threshold,
        grace_period_seconds: r.grace_period_seconds,
        team_id: r.team_id,
        priority: r.priority,
        runbook: r.runbook,
        max_duration_ms: r.max_duration_ms,
        created_at: r.created_at,
        updated_at: r.updated_at,
    }
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    id: i64,
    service_id: i64,
    active: bool,
    alert_cycle: i64,
    external_reference_id: Option<String>,
    created_date: DateTime<Utc>,
    closed_date: Option<DateTime<Utc>>,
}

fn alert_row_into(r: AlertRow) -> Alert {
    Alert {
        id: r.id,
        service_id: r.service_id,
        active: r.active,
        alert_cycle: r.alert_cycle,
        external_reference_id: r.external_reference_id,
        created_date: r.created_date,
        closed_date: r.closed_date,
    }
}

#[derive(sqlx::FromRow)]
struct NotificationTargetRow {
    id: i64,
    service_id: i64,
    #[sqlx(rename = "type")]
    target_type: String,
    config: String,
    priority: i64,
    enabled: bool,
    period: String,
}

fn notification_target_row_into(r: NotificationTargetRow) -> StoreResult<NotificationTarget> {
    Ok(NotificationTarget {
        id: r.id,
        service_id: r.service_id,
        target_type: r.target_type,
        config: serde_json::from_str(&r.config).unwrap_or(Json::Null),
        priority: r.priority,
        enabled: r.enabled,
        period: r.period,
    })
}

#[derive(sqlx::FromRow)]
struct PlaybookDbRow {
    id: i64,
    name: String,
    description: String,
    yaml_content: String,
    version: i64,
    approval: String,
    approval_timeout_minutes: Option<i64>,
    created_at: DateTime<Utc>,
}

fn playbook_row_into(r: PlaybookDbRow) -> PlaybookRow {
    PlaybookRow {
        id: r.id,
        name: r.name,
        description: r.description,
        yaml_content: r.yaml_content,
        version: r.version,
        approval: r.approval,
        approval_timeout_minutes: r.approval_timeout_minutes,
        created_at: r.created_at,
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: i64,
    playbook_id: i64,
    service_id: Option<i64>,
    status: String,
    current_step: i64,
    context: String,
    resume_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn execution_row_into(r: ExecutionRow) -> StoreResult<PlaybookExecution> {
    let status = ExecutionStatus::parse(&r.status)
        .ok_or_else(|| StoreError::Conflict(format!("unknown execution status '{}'", r.status)))?;
    Ok(PlaybookExecution {
        id: r.id,
        playbook_id: r.playbook_id,
        service_id: r.service_id,
        status,
        current_step: r.current_step,
        context: serde_json::from_str(&r.context).unwrap_or(Json::Null),
        resume_at: r.resume_at,
        created_at: r.created_at,
        updated_at: r.updated_at,
    })
}

#[derive(sqlx::FromRow)]
struct StepResultRow {
    id: i64,
    execution_id: i64,
    step_name: String,
    step_index: i64,
    status: String,
    output: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn step_result_row_into(r: StepResultRow) -> StoreResult<StepResult> {
    let status = StepResultStatus::parse(&r.status)
        .ok_or_else(|| StoreError::Conflict(format!("unknown step status '{}'", r.status)))?;
    Ok(StepResult {
        id: r.id,
        execution_id: r.execution_id,
        step_name: r.step_name,
        step_index: r.step_index,
        status,
        output: r.output,
        error_message: r.error_message,
        created_at: r.created_at,
        updated_at: r.updated_at,
    })
}

#[derive(sqlx::FromRow)]
struct SecretDbRow {
    name: String,
    ciphertext: Vec<u8>,
    nonce: Vec<u8>,
    tag: Vec<u8>,
    description: Option<String>,
    actor: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn secret_row_into(r: SecretDbRow) -> SecretRow {
    SecretRow {
        name: r.name,
        ciphertext: r.ciphertext,
        nonce: r.nonce,
        tag: r.tag,
        description: r.description,
        actor: r.actor,
        created_at: r.created_at,
        updated_at: r.updated_at,
    }
}

#[derive(sqlx::FromRow)]
struct WebhookRow {
    id: i64,
    url: String,
    headers: String,
    enabled: bool,
    service_id: Option<i64>,
}

fn webhook_row_into(r: WebhookRow) -> StoreResult<WebhookConfig> {
    Ok(WebhookConfig {
        id: r.id,
        url: r.url,
        headers: serde_json::from_str(&r.headers).unwrap_or(Json::Null),
        enabled: r.enabled,
        service_id: r.service_id,
    })
}

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    id: i64,
    webhook_id: i64,
    payload: String,
    status: String,
    attempts: i64,
    last_attempt_at: Option<DateTime<Utc>>,
    response_code: Option<i64>,
    response_body: Option<String>,
    created_at: DateTime<Utc>,
}

fn delivery_row_into(r: DeliveryRow) -> StoreResult<WebhookDelivery> {
    Ok(WebhookDelivery {
        id: r.id,
        webhook_id: r.webhook_id,
        payload: serde_json::from_str(&r.payload).unwrap_or(Json::Null),
        status: r.status,
        attempts: r.attempts,
        last_attempt_at: r.last_attempt_at,
        response_code: r.response_code,
        response_body: r.response_body,
        created_at: r.created_at,
    })
}

#[derive(sqlx::FromRow)]
struct MaintenanceWindowDbRow {
    id: i64,
    name: String,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    timezone: String,
    recurrence: Option<String>,
    service_ids: String,
    created_at: DateTime<Utc>,
}

fn maintenance_window_row_into(r: MaintenanceWindowDbRow) -> StoreResult<MaintenanceWindowRow> {
    let service_ids: Vec<i64> = serde_json::from_str(&r.service_ids).unwrap_or_default();
    Ok(MaintenanceWindowRow {
        id: r.id,
        name: r.name,
        start_time: r.start_time,
        end_time: r.end_time,
        timezone: r.timezone,
        recurrence: r.recurrence,
        service_ids,
        created_at: r.created_at,
    })
}

#[derive(sqlx::FromRow)]
struct JobRunRow {
    id: i64,
    service_id: i64,
    run_id: String,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    status: String,
}

fn job_run_row_into(r: JobRunRow) -> JobRun {
    JobRun {
        id: r.id,
        service_id: r.service_id,
        run_id: r.run_id,
        started_at: r.started_at,
        completed_at: r.completed_at,
        duration_ms: r.duration_ms,
        status: r.status,
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotDbRow {
    id: i64,
    service_id: i64,
    snapshot_data: String,
    action_type: String,
    actor: Option<String>,
    created_at: DateTime<Utc>,
    restored_at: Option<DateTime<Utc>>,
}

fn snapshot_row_into(r: SnapshotDbRow) -> StoreResult<SnapshotRow> {
    let action_type = SnapshotActionType::parse(&r.action_type)
        .ok_or_else(|| StoreError::Conflict(format!("unknown snapshot action '{}'", r.action_type)))?;
    Ok(SnapshotRow {
        id: r.id,
        service_id: r.service_id,
        snapshot_data: serde_json::from_str(&r.snapshot_data).unwrap_or(Json::Null),
        action_type,
        actor: r.actor,
        created_at: r.created_at,
        restored_at: r.restored_at,
    })
}
