//! Row types returned by [`super::Store`], mirroring spec §3's data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// A registered, monitored service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    /// Row id.
    pub id: i64,
    /// Unique, case-insensitive heartbeat identifier clients post against.
    pub heartbeat_name: String,
    /// Human-readable display name.
    pub service_name: String,
    /// Whether the monitor loop evaluates this service.
    pub active: bool,
    /// Whether notifications are currently suppressed.
    pub muted: bool,
    /// Whether the service is currently considered down.
    pub down: bool,
    /// Minutes defining the heartbeat-count evaluation window.
    pub alert_interval: i64,
    /// Minimum heartbeats required in the window to be considered healthy.
    pub threshold: i64,
    /// Seconds of grace before a missed heartbeat is evaluated at all.
    pub grace_period_seconds: i64,
    /// Owning team, if any.
    pub team_id: Option<i64>,
    /// Priority classification used for notification color-coding.
    pub priority: String,
    /// Optional runbook URL surfaced in notifications.
    pub runbook: Option<String>,
    /// Optional max duration threshold for job-run tracking.
    pub max_duration_ms: Option<i64>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// A typed patch over [`Service`] fields; only `Some` fields are updated.
///
/// Replaces the teacher's dynamic-SQL-concat temptation with a
/// strongly-typed struct and a generated `UPDATE` touching only present
/// fields, per spec §9's "dynamic SQL string concat" design note.
#[derive(Debug, Clone, Default)]
pub struct ServicePatch {
    pub service_name: Option<String>,
    pub active: Option<bool>,
    pub muted: Option<bool>,
    pub down: Option<bool>,
    pub alert_interval: Option<i64>,
    pub threshold: Option<i64>,
    pub grace_period_seconds: Option<i64>,
    pub team_id: Option<Option<i64>>,
    pub priority: Option<String>,
    pub runbook: Option<Option<String>>,
    pub max_duration_ms: Option<Option<i64>>,
}

/// An append-only heartbeat signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Up,
    Down,
    Started,
    Completed,
    Failed,
}

impl HeartbeatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Started => "STARTED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "UP" => Some(Self::Up),
            "DOWN" => Some(Self::Down),
            "STARTED" => Some(Self::Started),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A single recorded heartbeat event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatEvent {
    pub id: i64,
    pub service_id: i64,
    pub status: String,
    pub time: DateTime<Utc>,
    pub run_id: Option<String>,
}

/// An open or closed alert for a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: i64,
    pub service_id: i64,
    pub active: bool,
    pub alert_cycle: i64,
    pub external_reference_id: Option<String>,
    pub created_date: DateTime<Utc>,
    pub closed_date: Option<DateTime<Utc>>,
}

/// A team, used for the Alert Router's legacy channel fallback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Team {
    pub id: i64,
    pub name: String,
    pub slack_channel_id: Option<String>,
}

/// A notification destination bound to a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationTarget {
    pub id: i64,
    pub service_id: i64,
    pub target_type: String,
    pub config: Json,
    pub priority: i64,
    pub enabled: bool,
    pub period: String,
}

/// A persisted playbook definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybookRow {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub yaml_content: String,
    pub version: i64,
    pub approval: String,
    pub approval_timeout_minutes: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Execution status of a [`PlaybookExecution`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    PendingApproval,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Waiting)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingApproval => "pending_approval",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending_approval" => Some(Self::PendingApproval),
            "running" => Some(Self::Running),
            "waiting" => Some(Self::Waiting),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A running or finished playbook execution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybookExecution {
    pub id: i64,
    pub playbook_id: i64,
    pub service_id: Option<i64>,
    pub status: ExecutionStatus,
    pub current_step: i64,
    pub context: Json,
    pub resume_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status of a single step's result row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepResultStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Persisted outcome of a single playbook step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub id: i64,
    pub execution_id: i64,
    pub step_name: String,
    pub step_index: i64,
    pub status: StepResultStatus,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A script available for the Script step executor to run by name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisteredScript {
    pub name: String,
    pub content: String,
    pub interpreter: String,
    pub default_timeout_seconds: i64,
}

/// A ciphertext row for an encrypted secret; plaintext is never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecretRow {
    pub name: String,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub tag: Vec<u8>,
    pub description: Option<String>,
    pub actor: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A webhook configured for delivery, optionally scoped to a service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookConfig {
    pub id: i64,
    pub url: String,
    pub headers: Json,
    pub enabled: bool,
    pub service_id: Option<i64>,
}

/// A single delivery attempt record for a webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookDelivery {
    pub id: i64,
    pub webhook_id: i64,
    pub payload: Json,
    pub status: String,
    pub attempts: i64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub response_code: Option<i64>,
    pub response_body: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A one-time or cron-recurring suppression window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MaintenanceWindowRow {
    pub id: i64,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub timezone: String,
    pub recurrence: Option<String>,
    pub service_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
}

/// A pattern-matched rule triggering a playbook on consecutive failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybookTrigger {
    pub id: i64,
    pub playbook_id: i64,
    pub service_pattern: String,
    pub consecutive_failures: i64,
}

/// The action type recorded on a [`SnapshotRow`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotActionType {
    Deactivate,
    Activate,
    Mute,
    Unmute,
    Edit,
    BulkEdit,
    PriorityChange,
    TeamChange,
    Delete,
}

impl SnapshotActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deactivate => "deactivate",
            Self::Activate => "activate",
            Self::Mute => "mute",
            Self::Unmute => "unmute",
            Self::Edit => "edit",
            Self::BulkEdit => "bulk_edit",
            Self::PriorityChange => "priority_change",
            Self::TeamChange => "team_change",
            Self::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "deactivate" => Some(Self::Deactivate),
            "activate" => Some(Self::Activate),
            "mute" => Some(Self::Mute),
            "unmute" => Some(Self::Unmute),
            "edit" => Some(Self::Edit),
            "bulk_edit" => Some(Self::BulkEdit),
            "priority_change" => Some(Self::PriorityChange),
            "team_change" => Some(Self::TeamChange),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// A full before-mutation capture of a service row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotRow {
    pub id: i64,
    pub service_id: i64,
    pub snapshot_data: Json,
    pub action_type: SnapshotActionType,
    pub actor: Option<String>,
    pub created_at: DateTime<Utc>,
    pub restored_at: Option<DateTime<Utc>>,
}

/// A single job execution's start/completion correlation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRun {
    pub id: i64,
    pub service_id: i64,
    pub run_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub status: String,
}
