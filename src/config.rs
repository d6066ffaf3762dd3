//! Configuration loading for the Medic daemon.
//!
//! Loads `medic.toml` with per-section defaults. Every section uses
//! `#[serde(default)]` so a minimal or empty config file is valid.
//! Environment-variable overrides are applied through an injectable
//! resolver so tests can exercise override precedence without mutating
//! real process environment.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Top-level Medic configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MedicConfig {
    /// Monitor loop timing.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Rate limiter defaults.
    #[serde(default)]
    pub rate_limit: RateLimitSection,

    /// Circuit breaker defaults.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,

    /// Maintenance window defaults.
    #[serde(default)]
    pub maintenance: MaintenanceSection,

    /// Script step resource limits.
    #[serde(default)]
    pub script: ScriptSection,

    /// Webhook delivery settings.
    #[serde(default)]
    pub webhook: WebhookSection,

    /// Condition step polling.
    #[serde(default)]
    pub condition: ConditionSection,

    /// Snapshot query pagination bounds.
    #[serde(default)]
    pub snapshots: SnapshotsSection,
}

impl Default for MedicConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            rate_limit: RateLimitSection::default(),
            circuit_breaker: CircuitBreakerSection::default(),
            maintenance: MaintenanceSection::default(),
            script: ScriptSection::default(),
            webhook: WebhookSection::default(),
            condition: ConditionSection::default(),
            snapshots: SnapshotsSection::default(),
        }
    }
}

/// Monitor loop timing.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between monitor loop ticks.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    /// Bounded worker pool concurrency for per-service evaluation within a tick.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// IANA timezone the working-hours classification (§4.2 schedule-aware
    /// routing) is evaluated in.
    #[serde(default = "default_timezone")]
    pub schedule_timezone: String,

    /// Local hour (inclusive) business hours begin.
    #[serde(default = "default_business_hours_start")]
    pub business_hours_start_hour: u32,

    /// Local hour (exclusive) business hours end.
    #[serde(default = "default_business_hours_end")]
    pub business_hours_end_hour: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            worker_concurrency: default_worker_concurrency(),
            schedule_timezone: default_timezone(),
            business_hours_start_hour: default_business_hours_start(),
            business_hours_end_hour: default_business_hours_end(),
        }
    }
}

/// Rate limiter defaults, mirrored from §4.5.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitSection {
    /// Default heartbeat-class limit per window.
    #[serde(default = "default_heartbeat_limit")]
    pub heartbeat_limit: u32,
    /// Default management-class limit per window.
    #[serde(default = "default_management_limit")]
    pub management_limit: u32,
    /// Sliding window size in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            heartbeat_limit: default_heartbeat_limit(),
            management_limit: default_management_limit(),
            window_secs: default_window_secs(),
        }
    }
}

/// Circuit breaker defaults, mirrored from §4.4.
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerSection {
    /// Rolling window, in seconds, over which executions are counted.
    #[serde(default = "default_cb_window_secs")]
    pub window_secs: i64,
    /// Maximum executions allowed within the window before tripping open.
    #[serde(default = "default_cb_max_executions")]
    pub max_executions: i64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            window_secs: default_cb_window_secs(),
            max_executions: default_cb_max_executions(),
        }
    }
}

/// Maintenance window defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceSection {
    /// IANA timezone used when a maintenance window does not specify one.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        Self {
            default_timezone: default_timezone(),
        }
    }
}

/// Script step resource limits, mirrored from §4.3.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptSection {
    /// Virtual-memory cap in kilobytes (`ulimit -v`).
    #[serde(default = "default_script_memory_kb")]
    pub memory_limit_kb: u64,
    /// Extra seconds added to the step timeout for the CPU-time cap (`ulimit -t`).
    #[serde(default = "default_cpu_grace_secs")]
    pub cpu_grace_secs: u64,
    /// Fallback wall-clock timeout in seconds when neither step nor script specify one.
    #[serde(default = "default_script_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Maximum combined stdout+stderr capture, in bytes, before truncation.
    #[serde(default = "default_output_cap_bytes")]
    pub output_cap_bytes: usize,
}

impl Default for ScriptSection {
    fn default() -> Self {
        Self {
            memory_limit_kb: default_script_memory_kb(),
            cpu_grace_secs: default_cpu_grace_secs(),
            default_timeout_secs: default_script_timeout_secs(),
            output_cap_bytes: default_output_cap_bytes(),
        }
    }
}

/// Webhook delivery settings, mirrored from §4.6.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookSection {
    /// Maximum delivery attempts.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-attempt request timeout in seconds.
    #[serde(default = "default_webhook_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Response body capture cap in bytes before truncation.
    #[serde(default = "default_response_cap_bytes")]
    pub response_cap_bytes: usize,
}

impl Default for WebhookSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            request_timeout_secs: default_webhook_timeout_secs(),
            response_cap_bytes: default_response_cap_bytes(),
        }
    }
}

/// Condition step polling, mirrored from §4.3.
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionSection {
    /// Seconds between condition polls.
    #[serde(default = "default_condition_poll_secs")]
    pub poll_secs: u64,
    /// Default condition timeout in seconds.
    #[serde(default = "default_condition_timeout_secs")]
    pub default_timeout_secs: u64,
}

impl Default for ConditionSection {
    fn default() -> Self {
        Self {
            poll_secs: default_condition_poll_secs(),
            default_timeout_secs: default_condition_timeout_secs(),
        }
    }
}

/// Snapshot query pagination bounds, mirrored from §4.11.
#[derive(Debug, Clone, Deserialize)]
pub struct SnapshotsSection {
    /// Maximum `limit` value accepted by snapshot queries.
    #[serde(default = "default_max_snapshot_limit")]
    pub max_query_limit: i64,
}

impl Default for SnapshotsSection {
    fn default() -> Self {
        Self {
            max_query_limit: default_max_snapshot_limit(),
        }
    }
}

impl MedicConfig {
    /// Validate that configuration values are within sane bounds.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid field encountered.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.monitor.tick_secs >= 1, "monitor.tick_secs must be >= 1");
        anyhow::ensure!(
            self.monitor.worker_concurrency >= 1,
            "monitor.worker_concurrency must be >= 1"
        );
        anyhow::ensure!(
            self.rate_limit.heartbeat_limit >= 1,
            "rate_limit.heartbeat_limit must be >= 1"
        );
        anyhow::ensure!(
            self.rate_limit.management_limit >= 1,
            "rate_limit.management_limit must be >= 1"
        );
        anyhow::ensure!(
            self.rate_limit.window_secs >= 1,
            "rate_limit.window_secs must be >= 1"
        );
        anyhow::ensure!(
            self.circuit_breaker.window_secs >= 1,
            "circuit_breaker.window_secs must be >= 1"
        );
        anyhow::ensure!(
            self.circuit_breaker.max_executions >= 1,
            "circuit_breaker.max_executions must be >= 1"
        );
        anyhow::ensure!(
            self.script.memory_limit_kb >= 1024,
            "script.memory_limit_kb must be >= 1024"
        );
        anyhow::ensure!(
            self.webhook.max_attempts >= 1,
            "webhook.max_attempts must be >= 1"
        );
        anyhow::ensure!(
            self.snapshots.max_query_limit >= 1 && self.snapshots.max_query_limit <= 250,
            "snapshots.max_query_limit must be in [1, 250]"
        );
        Ok(())
    }

    /// Apply environment-variable overrides via an injectable resolver.
    ///
    /// Tests pass a closure over a `HashMap` instead of reading real
    /// process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("MEDIC_MONITOR_TICK_SECS").and_then(|s| s.parse().ok()) {
            self.monitor.tick_secs = v;
        }
        if let Some(v) = env("MEDIC_HEARTBEAT_RATE_LIMIT").and_then(|s| s.parse().ok()) {
            self.rate_limit.heartbeat_limit = v;
        }
        if let Some(v) = env("MEDIC_MANAGEMENT_RATE_LIMIT").and_then(|s| s.parse().ok()) {
            self.rate_limit.management_limit = v;
        }
        if let Some(v) = env("MEDIC_CIRCUIT_BREAKER_MAX_EXECUTIONS").and_then(|s| s.parse().ok()) {
            self.circuit_breaker.max_executions = v;
        }
        if let Some(v) = env("MEDIC_DEFAULT_TIMEZONE") {
            self.maintenance.default_timezone = v;
        }
    }
}

/// Load Medic configuration from a TOML file, apply env overrides, and validate.
///
/// # Errors
///
/// Returns an error if the file cannot be read, parsed, or fails validation.
pub fn load_config(path: &Path, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<MedicConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read medic config at {}", path.display()))?;
    let mut config: MedicConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse medic config at {}", path.display()))?;
    config.apply_overrides(env);
    config.validate()?;
    Ok(config)
}

/// Resolve the Medic config directory (`~/.medic/`), creating it if absent.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<std::path::PathBuf> {
    let dirs = directories::BaseDirs::new().context("failed to determine home directory")?;
    Ok(dirs.home_dir().join(".medic"))
}

fn default_tick_secs() -> u64 {
    15
}

fn default_worker_concurrency() -> usize {
    8
}

fn default_heartbeat_limit() -> u32 {
    100
}

fn default_management_limit() -> u32 {
    20
}

fn default_window_secs() -> u64 {
    60
}

fn default_cb_window_secs() -> i64 {
    3600
}

fn default_cb_max_executions() -> i64 {
    5
}

fn default_timezone() -> String {
    "America/Chicago".to_owned()
}

fn default_business_hours_start() -> u32 {
    9
}

fn default_business_hours_end() -> u32 {
    17
}

fn default_script_memory_kb() -> u64 {
    256 * 1024
}

fn default_cpu_grace_secs() -> u64 {
    5
}

fn default_script_timeout_secs() -> u64 {
    30
}

fn default_output_cap_bytes() -> usize {
    8192
}

fn default_max_attempts() -> u32 {
    3
}

fn default_webhook_timeout_secs() -> u64 {
    30
}

fn default_response_cap_bytes() -> usize {
    4096
}

fn default_condition_poll_secs() -> u64 {
    5
}

fn default_condition_timeout_secs() -> u64 {
    300
}

fn default_max_snapshot_limit() -> i64 {
    250
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_validate() {
        let config = MedicConfig::default();
        config.validate().expect("defaults must be valid");
        assert_eq!(config.monitor.tick_secs, 15);
        assert_eq!(config.rate_limit.heartbeat_limit, 100);
        assert_eq!(config.circuit_breaker.max_executions, 5);
        assert_eq!(config.monitor.business_hours_start_hour, 9);
        assert_eq!(config.monitor.business_hours_end_hour, 17);
    }

    #[test]
    fn override_precedence() {
        let mut config = MedicConfig::default();
        let mut overrides = HashMap::new();
        overrides.insert("MEDIC_MANAGEMENT_RATE_LIMIT".to_owned(), "7".to_owned());
        config.apply_overrides(|key| overrides.get(key).cloned());
        assert_eq!(config.rate_limit.management_limit, 7);
        assert_eq!(config.rate_limit.heartbeat_limit, 100);
    }

    #[test]
    fn rejects_zero_tick() {
        let mut config = MedicConfig::default();
        config.monitor.tick_secs = 0;
        assert!(config.validate().is_err());
    }
}
