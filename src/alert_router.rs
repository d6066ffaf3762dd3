//! Alert routing: selecting and notifying a service's targets.
//!
//! Ported from `alert_routing.py`. Targets are tried either all-at-once
//! (`notify_all`, used for active-incident fan-out) or in priority order
//! until one succeeds (`notify_until_success`, used for the legacy
//! single-channel fallback). When a service has no configured targets at
//! all, the Slack channel on its owning team stands in - the two-level
//! fallback the original calls "legacy routing".

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use reqwest::Client;
use serde_json::Value as Json;
use thiserror::Error;

use crate::store::models::{NotificationTarget, Service};
use crate::store::{Store, StoreError};
use crate::url_validator::UrlValidator;

/// A single attempt at delivering a notification to one target.
#[derive(Debug, Clone)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub severity: Severity,
    pub context: Json,
}

/// Alert severity, used for color-coding in chat-based senders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Hex color used by chat senders for attachment/embed coloring.
    pub fn color(self) -> &'static str {
        match self {
            Self::Info => "#2eb67d",
            Self::Warning => "#ecb22e",
            Self::Critical => "#e01e5a",
        }
    }
}

/// Hex color for a service's `priority` string, used when building the
/// failure-notification payload. Ported from `monitor.py`'s `color_code`.
pub fn priority_color(priority: &str) -> &'static str {
    match priority {
        "p1" => "#F35A00",
        "p2" | "p3" => "#e9a820",
        _ => "#F35A00",
    }
}

/// A service's current working-hours classification, used to filter
/// targets whose `period` is not `"always"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingHoursPeriod {
    DuringHours,
    AfterHours,
}

impl WorkingHoursPeriod {
    /// The `period` string this classification matches, besides `"always"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DuringHours => "during_hours",
            Self::AfterHours => "after_hours",
        }
    }
}

/// Classify `now` against a simple local-hour working-hours window
/// (`[start_hour, end_hour)`, service timezone `tz`, Monday-Friday).
///
/// The original calls this out as delegating to an external working-hours
/// collaborator; this is a self-contained stand-in covering the common
/// "business hours" case without requiring an external schedule service.
pub fn classify_period(now: DateTime<Utc>, tz: Tz, start_hour: u32, end_hour: u32) -> WorkingHoursPeriod {
    use chrono::{Datelike, Timelike, Weekday};

    let local = now.with_timezone(&tz);
    let is_weekday = !matches!(local.weekday(), Weekday::Sat | Weekday::Sun);
    let hour = local.hour();
    if is_weekday && hour >= start_hour && hour < end_hour {
        WorkingHoursPeriod::DuringHours
    } else {
        WorkingHoursPeriod::AfterHours
    }
}

/// Errors a [`NotificationSender`] may report for a single target.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("target config invalid: {0}")]
    InvalidConfig(String),
    #[error("delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Result of a successful delivery: `dedup_key` is set only by senders
/// (PagerDuty) whose backend hands back a deduplication/incident key that
/// must be persisted on the alert to support a later resolve call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOutcome {
    pub dedup_key: Option<String>,
}

/// A pluggable delivery mechanism for one notification target type.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// The `target_type` string this sender handles (e.g. `"slack"`, `"webhook"`, `"pagerduty"`).
    fn target_type(&self) -> &'static str;

    /// Deliver `payload` to `target`.
    async fn send(&self, target: &NotificationTarget, payload: &NotificationPayload) -> Result<SendOutcome, SendError>;

    /// Resolve a previously-raised incident identified by `dedup_key`, for
    /// sender types that support it (PagerDuty). Types that don't carry a
    /// resolvable backend state return `Ok(())` - there's nothing to do.
    async fn resolve(&self, dedup_key: &str) -> Result<(), SendError> {
        let _ = dedup_key;
        Ok(())
    }
}

/// Routes notifications for a service across its configured targets, or
/// falls back to the owning team's legacy Slack channel.
pub struct AlertRouter {
    senders: Vec<Box<dyn NotificationSender>>,
}

impl AlertRouter {
    /// Build a router from the given senders, one per `target_type`.
    pub fn new(senders: Vec<Box<dyn NotificationSender>>) -> Self {
        Self { senders }
    }

    fn sender_for(&self, target_type: &str) -> Option<&dyn NotificationSender> {
        self.senders
            .iter()
            .find(|s| s.target_type() == target_type)
            .map(std::convert::AsRef::as_ref)
    }

    /// Fan out to every enabled target for the service, best-effort:
    /// a failure on one target does not stop delivery to the others.
    pub async fn notify_all(&self, store: &Store, service: &Service, payload: &NotificationPayload) -> Result<Vec<RoutingResult>, StoreError> {
        let targets = self.effective_targets(store, service).await?;
        Ok(self.send_to_targets(&targets, payload).await)
    }

    /// Like [`notify_all`](Self::notify_all), but additionally filters out
    /// targets whose `period` is neither `"always"` nor `current_period`,
    /// per spec §4.2's schedule-aware selection.
    pub async fn route_alert_with_schedule(
        &self,
        store: &Store,
        service: &Service,
        payload: &NotificationPayload,
        current_period: WorkingHoursPeriod,
    ) -> Result<Vec<RoutingResult>, StoreError> {
        let targets = self.effective_targets(store, service).await?;
        let scheduled: Vec<NotificationTarget> = targets
            .into_iter()
            .filter(|target| target.period == "always" || target.period == current_period.as_str())
            .collect();
        Ok(self.send_to_targets(&scheduled, payload).await)
    }

    async fn send_to_targets(&self, targets: &[NotificationTarget], payload: &NotificationPayload) -> Vec<RoutingResult> {
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let result = match self.sender_for(&target.target_type) {
                Some(sender) => sender.send(target, payload).await,
                None => Err(SendError::InvalidConfig(format!(
                    "no sender registered for target type '{}'",
                    target.target_type
                ))),
            };
            results.push(match result {
                Ok(outcome) => RoutingResult {
                    target_id: target.id,
                    target_type: target.target_type.clone(),
                    success: true,
                    error_message: None,
                    dedup_key: outcome.dedup_key,
                },
                Err(e) => RoutingResult {
                    target_id: target.id,
                    target_type: target.target_type.clone(),
                    success: false,
                    error_message: Some(e.to_string()),
                    dedup_key: None,
                },
            });
        }
        results
    }

    /// Pull the PagerDuty `external_reference_id` out of a [`notify_all`](Self::notify_all)
    /// result set, if a PagerDuty send succeeded and returned one.
    pub fn pagerduty_reference(results: &[RoutingResult]) -> Option<String> {
        results
            .iter()
            .find(|r| r.target_type == "pagerduty" && r.success)
            .and_then(|r| r.dedup_key.clone())
    }

    /// Try targets in priority order, stopping at the first success.
    pub async fn notify_until_success(
        &self,
        store: &Store,
        service: &Service,
        payload: &NotificationPayload,
    ) -> Result<bool, StoreError> {
        let targets = self.effective_targets(store, service).await?;
        for target in &targets {
            let result = match self.sender_for(&target.target_type) {
                Some(sender) => sender.send(target, payload).await,
                None => continue,
            };
            if result.is_ok() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Resolve a PagerDuty incident identified by `dedup_key`, per spec
    /// §4.1's `closeAlert`: "if `external_reference_id` is non-empty, issue
    /// a PagerDuty resolve for that key." A no-op if no PagerDuty sender is
    /// registered.
    pub async fn resolve_pagerduty(&self, dedup_key: &str) -> Result<(), SendError> {
        match self.sender_for("pagerduty") {
            Some(sender) => sender.resolve(dedup_key).await,
            None => Ok(()),
        }
    }

    /// A service's configured notification targets, or - if none exist - a
    /// single synthetic Slack target built from its team's legacy channel.
    async fn effective_targets(
        &self,
        store: &Store,
        service: &Service,
    ) -> Result<Vec<NotificationTarget>, StoreError> {
        let configured = store.notification_targets_for_service(service.id).await?;
        if !configured.is_empty() {
            return Ok(configured);
        }

        if let Some(channel) = self.legacy_channel_for_service(store, service).await? {
            return Ok(vec![NotificationTarget {
                id: 0,
                service_id: service.id,
                target_type: "slack".to_owned(),
                config: serde_json::json!({ "channel_id": channel }),
                priority: 0,
                enabled: true,
                period: "always".to_owned(),
            }]);
        }
        Ok(Vec::new())
    }

    /// The team's `slack_channel_id`, if the service has a team and the
    /// team has one configured.
    pub async fn legacy_channel_for_service(
        &self,
        store: &Store,
        service: &Service,
    ) -> Result<Option<String>, StoreError> {
        let Some(team_id) = service.team_id else {
            return Ok(None);
        };
        let team = store.get_team(team_id).await?;
        Ok(team.and_then(|t| t.slack_channel_id))
    }
}

/// One target's delivery result, shaped for surfacing to operators.
#[derive(Debug, Clone)]
pub struct RoutingResult {
    pub target_id: i64,
    pub target_type: String,
    pub success: bool,
    pub error_message: Option<String>,
    /// Set only by senders (PagerDuty) that hand back a dedup/incident key.
    pub dedup_key: Option<String>,
}

/// Whether every result in a routing pass succeeded.
pub fn all_succeeded(results: &[RoutingResult]) -> bool {
    !results.is_empty() && results.iter().all(|r| r.success)
}

/// Whether at least one result in a routing pass succeeded.
pub fn any_succeeded(results: &[RoutingResult]) -> bool {
    results.iter().any(|r| r.success)
}

/// Partition routing results into (successful, failed).
pub fn partition(results: Vec<RoutingResult>) -> (Vec<RoutingResult>, Vec<RoutingResult>) {
    results.into_iter().partition(|r| r.success)
}

/// The core's default sender: validates minimum required config per
/// target type and performs the corresponding outbound call. Webhook
/// targets are routed through the [`UrlValidator`]; disabled targets are
/// rejected by [`AlertRouter::effective_targets`] before reaching a sender.
pub struct HttpNotificationSender {
    client: Client,
    validator: Arc<UrlValidator>,
    slack_bot_token: Option<String>,
}

impl HttpNotificationSender {
    /// Build a sender. `slack_bot_token` is used as the bearer token for
    /// Slack's `chat.postMessage`; without one, Slack targets fail closed.
    pub fn new(client: Client, validator: Arc<UrlValidator>, slack_bot_token: Option<String>) -> Self {
        Self {
            client,
            validator,
            slack_bot_token,
        }
    }

    async fn send_slack(&self, target: &NotificationTarget, payload: &NotificationPayload) -> Result<SendOutcome, SendError> {
        let channel_id = target
            .config
            .get("channel_id")
            .and_then(Json::as_str)
            .ok_or_else(|| SendError::InvalidConfig("slack target missing 'channel_id'".to_owned()))?;
        let token = self
            .slack_bot_token
            .as_deref()
            .ok_or_else(|| SendError::InvalidConfig("no slack bot token configured".to_owned()))?;

        let body = serde_json::json!({
            "channel": channel_id,
            "text": format!("{}\n{}", payload.title, payload.body),
            "attachments": [{ "color": payload.severity.color(), "text": payload.body }],
        });

        let response = self
            .client
            .post("https://slack.com/api/chat.postMessage")
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::DeliveryFailed(e.to_string()))?;

        let parsed: Json = response.json().await.map_err(|e| SendError::DeliveryFailed(e.to_string()))?;
        if parsed.get("ok").and_then(Json::as_bool).unwrap_or(false) {
            Ok(SendOutcome::default())
        } else {
            let error = parsed.get("error").and_then(Json::as_str).unwrap_or("unknown error");
            Err(SendError::DeliveryFailed(format!("slack api error: {error}")))
        }
    }

    async fn send_pagerduty(&self, target: &NotificationTarget, payload: &NotificationPayload) -> Result<SendOutcome, SendError> {
        let service_key = target
            .config
            .get("service_key")
            .and_then(Json::as_str)
            .ok_or_else(|| SendError::InvalidConfig("pagerduty target missing 'service_key'".to_owned()))?;

        let body = serde_json::json!({
            "routing_key": service_key,
            "event_action": "trigger",
            "payload": {
                "summary": payload.title,
                "source": "medic",
                "severity": match payload.severity {
                    Severity::Info => "info",
                    Severity::Warning => "warning",
                    Severity::Critical => "critical",
                },
                "custom_details": { "body": payload.body, "context": payload.context },
            },
        });

        let response = self
            .client
            .post("https://events.pagerduty.com/v2/enqueue")
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::DeliveryFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SendError::DeliveryFailed(format!("pagerduty returned status {}", response.status())));
        }

        let parsed: Json = response.json().await.map_err(|e| SendError::DeliveryFailed(e.to_string()))?;
        let dedup_key = parsed.get("dedup_key").and_then(Json::as_str);
        // The routing key isn't returned in the trigger response, but a
        // resolve call needs it alongside the dedup key, so the pair is
        // packed into one opaque reference that `resolve_pagerduty_incident`
        // unpacks. This is what gets persisted as `external_reference_id`.
        let external_reference = dedup_key.map(|key| format!("{service_key}:{key}"));
        Ok(SendOutcome {
            dedup_key: external_reference,
        })
    }

    /// Resolve a previously-triggered PagerDuty incident identified by an
    /// opaque `routing_key:dedup_key` reference (see [`Self::send_pagerduty`]).
    async fn resolve_pagerduty_incident(&self, external_reference: &str) -> Result<(), SendError> {
        let (routing_key, dedup_key) = external_reference
            .split_once(':')
            .ok_or_else(|| SendError::InvalidConfig("malformed pagerduty external reference".to_owned()))?;

        let body = serde_json::json!({
            "routing_key": routing_key,
            "event_action": "resolve",
            "dedup_key": dedup_key,
        });

        let response = self
            .client
            .post("https://events.pagerduty.com/v2/enqueue")
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::DeliveryFailed(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(SendError::DeliveryFailed(format!("pagerduty resolve returned status {}", response.status())))
        }
    }

    async fn send_webhook(&self, target: &NotificationTarget, payload: &NotificationPayload) -> Result<SendOutcome, SendError> {
        let url = target
            .config
            .get("url")
            .and_then(Json::as_str)
            .ok_or_else(|| SendError::InvalidConfig("webhook target missing 'url'".to_owned()))?;

        self.validator
            .validate(url)
            .await
            .map_err(|_| SendError::InvalidConfig("webhook url rejected".to_owned()))?;

        let body = serde_json::json!({
            "title": payload.title,
            "body": payload.body,
            "severity": match payload.severity {
                Severity::Info => "info",
                Severity::Warning => "warning",
                Severity::Critical => "critical",
            },
            "context": payload.context,
        });

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| SendError::DeliveryFailed(e.to_string()))?;

        if response.status().is_success() {
            Ok(SendOutcome::default())
        } else {
            Err(SendError::DeliveryFailed(format!("webhook returned status {}", response.status())))
        }
    }
}

/// Build the three default senders (`slack`, `pagerduty`, `webhook`) sharing
/// one underlying [`HttpNotificationSender`], ready to pass to [`AlertRouter::new`].
pub fn default_senders(client: Client, validator: Arc<UrlValidator>, slack_bot_token: Option<String>) -> Vec<Box<dyn NotificationSender>> {
    let inner = Arc::new(HttpNotificationSender::new(client, validator, slack_bot_token));
    vec![
        Box::new(SlackSender(inner.clone())),
        Box::new(PagerDutySender(inner.clone())),
        Box::new(WebhookSender(inner)),
    ]
}

struct SlackSender(Arc<HttpNotificationSender>);

#[async_trait]
impl NotificationSender for SlackSender {
    fn target_type(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, target: &NotificationTarget, payload: &NotificationPayload) -> Result<SendOutcome, SendError> {
        self.0.send_slack(target, payload).await
    }
}

struct PagerDutySender(Arc<HttpNotificationSender>);

#[async_trait]
impl NotificationSender for PagerDutySender {
    fn target_type(&self) -> &'static str {
        "pagerduty"
    }

    async fn send(&self, target: &NotificationTarget, payload: &NotificationPayload) -> Result<SendOutcome, SendError> {
        self.0.send_pagerduty(target, payload).await
    }

    async fn resolve(&self, dedup_key: &str) -> Result<(), SendError> {
        self.0.resolve_pagerduty_incident(dedup_key).await
    }
}

struct WebhookSender(Arc<HttpNotificationSender>);

#[async_trait]
impl NotificationSender for WebhookSender {
    fn target_type(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, target: &NotificationTarget, payload: &NotificationPayload) -> Result<SendOutcome, SendError> {
        self.0.send_webhook(target, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSender {
        kind: &'static str,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSender for CountingSender {
        fn target_type(&self) -> &'static str {
            self.kind
        }

        async fn send(&self, _target: &NotificationTarget, _payload: &NotificationPayload) -> Result<SendOutcome, SendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(SendError::DeliveryFailed("boom".to_owned()))
            } else {
                Ok(SendOutcome::default())
            }
        }
    }

    fn sample_service(team_id: Option<i64>) -> Service {
        let now = chrono::Utc::now();
        Service {
            id: 1,
            heartbeat_name: "svc".to_owned(),
            service_name: "svc".to_owned(),
            active: true,
            muted: false,
            down: true,
            alert_interval: 5,
            threshold: 1,
            grace_period_seconds: 0,
            team_id,
            priority: "p1".to_owned(),
            runbook: None,
            max_duration_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_payload() -> NotificationPayload {
        NotificationPayload {
            title: "svc is down".to_owned(),
            body: "no heartbeat".to_owned(),
            severity: Severity::Critical,
            context: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn falls_back_to_legacy_team_channel_when_no_targets() {
        let store = Store::open_in_memory().await.expect("open store");
        let calls = Arc::new(AtomicUsize::new(0));
        let router = AlertRouter::new(vec![Box::new(CountingSender {
            kind: "slack",
            calls: calls.clone(),
            fail: false,
        })]);

        store
            .insert_team("platform", Some("C123"))
            .await
            .expect("insert team");
        let service = sample_service(Some(1));

        let results = router
            .notify_all(&store, &service, &sample_payload())
            .await
            .expect("notify_all");
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert!(all_succeeded(&results));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn route_alert_with_schedule_filters_by_period() {
        let store = Store::open_in_memory().await.expect("open store");
        let service_id = store
            .insert_service(&sample_service(None))
            .await
            .expect("insert service");
        store
            .insert_notification_target(service_id, "slack", &serde_json::json!({"channel_id": "C1"}), 0, true, "during_hours")
            .await
            .expect("insert target");

        let router = AlertRouter::new(vec![Box::new(CountingSender {
            kind: "slack",
            calls: Arc::new(AtomicUsize::new(0)),
            fail: false,
        })]);
        let mut service = sample_service(None);
        service.id = service_id;

        let results = router
            .route_alert_with_schedule(&store, &service, &sample_payload(), WorkingHoursPeriod::AfterHours)
            .await
            .expect("route_alert_with_schedule");
        assert!(results.is_empty());

        let results = router
            .route_alert_with_schedule(&store, &service, &sample_payload(), WorkingHoursPeriod::DuringHours)
            .await
            .expect("route_alert_with_schedule");
        assert_eq!(results.len(), 1);
        assert!(any_succeeded(&results));
        let (success, failed) = partition(results);
        assert_eq!(success.len(), 1);
        assert!(failed.is_empty());
    }

    #[test]
    fn priority_color_matches_the_documented_mapping() {
        assert_eq!(priority_color("p1"), "#F35A00");
        assert_eq!(priority_color("p2"), "#e9a820");
        assert_eq!(priority_color("p3"), "#e9a820");
        assert_eq!(priority_color("p4"), "#F35A00");
    }

    #[test]
    fn classify_period_distinguishes_weekday_business_hours() {
        let tz = chrono_tz::America::Chicago;
        let weekday_morning = DateTime::parse_from_rfc3339("2026-07-27T14:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(classify_period(weekday_morning, tz, 9, 17), WorkingHoursPeriod::DuringHours);

        let weekday_night = DateTime::parse_from_rfc3339("2026-07-27T03:00:00Z").unwrap().with_timezone(&Utc);
        assert_eq!(classify_period(weekday_night, tz, 9, 17), WorkingHoursPeriod::AfterHours);
    }

    #[tokio::test]
    async fn notify_until_success_stops_at_first_success() {
        let store = Store::open_in_memory().await.expect("open store");
        let failing_calls = Arc::new(AtomicUsize::new(0));
        let ok_calls = Arc::new(AtomicUsize::new(0));
        let router = AlertRouter::new(vec![
            Box::new(CountingSender {
                kind: "webhook",
                calls: failing_calls.clone(),
                fail: true,
            }),
            Box::new(CountingSender {
                kind: "slack",
                calls: ok_calls.clone(),
                fail: false,
            }),
        ]);

        store
            .insert_team("platform", Some("C123"))
            .await
            .expect("insert team");
        let service = sample_service(Some(1));
        let succeeded = router
            .notify_until_success(&store, &service, &sample_payload())
            .await
            .expect("notify_until_success");
        assert!(succeeded);
    }

    #[test]
    fn pagerduty_reference_picks_out_the_pagerduty_outcome() {
        let results = vec![
            RoutingResult {
                target_id: 1,
                target_type: "slack".to_owned(),
                success: true,
                error_message: None,
                dedup_key: None,
            },
            RoutingResult {
                target_id: 2,
                target_type: "pagerduty".to_owned(),
                success: true,
                error_message: None,
                dedup_key: Some("routing-key:abc123".to_owned()),
            },
        ];
        assert_eq!(AlertRouter::pagerduty_reference(&results), Some("routing-key:abc123".to_owned()));

        let no_pagerduty = vec![RoutingResult {
            target_id: 1,
            target_type: "slack".to_owned(),
            success: true,
            error_message: None,
            dedup_key: None,
        }];
        assert_eq!(AlertRouter::pagerduty_reference(&no_pagerduty), None);

        let failed_pagerduty = vec![RoutingResult {
            target_id: 2,
            target_type: "pagerduty".to_owned(),
            success: false,
            error_message: Some("boom".to_owned()),
            dedup_key: None,
        }];
        assert_eq!(AlertRouter::pagerduty_reference(&failed_pagerduty), None);
    }
}
