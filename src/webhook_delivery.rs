//! Outbound webhook delivery with bounded retry.
//!
//! Ported from `webhook_delivery.py`: up to 3 attempts with exponential
//! backoff delays of 1s, 5s, and 30s, each attempt persisted to
//! `webhook_deliveries` before moving on, so an operator can see exactly
//! how a delivery unfolded even if the process restarts mid-retry.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::Value as Json;
use tokio::task::JoinSet;
use tracing::warn;

use crate::store::models::WebhookConfig;
use crate::store::{Store, StoreError};
use crate::url_validator::UrlValidator;

/// Maximum delivery attempts per webhook per event.
pub const MAX_ATTEMPTS: u32 = 3;

/// Backoff delay before each retry, indexed by attempt number (0-based).
pub const RETRY_DELAYS_SECS: [u64; 3] = [1, 5, 30];

/// Outcome of delivering to a single webhook.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub webhook_id: i64,
    pub delivery_id: Option<i64>,
    pub succeeded: bool,
    pub attempts: u32,
    /// Set on failure; `"disabled"` for a disabled webhook short-circuit,
    /// otherwise the last delivery error.
    pub error: Option<String>,
}

/// Delivers webhook payloads with retry and SSRF validation.
pub struct WebhookDeliverer {
    client: Client,
    validator: Arc<UrlValidator>,
}

impl WebhookDeliverer {
    /// Build a deliverer with the given HTTP client and SSRF validator.
    pub fn new(client: Client, validator: Arc<UrlValidator>) -> Self {
        Self { client, validator }
    }

    /// Deliver `payload` to every enabled webhook applicable to a service in
    /// parallel, one task per webhook, collecting a result for each id. A
    /// webhook whose delivery task errors or panics is logged and skipped
    /// rather than aborting the rest of the fan-out.
    pub async fn deliver_to_all(
        self: &Arc<Self>,
        store: &Arc<Store>,
        service_id: Option<i64>,
        payload: &Json,
    ) -> Result<Vec<DeliveryOutcome>, StoreError> {
        let webhooks = store.webhooks_for_service(service_id).await?;
        let mut tasks = JoinSet::new();
        for webhook in webhooks {
            let deliverer = self.clone();
            let store = store.clone();
            let payload = payload.clone();
            tasks.spawn(async move { deliverer.deliver_one(&store, webhook, payload).await });
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(e)) => warn!(error = %e, "webhook delivery task failed"),
                Err(e) => warn!(error = %e, "webhook delivery task panicked"),
            }
        }
        Ok(outcomes)
    }

    /// Deliver to a single webhook, retrying with backoff on failure.
    pub async fn deliver_one(
        &self,
        store: &Store,
        webhook: WebhookConfig,
        payload: Json,
    ) -> Result<DeliveryOutcome, StoreError> {
        if !webhook.enabled {
            return Ok(DeliveryOutcome {
                webhook_id: webhook.id,
                delivery_id: None,
                succeeded: false,
                attempts: 0,
                error: Some("disabled".to_owned()),
            });
        }

        let delivery_id = store.insert_delivery(webhook.id, &payload).await?;

        if let Err(e) = self.validator.validate(&webhook.url).await {
            let message = e.to_string();
            store.update_delivery(delivery_id, "failed", 0, None, Some(&message)).await?;
            return Ok(DeliveryOutcome {
                webhook_id: webhook.id,
                delivery_id: Some(delivery_id),
                succeeded: false,
                attempts: 0,
                error: Some(message),
            });
        }

        let mut attempts: u32 = 0;
        let mut last_error: Option<String> = None;
        loop {
            attempts += 1;
            let result = self.attempt(&webhook, &payload).await;
            match result {
                Ok((status, body)) if (200..300).contains(&status) => {
                    store
                        .update_delivery(delivery_id, "success", i64::from(attempts), Some(i64::from(status)), Some(&body))
                        .await?;
                    return Ok(DeliveryOutcome {
                        webhook_id: webhook.id,
                        delivery_id: Some(delivery_id),
                        succeeded: true,
                        attempts,
                        error: None,
                    });
                }
                Ok((status, body)) => {
                    last_error = Some(format!("webhook returned status {status}"));
                    store
                        .update_delivery(delivery_id, "retrying", i64::from(attempts), Some(i64::from(status)), Some(&body))
                        .await?;
                }
                Err(message) => {
                    last_error = Some(message.clone());
                    store
                        .update_delivery(delivery_id, "retrying", i64::from(attempts), None, Some(&message))
                        .await?;
                }
            }

            if attempts >= MAX_ATTEMPTS {
                store
                    .update_delivery(delivery_id, "failed", i64::from(attempts), None, None)
                    .await?;
                return Ok(DeliveryOutcome {
                    webhook_id: webhook.id,
                    delivery_id: Some(delivery_id),
                    succeeded: false,
                    attempts,
                    error: last_error,
                });
            }

            let delay = RETRY_DELAYS_SECS[(attempts - 1) as usize];
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }
    }

    async fn attempt(&self, webhook: &WebhookConfig, payload: &Json) -> Result<(u16, String), String> {
        let mut request = self.client.post(&webhook.url).json(payload);
        if let Json::Object(headers) = &webhook.headers {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key, value);
                }
            }
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let truncated = if body.len() > 4096 {
            body.chars().take(4096).collect()
        } else {
            body
        };
        Ok((status, truncated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::Service;
    use crate::url_validator::UrlValidator;

    #[test]
    fn retry_delays_match_spec() {
        assert_eq!(RETRY_DELAYS_SECS, [1, 5, 30]);
        assert_eq!(MAX_ATTEMPTS, 3);
    }

    async fn seed_service(store: &Store) -> i64 {
        let now = chrono::Utc::now();
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
    async fn deliver_to_all_returns_one_outcome_per_webhook() {
        let store = Arc::new(Store::open_in_memory().await.expect("open store"));
        let service_id = seed_service(&store).await;

        store
            .insert_webhook(Some(service_id), "http://169.254.169.254/hook-a", &serde_json::json!({}))
            .await
            .expect("insert webhook a");
        store
            .insert_webhook(Some(service_id), "http://169.254.169.254/hook-b", &serde_json::json!({}))
            .await
            .expect("insert webhook b");

        let validator = Arc::new(UrlValidator::from_env(|_| None));
        let deliverer = Arc::new(WebhookDeliverer::new(Client::new(), validator));

        let outcomes = deliverer
            .deliver_to_all(&store, Some(service_id), &serde_json::json!({"event": "down"}))
            .await
            .expect("deliver_to_all");

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.succeeded && o.attempts == 0));
    }

    #[tokio::test]
    async fn disabled_webhook_short_circuits_without_attempting_delivery() {
        let store = Arc::new(Store::open_in_memory().await.expect("open store"));
        let service_id = seed_service(&store).await;

        let webhook_id = store
            .insert_webhook(Some(service_id), "http://169.254.169.254/hook", &serde_json::json!({}))
            .await
            .expect("insert webhook");
        store.set_webhook_enabled(webhook_id, false).await.expect("disable webhook");

        let validator = Arc::new(UrlValidator::from_env(|_| None));
        let deliverer = Arc::new(WebhookDeliverer::new(Client::new(), validator));

        let outcomes = deliverer
            .deliver_to_all(&store, Some(service_id), &serde_json::json!({"event": "down"}))
            .await
            .expect("deliver_to_all");

        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].succeeded);
        assert_eq!(outcomes[0].attempts, 0);
        assert_eq!(outcomes[0].delivery_id, None);
        assert_eq!(outcomes[0].error.as_deref(), Some("disabled"));
    }
}
