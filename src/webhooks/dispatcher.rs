//! Webhook event fan-out and delivery.
//!
//! `trigger_event` appends the event to the append-only log and fans out to
//! every active webhook of the owner subscribed to the event type. Distinct
//! webhooks are delivered concurrently; deliveries to a single webhook are
//! serialized through a per-webhook lane so its events arrive in trigger
//! order. Failed sends are retried with `2^attempt` backoff up to the
//! webhook's retry budget, and every attempt is recorded in the delivery
//! history. Delivery is at-least-once; consumers deduplicate by event id.
//!
//! Delivery failures never propagate to the originating request.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::WebhookSettings;
use crate::errors::{Error, Result};
use crate::types::{abbrev_uuid, DeliveryId, EventId, OwnerId, WebhookId};

use super::events::{WebhookEvent, WebhookEventType};
use super::{signing, Webhook, WebhookStore};

/// Record of one delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: DeliveryId,
    pub webhook_id: WebhookId,
    pub event_id: EventId,
    pub attempt: u32,
    pub ts: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry: Option<DateTime<Utc>>,
}

/// Outcome of a single HTTP send attempt.
#[derive(Debug)]
enum SendOutcome {
    Success {
        status_code: u16,
        body: String,
    },
    Failure {
        status_code: Option<u16>,
        body: Option<String>,
        error: String,
    },
}

impl SendOutcome {
    fn success(&self) -> bool {
        matches!(self, SendOutcome::Success { .. })
    }

    fn status_code(&self) -> Option<u16> {
        match self {
            SendOutcome::Success { status_code, .. } => Some(*status_code),
            SendOutcome::Failure { status_code, .. } => *status_code,
        }
    }

    fn response_body(&self) -> Option<String> {
        match self {
            SendOutcome::Success { body, .. } => Some(body.clone()),
            SendOutcome::Failure { body, .. } => body.clone(),
        }
    }
}

pub struct WebhookDispatcher {
    store: Arc<WebhookStore>,
    settings: WebhookSettings,
    client: reqwest::Client,
    events: RwLock<Vec<WebhookEvent>>,
    deliveries: RwLock<Vec<WebhookDelivery>>,
    /// Per-webhook delivery lanes keep one webhook's events in order
    lanes: DashMap<WebhookId, Arc<Mutex<()>>>,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<WebhookStore>, settings: WebhookSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .expect("Failed to create webhook HTTP client");
        Self {
            store,
            settings,
            client,
            events: RwLock::new(Vec::new()),
            deliveries: RwLock::new(Vec::new()),
            lanes: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<WebhookStore> {
        &self.store
    }

    /// Append an event and deliver it to every subscribed webhook of the
    /// owner. Returns the event regardless of delivery outcomes.
    pub async fn trigger_event(
        &self,
        owner: OwnerId,
        event_type: WebhookEventType,
        data: serde_json::Value,
    ) -> WebhookEvent {
        let event = WebhookEvent::new(owner, event_type, data);
        self.events.write().push(event.clone());

        let subscribed = self.store.subscribed(owner, event_type);
        if subscribed.is_empty() {
            return event;
        }

        tracing::debug!(
            event_id = %abbrev_uuid(&event.id),
            event_type = %event_type,
            webhooks = subscribed.len(),
            "Fanning out event"
        );

        futures::future::join_all(
            subscribed
                .into_iter()
                .map(|webhook| self.deliver_with_retries(webhook, event.clone())),
        )
        .await;

        event
    }

    /// Events emitted for an owner, oldest first.
    pub fn events(&self, owner: OwnerId) -> Vec<WebhookEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.owner == owner)
            .cloned()
            .collect()
    }

    /// Delivery history for one webhook, oldest first.
    pub fn deliveries(&self, webhook_id: WebhookId, owner: OwnerId) -> Result<Vec<WebhookDelivery>> {
        // Visibility check doubles as existence check
        self.store.get(webhook_id, owner)?;
        Ok(self
            .deliveries
            .read()
            .iter()
            .filter(|d| d.webhook_id == webhook_id)
            .cloned()
            .collect())
    }

    /// Re-attempt a specific recorded delivery, incrementing its attempt
    /// counter.
    pub async fn retry_delivery(&self, delivery_id: DeliveryId, owner: OwnerId) -> Result<WebhookDelivery> {
        let previous = self
            .deliveries
            .read()
            .iter()
            .find(|d| d.id == delivery_id)
            .cloned()
            .ok_or_else(|| Error::not_found("delivery", delivery_id))?;

        let webhook = self.store.get(previous.webhook_id, owner)?;
        let event = self
            .events
            .read()
            .iter()
            .find(|e| e.id == previous.event_id)
            .cloned()
            .ok_or_else(|| Error::not_found("event", previous.event_id))?;

        let body = serde_json::to_string(&event)
            .map_err(|e| Error::internal(format!("serialize webhook event: {e}")))?;

        let lane = self.lane(webhook.id);
        let _guard = lane.lock().await;

        let outcome = self.send_once(&webhook, &body).await;
        let delivery = self.record_attempt(&webhook, &event, previous.attempt + 1, &outcome, None);
        Ok(delivery)
    }

    fn lane(&self, webhook_id: WebhookId) -> Arc<Mutex<()>> {
        self.lanes
            .entry(webhook_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn deliver_with_retries(&self, webhook: Webhook, event: WebhookEvent) {
        let body = match serde_json::to_string(&event) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(event_id = %abbrev_uuid(&event.id), error = %e, "Failed to serialize event payload");
                return;
            }
        };

        let lane = self.lane(webhook.id);
        let _guard = lane.lock().await;

        for attempt in 0..=webhook.retries {
            let outcome = self.send_once(&webhook, &body).await;
            let is_last = attempt == webhook.retries;
            let backoff = (!outcome.success() && !is_last).then(|| self.backoff(attempt));

            let next_retry = backoff.map(|b| {
                Utc::now() + chrono::Duration::from_std(b).unwrap_or_else(|_| chrono::Duration::zero())
            });
            self.record_attempt(&webhook, &event, attempt, &outcome, next_retry);

            match outcome {
                SendOutcome::Success { status_code, .. } => {
                    tracing::info!(
                        webhook_id = %abbrev_uuid(&webhook.id),
                        event_id = %abbrev_uuid(&event.id),
                        status = status_code,
                        attempt,
                        "Webhook delivered successfully"
                    );
                    return;
                }
                SendOutcome::Failure {
                    status_code, error, ..
                } => {
                    tracing::warn!(
                        webhook_id = %abbrev_uuid(&webhook.id),
                        event_id = %abbrev_uuid(&event.id),
                        status_code = ?status_code,
                        attempt,
                        error = %error,
                        "Webhook delivery failed"
                    );
                }
            }

            if let Some(backoff) = backoff {
                tokio::time::sleep(backoff).await;
            }
        }

        tracing::warn!(
            webhook_id = %abbrev_uuid(&webhook.id),
            event_id = %abbrev_uuid(&event.id),
            retries = webhook.retries,
            "Webhook delivery exhausted retries"
        );
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.settings
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    async fn send_once(&self, webhook: &Webhook, body: &str) -> SendOutcome {
        let mut request = self
            .client
            .post(&webhook.url)
            .header("Content-Type", "application/json");
        for (name, value) in &webhook.headers {
            request = request.header(name, value);
        }
        if let Some(secret) = &webhook.secret {
            request = request.header("X-Signature", signing::sign_body(secret, body));
        }

        match request.body(body.to_string()).send().await {
            Ok(response) => {
                let status_code = response.status().as_u16();
                let success = response.status().is_success();
                let body = response.text().await.unwrap_or_default();
                if success {
                    SendOutcome::Success { status_code, body }
                } else {
                    SendOutcome::Failure {
                        status_code: Some(status_code),
                        body: Some(body),
                        error: format!("HTTP {status_code}"),
                    }
                }
            }
            Err(e) => SendOutcome::Failure {
                status_code: None,
                body: None,
                error: e.to_string(),
            },
        }
    }

    fn record_attempt(
        &self,
        webhook: &Webhook,
        event: &WebhookEvent,
        attempt: u32,
        outcome: &SendOutcome,
        next_retry: Option<DateTime<Utc>>,
    ) -> WebhookDelivery {
        let delivery = WebhookDelivery {
            id: Uuid::new_v4(),
            webhook_id: webhook.id,
            event_id: event.id,
            attempt,
            ts: Utc::now(),
            success: outcome.success(),
            status_code: outcome.status_code(),
            response_body: outcome.response_body().filter(|b| !b.is_empty()),
            next_retry,
        };
        self.deliveries.write().push(delivery.clone());
        self.store
            .record_attempt(webhook.id, outcome.success(), outcome.status_code());
        delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhooks::WebhookCreate;
    use std::collections::HashMap;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_settings() -> WebhookSettings {
        WebhookSettings {
            timeout: Duration::from_secs(2),
            default_retries: 3,
            backoff_base: Duration::from_millis(10),
        }
    }

    fn dispatcher() -> WebhookDispatcher {
        WebhookDispatcher::new(Arc::new(WebhookStore::new(3)), test_settings())
    }

    fn subscription(url: &str, events: &[WebhookEventType], retries: u32) -> WebhookCreate {
        WebhookCreate {
            url: url.to_string(),
            name: "test".to_string(),
            events: events.iter().copied().collect(),
            secret: None,
            headers: HashMap::new(),
            retries: Some(retries),
        }
    }

    #[tokio::test]
    async fn test_successful_delivery() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("Content-Type", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = dispatcher();
        let owner = Uuid::new_v4();
        let webhook = dispatcher
            .store()
            .create(owner, subscription(&server.uri(), &[WebhookEventType::BatchCompleted], 0))
            .unwrap();

        let event = dispatcher
            .trigger_event(owner, WebhookEventType::BatchCompleted, serde_json::json!({"n": 1}))
            .await;

        let deliveries = dispatcher.deliveries(webhook.id, owner).unwrap();
        assert_eq!(deliveries.len(), 1);
        assert!(deliveries[0].success);
        assert_eq!(deliveries[0].status_code, Some(200));
        assert_eq!(deliveries[0].event_id, event.id);

        let updated = dispatcher.store().get(webhook.id, owner).unwrap();
        assert!(updated.last_status.unwrap().success);
    }

    #[tokio::test]
    async fn test_signature_header_matches_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dispatcher = dispatcher();
        let owner = Uuid::new_v4();
        let secret = signing::generate_secret();
        let mut create = subscription(&server.uri(), &[WebhookEventType::Error], 0);
        create.secret = Some(secret.clone());
        dispatcher.store().create(owner, create).unwrap();

        dispatcher
            .trigger_event(owner, WebhookEventType::Error, serde_json::json!({"boom": true}))
            .await;

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        let body = String::from_utf8(requests[0].body.clone()).unwrap();
        let signature = requests[0]
            .headers
            .get("X-Signature")
            .expect("signature header present")
            .to_str()
            .unwrap();
        assert_eq!(signature, signing::sign_body(&secret, &body));
    }

    #[tokio::test]
    async fn test_failure_then_retry_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = dispatcher();
        let owner = Uuid::new_v4();
        let webhook = dispatcher
            .store()
            .create(owner, subscription(&server.uri(), &[WebhookEventType::CreditLow], 2))
            .unwrap();

        dispatcher
            .trigger_event(owner, WebhookEventType::CreditLow, serde_json::json!({}))
            .await;

        let deliveries = dispatcher.deliveries(webhook.id, owner).unwrap();
        assert_eq!(deliveries.len(), 2);
        assert!(!deliveries[0].success);
        assert!(deliveries[0].next_retry.is_some());
        assert_eq!(deliveries[0].attempt, 0);
        assert!(deliveries[1].success);
        assert_eq!(deliveries[1].attempt, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_records_every_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let dispatcher = dispatcher();
        let owner = Uuid::new_v4();
        let webhook = dispatcher
            .store()
            .create(owner, subscription(&server.uri(), &[WebhookEventType::Error], 2))
            .unwrap();

        dispatcher
            .trigger_event(owner, WebhookEventType::Error, serde_json::json!({}))
            .await;

        let deliveries = dispatcher.deliveries(webhook.id, owner).unwrap();
        assert_eq!(deliveries.len(), 3);
        assert!(deliveries.iter().all(|d| !d.success));
        // The terminal attempt has no scheduled retry
        assert!(deliveries[2].next_retry.is_none());

        let updated = dispatcher.store().get(webhook.id, owner).unwrap();
        assert_eq!(updated.consecutive_failures, 3);
    }

    #[tokio::test]
    async fn test_unsubscribed_and_inactive_webhooks_are_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dispatcher = dispatcher();
        let owner = Uuid::new_v4();
        // Subscribed to a different event type
        dispatcher
            .store()
            .create(owner, subscription(&server.uri(), &[WebhookEventType::CreditLow], 0))
            .unwrap();
        // Subscribed but deactivated
        let inactive = dispatcher
            .store()
            .create(owner, subscription(&server.uri(), &[WebhookEventType::Error], 0))
            .unwrap();
        dispatcher
            .store()
            .update(
                inactive.id,
                owner,
                crate::webhooks::WebhookUpdate {
                    active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        let event = dispatcher
            .trigger_event(owner, WebhookEventType::Error, serde_json::json!({}))
            .await;

        // The event is still appended to the log
        assert_eq!(dispatcher.events(owner).len(), 1);
        assert_eq!(dispatcher.events(owner)[0].id, event.id);
    }

    #[tokio::test]
    async fn test_network_error_is_recorded_as_failure() {
        let dispatcher = dispatcher();
        let owner = Uuid::new_v4();
        let webhook = dispatcher
            .store()
            .create(owner, subscription("http://127.0.0.1:1", &[WebhookEventType::Error], 0))
            .unwrap();

        dispatcher
            .trigger_event(owner, WebhookEventType::Error, serde_json::json!({}))
            .await;

        let deliveries = dispatcher.deliveries(webhook.id, owner).unwrap();
        assert_eq!(deliveries.len(), 1);
        assert!(!deliveries[0].success);
        assert!(deliveries[0].status_code.is_none());
    }

    #[tokio::test]
    async fn test_retry_delivery_increments_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dispatcher = dispatcher();
        let owner = Uuid::new_v4();
        let webhook = dispatcher
            .store()
            .create(owner, subscription(&server.uri(), &[WebhookEventType::Error], 0))
            .unwrap();

        dispatcher
            .trigger_event(owner, WebhookEventType::Error, serde_json::json!({}))
            .await;
        let first = dispatcher.deliveries(webhook.id, owner).unwrap()[0].clone();
        assert!(!first.success);

        let retried = dispatcher.retry_delivery(first.id, owner).await.unwrap();
        assert!(retried.success);
        assert_eq!(retried.attempt, first.attempt + 1);
        assert_eq!(retried.event_id, first.event_id);

        // A stranger cannot retry someone else's delivery
        let err = dispatcher.retry_delivery(first.id, Uuid::new_v4()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_at_least_once_per_matching_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dispatcher = dispatcher();
        let owner = Uuid::new_v4();
        let webhook = dispatcher
            .store()
            .create(
                owner,
                subscription(
                    &server.uri(),
                    &[WebhookEventType::RequestCompleted, WebhookEventType::RequestFailed],
                    1,
                ),
            )
            .unwrap();

        for _ in 0..3 {
            dispatcher
                .trigger_event(owner, WebhookEventType::RequestCompleted, serde_json::json!({}))
                .await;
        }
        dispatcher
            .trigger_event(owner, WebhookEventType::RequestFailed, serde_json::json!({}))
            .await;

        let deliveries = dispatcher.deliveries(webhook.id, owner).unwrap();
        let unique_events: std::collections::HashSet<_> = deliveries.iter().map(|d| d.event_id).collect();
        assert_eq!(unique_events.len(), 4, "at least one attempt per matching event");
    }
}
