//! Webhook subscriptions: per-owner CRUD and the delivery dispatcher.

pub mod dispatcher;
pub mod events;
pub mod signing;

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Error, Result};
use crate::types::{OwnerId, WebhookId};

pub use dispatcher::{WebhookDelivery, WebhookDispatcher};
pub use events::{WebhookEvent, WebhookEventType};

/// Hard cap on per-webhook delivery retries.
pub const MAX_RETRIES: u32 = 10;

/// Outcome of the most recent delivery attempt for a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastStatus {
    pub ts: DateTime<Utc>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub owner: OwnerId,
    pub url: String,
    pub name: String,
    /// Event types this webhook receives
    pub events: BTreeSet<WebhookEventType>,
    /// When set, deliveries carry an `X-Signature` HMAC header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Extra headers overlaid on every delivery
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Delivery retries after the first failed attempt (0..=10)
    pub retries: u32,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<LastStatus>,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    pub fn accepts_event(&self, event_type: WebhookEventType) -> bool {
        self.active && self.events.contains(&event_type)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookCreate {
    pub url: String,
    pub name: String,
    pub events: BTreeSet<WebhookEventType>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Defaults to the configured retry count when absent
    #[serde(default)]
    pub retries: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookUpdate {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub events: Option<BTreeSet<WebhookEventType>>,
    /// `Some(None)` clears the secret
    #[serde(default)]
    pub secret: Option<Option<String>>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub active: Option<bool>,
}

/// In-memory webhook store. Webhooks are isolated per owner; every read and
/// mutation filters server-side on the caller.
pub struct WebhookStore {
    webhooks: RwLock<HashMap<WebhookId, Webhook>>,
    default_retries: u32,
}

impl WebhookStore {
    pub fn new(default_retries: u32) -> Self {
        Self {
            webhooks: RwLock::new(HashMap::new()),
            default_retries: default_retries.min(MAX_RETRIES),
        }
    }

    pub fn create(&self, owner: OwnerId, create: WebhookCreate) -> Result<Webhook> {
        if create.url.trim().is_empty() {
            return Err(Error::invalid("webhook url must not be empty"));
        }
        let retries = create.retries.unwrap_or(self.default_retries);
        if retries > MAX_RETRIES {
            return Err(Error::invalid(format!(
                "webhook retries must be at most {MAX_RETRIES}, got {retries}"
            )));
        }

        let now = Utc::now();
        let webhook = Webhook {
            id: Uuid::new_v4(),
            owner,
            url: create.url,
            name: create.name,
            events: create.events,
            secret: create.secret,
            headers: create.headers,
            retries,
            active: true,
            last_status: None,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        };
        self.webhooks.write().insert(webhook.id, webhook.clone());
        Ok(webhook)
    }

    pub fn get(&self, id: WebhookId, owner: OwnerId) -> Result<Webhook> {
        self.webhooks
            .read()
            .get(&id)
            .filter(|w| w.owner == owner)
            .cloned()
            .ok_or_else(|| Error::not_found("webhook", id))
    }

    pub fn list(&self, owner: OwnerId) -> Vec<Webhook> {
        let mut owned: Vec<Webhook> = self
            .webhooks
            .read()
            .values()
            .filter(|w| w.owner == owner)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        owned
    }

    pub fn update(&self, id: WebhookId, owner: OwnerId, update: WebhookUpdate) -> Result<Webhook> {
        if let Some(retries) = update.retries {
            if retries > MAX_RETRIES {
                return Err(Error::invalid(format!(
                    "webhook retries must be at most {MAX_RETRIES}, got {retries}"
                )));
            }
        }
        let mut webhooks = self.webhooks.write();
        let webhook = webhooks
            .get_mut(&id)
            .filter(|w| w.owner == owner)
            .ok_or_else(|| Error::not_found("webhook", id))?;

        if let Some(url) = update.url {
            webhook.url = url;
        }
        if let Some(name) = update.name {
            webhook.name = name;
        }
        if let Some(events) = update.events {
            webhook.events = events;
        }
        if let Some(secret) = update.secret {
            webhook.secret = secret;
        }
        if let Some(headers) = update.headers {
            webhook.headers = headers;
        }
        if let Some(retries) = update.retries {
            webhook.retries = retries;
        }
        if let Some(active) = update.active {
            webhook.active = active;
        }
        webhook.updated_at = Utc::now();
        Ok(webhook.clone())
    }

    pub fn delete(&self, id: WebhookId, owner: OwnerId) -> Result<Webhook> {
        let mut webhooks = self.webhooks.write();
        match webhooks.get(&id) {
            Some(w) if w.owner == owner => Ok(webhooks.remove(&id).expect("checked above")),
            _ => Err(Error::not_found("webhook", id)),
        }
    }

    /// Replace a webhook's secret with a freshly generated one and return it.
    pub fn rotate_secret(&self, id: WebhookId, owner: OwnerId) -> Result<Webhook> {
        let mut webhooks = self.webhooks.write();
        let webhook = webhooks
            .get_mut(&id)
            .filter(|w| w.owner == owner)
            .ok_or_else(|| Error::not_found("webhook", id))?;
        webhook.secret = Some(signing::generate_secret());
        webhook.updated_at = Utc::now();
        Ok(webhook.clone())
    }

    /// Active webhooks of `owner` subscribed to `event_type`.
    pub fn subscribed(&self, owner: OwnerId, event_type: WebhookEventType) -> Vec<Webhook> {
        self.webhooks
            .read()
            .values()
            .filter(|w| w.owner == owner && w.accepts_event(event_type))
            .cloned()
            .collect()
    }

    /// Update `last_status` and the consecutive failure counter after a
    /// delivery attempt.
    pub fn record_attempt(&self, id: WebhookId, success: bool, status_code: Option<u16>) {
        let mut webhooks = self.webhooks.write();
        if let Some(webhook) = webhooks.get_mut(&id) {
            webhook.last_status = Some(LastStatus {
                ts: Utc::now(),
                success,
                status_code,
            });
            if success {
                webhook.consecutive_failures = 0;
            } else {
                webhook.consecutive_failures += 1;
            }
        }
    }
}
