//! Webhook event types and records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{EventId, OwnerId};

/// Closed set of events the gateway can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WebhookEventType {
    #[serde(rename = "request.created")]
    RequestCreated,
    #[serde(rename = "request.completed")]
    RequestCompleted,
    #[serde(rename = "request.failed")]
    RequestFailed,
    #[serde(rename = "model.unavailable")]
    ModelUnavailable,
    #[serde(rename = "model.fallback")]
    ModelFallback,
    #[serde(rename = "endpoint.created")]
    EndpointCreated,
    #[serde(rename = "endpoint.updated")]
    EndpointUpdated,
    #[serde(rename = "endpoint.deleted")]
    EndpointDeleted,
    #[serde(rename = "credit.low")]
    CreditLow,
    #[serde(rename = "batch.completed")]
    BatchCompleted,
    #[serde(rename = "error")]
    Error,
}

impl WebhookEventType {
    pub const ALL: &'static [WebhookEventType] = &[
        Self::RequestCreated,
        Self::RequestCompleted,
        Self::RequestFailed,
        Self::ModelUnavailable,
        Self::ModelFallback,
        Self::EndpointCreated,
        Self::EndpointUpdated,
        Self::EndpointDeleted,
        Self::CreditLow,
        Self::BatchCompleted,
        Self::Error,
    ];
}

impl std::fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::RequestCreated => "request.created",
            Self::RequestCompleted => "request.completed",
            Self::RequestFailed => "request.failed",
            Self::ModelUnavailable => "model.unavailable",
            Self::ModelFallback => "model.fallback",
            Self::EndpointCreated => "endpoint.created",
            Self::EndpointUpdated => "endpoint.updated",
            Self::EndpointDeleted => "endpoint.deleted",
            Self::CreditLow => "credit.low",
            Self::BatchCompleted => "batch.completed",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WebhookEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|t| t.to_string() == s)
            .copied()
            .ok_or_else(|| format!("Unknown event type: {s}"))
    }
}

/// An immutable event record. Delivery is at-least-once; consumers
/// deduplicate by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: EventId,
    pub ts: DateTime<Utc>,
    pub owner: OwnerId,
    #[serde(rename = "type")]
    pub event_type: WebhookEventType,
    pub data: serde_json::Value,
}

impl WebhookEvent {
    pub fn new(owner: OwnerId, event_type: WebhookEventType, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            owner,
            event_type,
            data,
        }
    }
}
