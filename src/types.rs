//! Common type definitions.
//!
//! All entity IDs are UUIDs wrapped in type aliases for better type safety:
//!
//! - [`OwnerId`]: Authenticated caller identity attached by the framing layer
//! - [`EndpointId`]: Custom endpoint preset identifier
//! - [`BatchId`]: Batch identifier
//! - [`WebhookId`]: Webhook subscription identifier
//! - [`EventId`]: Webhook event identifier
//! - [`DeliveryId`]: Webhook delivery attempt identifier

use uuid::Uuid;

pub type OwnerId = Uuid;
pub type EndpointId = Uuid;
pub type BatchId = Uuid;
pub type WebhookId = Uuid;
pub type EventId = Uuid;
pub type DeliveryId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}
