//! Custom endpoint presets and the request rewriter.
//!
//! A custom endpoint is a named preset (base model, routing strategy,
//! fallbacks, sampling defaults, optional system prompt) owned by a caller.
//! Incoming requests addressed to an endpoint are rewritten by merging the
//! preset underneath the caller's own values; the rewrite is idempotent.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::{ChatMessage, ModelRequest, Role, RouteStrategy};
use crate::errors::{Error, Result};
use crate::types::{EndpointId, OwnerId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomEndpoint {
    pub id: EndpointId,
    pub owner: OwnerId,
    pub name: String,
    pub base_model: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    #[serde(default)]
    pub routing_strategy: RouteStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Prepended as a system message when the caller supplied none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    /// Stored but not enforced by the core; enforcement is deployment policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a new endpoint preset.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointCreate {
    pub name: String,
    pub base_model: String,
    #[serde(default)]
    pub fallbacks: Vec<String>,
    #[serde(default)]
    pub routing_strategy: RouteStrategy,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub frequency_penalty: Option<f64>,
    #[serde(default)]
    pub presence_penalty: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,
}

/// Request to update an endpoint preset. `None` leaves a field unchanged;
/// the double-optional fields can be set to `Some(None)` to clear.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub base_model: Option<String>,
    #[serde(default)]
    pub fallbacks: Option<Vec<String>>,
    #[serde(default)]
    pub routing_strategy: Option<RouteStrategy>,
    #[serde(default)]
    pub temperature: Option<Option<f64>>,
    #[serde(default)]
    pub top_p: Option<Option<f64>>,
    #[serde(default)]
    pub frequency_penalty: Option<Option<f64>>,
    #[serde(default)]
    pub presence_penalty: Option<Option<f64>>,
    #[serde(default)]
    pub max_tokens: Option<Option<u32>>,
    #[serde(default)]
    pub system_prompt: Option<Option<String>>,
    #[serde(default)]
    pub is_public: Option<bool>,
    #[serde(default)]
    pub rate_limit_per_minute: Option<Option<u32>>,
}

/// In-memory endpoint store with per-owner visibility.
///
/// Readers see an endpoint iff they own it or it is public; only the owner
/// may mutate or delete. Inaccessible endpoints surface as `NOT_FOUND` so
/// existence is not leaked across owners.
#[derive(Default)]
pub struct EndpointStore {
    endpoints: RwLock<HashMap<EndpointId, CustomEndpoint>>,
}

impl EndpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, owner: OwnerId, create: EndpointCreate) -> CustomEndpoint {
        let now = Utc::now();
        let endpoint = CustomEndpoint {
            id: Uuid::new_v4(),
            owner,
            name: create.name,
            base_model: create.base_model,
            fallbacks: create.fallbacks,
            routing_strategy: create.routing_strategy,
            temperature: create.temperature,
            top_p: create.top_p,
            frequency_penalty: create.frequency_penalty,
            presence_penalty: create.presence_penalty,
            max_tokens: create.max_tokens,
            system_prompt: create.system_prompt,
            is_public: create.is_public,
            rate_limit_per_minute: create.rate_limit_per_minute,
            created_at: now,
            updated_at: now,
        };
        self.endpoints.write().insert(endpoint.id, endpoint.clone());
        endpoint
    }

    /// Fetch an endpoint visible to `caller`.
    pub fn get(&self, id: EndpointId, caller: OwnerId) -> Result<CustomEndpoint> {
        self.endpoints
            .read()
            .get(&id)
            .filter(|e| e.owner == caller || e.is_public)
            .cloned()
            .ok_or_else(|| Error::not_found("endpoint", id))
    }

    /// Endpoints visible to `caller` (owned + public), newest first.
    pub fn list(&self, caller: OwnerId) -> Vec<CustomEndpoint> {
        let mut visible: Vec<CustomEndpoint> = self
            .endpoints
            .read()
            .values()
            .filter(|e| e.owner == caller || e.is_public)
            .cloned()
            .collect();
        visible.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        visible
    }

    pub fn update(
        &self,
        id: EndpointId,
        caller: OwnerId,
        update: EndpointUpdate,
    ) -> Result<CustomEndpoint> {
        let mut endpoints = self.endpoints.write();
        let endpoint = endpoints
            .get_mut(&id)
            .filter(|e| e.owner == caller)
            .ok_or_else(|| Error::not_found("endpoint", id))?;

        if let Some(name) = update.name {
            endpoint.name = name;
        }
        if let Some(base_model) = update.base_model {
            endpoint.base_model = base_model;
        }
        if let Some(fallbacks) = update.fallbacks {
            endpoint.fallbacks = fallbacks;
        }
        if let Some(strategy) = update.routing_strategy {
            endpoint.routing_strategy = strategy;
        }
        if let Some(temperature) = update.temperature {
            endpoint.temperature = temperature;
        }
        if let Some(top_p) = update.top_p {
            endpoint.top_p = top_p;
        }
        if let Some(frequency_penalty) = update.frequency_penalty {
            endpoint.frequency_penalty = frequency_penalty;
        }
        if let Some(presence_penalty) = update.presence_penalty {
            endpoint.presence_penalty = presence_penalty;
        }
        if let Some(max_tokens) = update.max_tokens {
            endpoint.max_tokens = max_tokens;
        }
        if let Some(system_prompt) = update.system_prompt {
            endpoint.system_prompt = system_prompt;
        }
        if let Some(is_public) = update.is_public {
            endpoint.is_public = is_public;
        }
        if let Some(rate_limit) = update.rate_limit_per_minute {
            endpoint.rate_limit_per_minute = rate_limit;
        }
        endpoint.updated_at = Utc::now();
        Ok(endpoint.clone())
    }

    pub fn delete(&self, id: EndpointId, caller: OwnerId) -> Result<CustomEndpoint> {
        let mut endpoints = self.endpoints.write();
        match endpoints.get(&id) {
            Some(e) if e.owner == caller => Ok(endpoints.remove(&id).expect("checked above")),
            _ => Err(Error::not_found("endpoint", id)),
        }
    }
}

/// Merge an endpoint preset into a request. The caller's values win; the
/// preset fills gaps. Applying the rewrite twice yields the same request.
pub fn rewrite(req: &ModelRequest, endpoint: &CustomEndpoint) -> ModelRequest {
    let mut out = req.clone();

    out.model = endpoint.base_model.clone();
    out.route = Some(endpoint.routing_strategy);

    if out.fallbacks.is_none() && !endpoint.fallbacks.is_empty() {
        out.fallbacks = Some(endpoint.fallbacks.clone());
    }

    if let Some(system_prompt) = &endpoint.system_prompt {
        if !out.has_system_message() {
            out.messages
                .insert(0, ChatMessage::text(Role::System, system_prompt.clone()));
        }
    }

    out.temperature = out.temperature.or(endpoint.temperature);
    out.top_p = out.top_p.or(endpoint.top_p);
    out.frequency_penalty = out.frequency_penalty.or(endpoint.frequency_penalty);
    out.presence_penalty = out.presence_penalty.or(endpoint.presence_penalty);
    out.max_tokens = out.max_tokens.or(endpoint.max_tokens);

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatMessage;

    fn store_with_endpoint(owner: OwnerId, is_public: bool) -> (EndpointStore, CustomEndpoint) {
        let store = EndpointStore::new();
        let endpoint = store.create(
            owner,
            EndpointCreate {
                name: "support-bot".to_string(),
                base_model: "anthropic/claude-3-sonnet".to_string(),
                fallbacks: vec!["openai/gpt-4o".to_string()],
                routing_strategy: RouteStrategy::Fallback,
                temperature: Some(0.3),
                top_p: None,
                frequency_penalty: None,
                presence_penalty: None,
                max_tokens: Some(512),
                system_prompt: Some("You are a support agent.".to_string()),
                is_public,
                rate_limit_per_minute: None,
            },
        );
        (store, endpoint)
    }

    fn user_request() -> ModelRequest {
        ModelRequest::new("auto", vec![ChatMessage::text(Role::User, "Help!")])
    }

    #[test]
    fn test_owner_sees_private_endpoint() {
        let owner = Uuid::new_v4();
        let (store, endpoint) = store_with_endpoint(owner, false);
        assert!(store.get(endpoint.id, owner).is_ok());
    }

    #[test]
    fn test_private_endpoint_hidden_from_others() {
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let (store, endpoint) = store_with_endpoint(owner, false);
        assert!(matches!(
            store.get(endpoint.id, stranger),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_public_endpoint_readable_but_not_mutable_by_others() {
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let (store, endpoint) = store_with_endpoint(owner, true);

        assert!(store.get(endpoint.id, stranger).is_ok());
        assert!(store
            .update(endpoint.id, stranger, EndpointUpdate::default())
            .is_err());
        assert!(store.delete(endpoint.id, stranger).is_err());
        assert!(store.delete(endpoint.id, owner).is_ok());
    }

    #[test]
    fn test_list_includes_owned_and_public() {
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();
        let store = EndpointStore::new();
        let mine = store.create(
            owner,
            EndpointCreate {
                name: "mine".to_string(),
                base_model: "openai/gpt-4o".to_string(),
                fallbacks: vec![],
                routing_strategy: RouteStrategy::Default,
                temperature: None,
                top_p: None,
                frequency_penalty: None,
                presence_penalty: None,
                max_tokens: None,
                system_prompt: None,
                is_public: false,
                rate_limit_per_minute: None,
            },
        );
        let theirs_public = store.create(
            other,
            EndpointCreate {
                name: "theirs".to_string(),
                base_model: "openai/gpt-4o".to_string(),
                fallbacks: vec![],
                routing_strategy: RouteStrategy::Default,
                temperature: None,
                top_p: None,
                frequency_penalty: None,
                presence_penalty: None,
                max_tokens: None,
                system_prompt: None,
                is_public: true,
                rate_limit_per_minute: None,
            },
        );

        let visible: Vec<EndpointId> = store.list(owner).iter().map(|e| e.id).collect();
        assert!(visible.contains(&mine.id));
        assert!(visible.contains(&theirs_public.id));
        assert_eq!(visible.len(), 2);
    }

    #[test]
    fn test_rewrite_applies_preset() {
        let (_, endpoint) = store_with_endpoint(Uuid::new_v4(), false);
        let rewritten = rewrite(&user_request(), &endpoint);

        assert_eq!(rewritten.model, "anthropic/claude-3-sonnet");
        assert_eq!(rewritten.route, Some(RouteStrategy::Fallback));
        assert_eq!(rewritten.fallbacks, Some(vec!["openai/gpt-4o".to_string()]));
        assert_eq!(rewritten.temperature, Some(0.3));
        assert_eq!(rewritten.max_tokens, Some(512));
        assert_eq!(rewritten.messages[0].role, Role::System);
        assert_eq!(
            rewritten.messages[0].text_content(),
            "You are a support agent."
        );
    }

    #[test]
    fn test_rewrite_caller_beats_preset() {
        let (_, endpoint) = store_with_endpoint(Uuid::new_v4(), false);
        let mut req = user_request();
        req.temperature = Some(1.2);
        req.fallbacks = Some(vec!["google/gemini-1.5-pro".to_string()]);
        req.messages
            .insert(0, ChatMessage::text(Role::System, "Be brief."));

        let rewritten = rewrite(&req, &endpoint);
        assert_eq!(rewritten.temperature, Some(1.2));
        assert_eq!(
            rewritten.fallbacks,
            Some(vec!["google/gemini-1.5-pro".to_string()])
        );
        // Caller already has a system message; preset prompt is not prepended
        assert_eq!(
            rewritten
                .messages
                .iter()
                .filter(|m| m.role == Role::System)
                .count(),
            1
        );
        assert_eq!(rewritten.messages[0].text_content(), "Be brief.");
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let (_, endpoint) = store_with_endpoint(Uuid::new_v4(), false);
        let once = rewrite(&user_request(), &endpoint);
        let twice = rewrite(&once, &endpoint);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_update_clears_system_prompt() {
        let owner = Uuid::new_v4();
        let (store, endpoint) = store_with_endpoint(owner, false);
        let updated = store
            .update(
                endpoint.id,
                owner,
                EndpointUpdate {
                    system_prompt: Some(None),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(updated.system_prompt.is_none());
        assert!(updated.updated_at >= endpoint.updated_at);
    }
}
