//! Upstream adapter capability.
//!
//! An [`UpstreamAdapter`] translates the gateway's neutral request into a
//! provider-native call and back. The router only ever talks to this trait;
//! production wires in HTTP adapters per provider, tests use
//! [`mock::MockUpstream`].

pub mod http;
pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::chat::{FinishReason, ModelRequest, StreamDelta, Usage};
use crate::errors::{Error, Result};

/// A provider completion, before it is shaped into a `ModelResponse`.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    /// Provider-side response id, when the provider reports one
    pub raw_id: Option<String>,
}

#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    /// Health probe for a model, bounded by `timeout`.
    async fn available(&self, model_id: &str, timeout: Duration) -> bool;

    /// Dispatch a completion, bounded by `timeout`.
    async fn complete(
        &self,
        model_id: &str,
        req: &ModelRequest,
        timeout: Duration,
    ) -> Result<Completion>;

    /// Open a delta stream. Dropping the receiver cancels the upstream call.
    async fn stream(
        &self,
        model_id: &str,
        req: &ModelRequest,
        timeout: Duration,
    ) -> Result<mpsc::Receiver<Result<StreamDelta>>>;
}

/// Maps providers (the namespace prefix of a model id) to adapters.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn UpstreamAdapter>>,
    /// Serves any provider without a dedicated adapter
    default: Option<Arc<dyn UpstreamAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: impl Into<String>, adapter: Arc<dyn UpstreamAdapter>) {
        self.adapters.insert(provider.into(), adapter);
    }

    pub fn register_default(&mut self, adapter: Arc<dyn UpstreamAdapter>) {
        self.default = Some(adapter);
    }

    /// Resolve the adapter serving `model_id` (`provider/name`).
    pub fn for_model(&self, model_id: &str) -> Result<Arc<dyn UpstreamAdapter>> {
        let provider = model_id.split('/').next().unwrap_or(model_id);
        self.adapters
            .get(provider)
            .or(self.default.as_ref())
            .cloned()
            .ok_or_else(|| Error::internal(format!("no adapter registered for provider {provider}")))
    }
}
