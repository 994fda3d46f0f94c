//! The gateway: typed entry points wiring validation, endpoint rewriting,
//! caching, routing, analytics, and webhook events into one request plane.
//!
//! Per-request flow:
//!
//! ```text
//!  Request -> Validate -> EndpointRewrite -> Cache.get --hit--> Response
//!                                         |
//!                                         v miss
//!                                      Router -> UpstreamAdapter -> Response
//!                                         |               |
//!                                         v               v
//!                                      Analytics       Cache.set
//!                                         |
//!                                         v
//!                                    Webhook events
//! ```
//!
//! Every store is constructed here and injected; none of them is a global.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::analytics::{
    AnalyticsStore, CacheInfo, ModelIds, Page, Recorder, TokenCounts, UsageFilter, UsageMetrics,
    UsageRecord,
};
use crate::batch::{Batch, BatchOptions, BatchProcessor, BatchStore, Dispatch, InvalidChild};
use crate::cache::{InvalidateFilter, ResponseCache};
use crate::catalog::{ModelCatalog, AUTO_MODEL};
use crate::chat::{self, ModelRequest, ModelResponse, StreamDelta, Usage};
use crate::config::Config;
use crate::endpoints::{self, CustomEndpoint, EndpointCreate, EndpointStore, EndpointUpdate};
use crate::errors::{Error, ErrorKind, Result};
use crate::router::Router;
use crate::types::{abbrev_uuid, BatchId, DeliveryId, EndpointId, OwnerId, WebhookId};
use crate::upstream::AdapterRegistry;
use crate::webhooks::{
    Webhook, WebhookCreate, WebhookDelivery, WebhookDispatcher, WebhookEvent, WebhookEventType,
    WebhookStore, WebhookUpdate,
};

/// Result of batch intake: the accepted batch plus the children that failed
/// validation (reported, not fatal, unless every child is invalid).
#[derive(Debug)]
pub struct BatchIntake {
    pub batch: Batch,
    pub invalid: Vec<InvalidChild>,
}

/// An open chat stream handed back to the framing layer.
pub struct ChatStream {
    /// The model actually serving the stream
    pub model: String,
    pub deltas: mpsc::Receiver<Result<StreamDelta>>,
}

pub struct Gateway {
    config: Config,
    catalog: Arc<ModelCatalog>,
    cache: Arc<ResponseCache>,
    router: Router,
    endpoints: Arc<EndpointStore>,
    batches: Arc<BatchStore>,
    webhooks: Arc<WebhookDispatcher>,
    analytics: Arc<AnalyticsStore>,
}

impl Gateway {
    pub fn new(config: Config, adapters: AdapterRegistry) -> Arc<Self> {
        let catalog = Arc::new(config.build_catalog());
        let cache = Arc::new(ResponseCache::new(config.cache.clone()));
        let router = Router::new(catalog.clone(), adapters, config.router.clone());
        let webhook_store = Arc::new(WebhookStore::new(config.webhooks.default_retries));
        let webhooks = Arc::new(WebhookDispatcher::new(webhook_store, config.webhooks.clone()));
        let analytics = Arc::new(AnalyticsStore::new(catalog.clone(), config.analytics.clone()));

        Arc::new(Self {
            config,
            catalog,
            cache,
            router,
            endpoints: Arc::new(EndpointStore::new()),
            batches: Arc::new(BatchStore::new()),
            webhooks,
            analytics,
        })
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn webhooks(&self) -> &Arc<WebhookDispatcher> {
        &self.webhooks
    }

    pub fn analytics(&self) -> &Arc<AnalyticsStore> {
        &self.analytics
    }

    /// Spawn the background services (cache sweeper, batch scheduler). They
    /// run until `shutdown` fires.
    pub fn spawn_background(self: &Arc<Self>, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
        info!("Starting gateway background services");
        let sweeper = self.cache.spawn_sweeper(shutdown.clone());
        let processor = Arc::new(BatchProcessor::new(
            self.batches.clone(),
            self.clone(),
            self.webhooks.clone(),
            self.config.batch.clone(),
        ));
        let scheduler = processor.spawn(shutdown.clone());
        vec![sweeper, scheduler]
    }

    // --- Chat ---

    /// Serve a chat completion through the full pipeline.
    pub async fn chat_complete(
        &self,
        owner: OwnerId,
        req: ModelRequest,
        endpoint_id: Option<EndpointId>,
    ) -> Result<ModelResponse> {
        self.chat_complete_cancellable(owner, req, endpoint_id, CancellationToken::new())
            .await
    }

    /// [`chat_complete`](Self::chat_complete) with caller-driven
    /// cancellation. Cancelled work aborts pending probes and dispatches and
    /// records no cache, analytics, or webhook side effects except a
    /// `request.failed` event.
    #[instrument(skip(self, req, cancel), fields(owner = %abbrev_uuid(&owner), requested = %req.model))]
    pub async fn chat_complete_cancellable(
        &self,
        owner: OwnerId,
        req: ModelRequest,
        endpoint_id: Option<EndpointId>,
        cancel: CancellationToken,
    ) -> Result<ModelResponse> {
        let started = Instant::now();

        let req = match endpoint_id {
            Some(id) => {
                let endpoint = self.endpoints.get(id, owner)?;
                endpoints::rewrite(&req, &endpoint)
            }
            None => req,
        };
        chat::validate(&req)?;

        self.webhooks
            .trigger_event(
                owner,
                WebhookEventType::RequestCreated,
                json!({"model": req.model, "stream": req.stream, "endpoint_id": endpoint_id}),
            )
            .await;

        if let Some(entry) = self.cache.get(&req) {
            let latency_ms = started.elapsed().as_millis() as u64;
            info!(model = %entry.model_id, "Cache hit");
            self.analytics.log_usage(UsageRecord {
                id: Uuid::new_v4(),
                ts: chrono::Utc::now(),
                owner,
                model: ModelIds {
                    requested: req.model.clone(),
                    actual: entry.model_id.clone(),
                },
                tokens: token_counts(entry.token_usage),
                cost_usd: 0.0,
                latency_ms,
                success: true,
                error_kind: None,
                routing_strategy: req.route,
                endpoint_id,
                cache: CacheInfo {
                    hit: true,
                    ttl_secs: Some(self.cache.ttl_secs()),
                },
            });
            self.webhooks
                .trigger_event(
                    owner,
                    WebhookEventType::RequestCompleted,
                    json!({"model": entry.model_id, "cache_hit": true}),
                )
                .await;
            return Ok(entry.response);
        }

        match self.router.dispatch(&req, &cancel).await {
            Ok(routed) => {
                let response = ModelResponse::assistant(
                    routed.model_id.clone(),
                    routed.completion.content,
                    routed.completion.finish_reason,
                    routed.completion.usage,
                );
                self.cache.set(&req, &response, routed.completion.usage);

                let latency_ms = started.elapsed().as_millis() as u64;
                let tokens = token_counts(routed.completion.usage);
                self.analytics.log_usage(UsageRecord {
                    id: Uuid::new_v4(),
                    ts: chrono::Utc::now(),
                    owner,
                    model: ModelIds {
                        requested: req.model.clone(),
                        actual: routed.model_id.clone(),
                    },
                    tokens,
                    cost_usd: self.analytics.cost_for(&routed.model_id, tokens),
                    latency_ms,
                    success: true,
                    error_kind: None,
                    routing_strategy: req.route,
                    endpoint_id,
                    cache: CacheInfo::default(),
                });

                if routed.model_id != req.model && req.model != AUTO_MODEL {
                    self.webhooks
                        .trigger_event(
                            owner,
                            WebhookEventType::ModelFallback,
                            json!({"requested": req.model, "actual": routed.model_id}),
                        )
                        .await;
                }
                self.webhooks
                    .trigger_event(
                        owner,
                        WebhookEventType::RequestCompleted,
                        json!({"model": routed.model_id, "cache_hit": false}),
                    )
                    .await;

                Ok(response)
            }
            Err(e) => Err(self.handle_dispatch_failure(owner, &req, endpoint_id, started, e).await),
        }
    }

    /// Failure tail of the pipeline. Cancelled work only emits
    /// `request.failed`; everything else is also recorded in analytics, and
    /// exhaustion/invariant failures emit their dedicated events first.
    async fn handle_dispatch_failure(
        &self,
        owner: OwnerId,
        req: &ModelRequest,
        endpoint_id: Option<EndpointId>,
        started: Instant,
        error: Error,
    ) -> Error {
        let kind = error.kind();

        if kind != ErrorKind::Cancelled {
            self.analytics.log_usage(UsageRecord {
                id: Uuid::new_v4(),
                ts: chrono::Utc::now(),
                owner,
                model: ModelIds {
                    requested: req.model.clone(),
                    actual: req.model.clone(),
                },
                tokens: TokenCounts::default(),
                cost_usd: 0.0,
                latency_ms: started.elapsed().as_millis() as u64,
                success: false,
                error_kind: Some(kind),
                routing_strategy: req.route,
                endpoint_id,
                cache: CacheInfo::default(),
            });

            match kind {
                ErrorKind::NoModelAvailable => {
                    self.webhooks
                        .trigger_event(
                            owner,
                            WebhookEventType::ModelUnavailable,
                            json!({"requested": req.model}),
                        )
                        .await;
                }
                ErrorKind::Internal => {
                    self.webhooks
                        .trigger_event(
                            owner,
                            WebhookEventType::Error,
                            json!({"message": error.to_string()}),
                        )
                        .await;
                }
                _ => {}
            }
        }

        self.webhooks
            .trigger_event(
                owner,
                WebhookEventType::RequestFailed,
                json!({"model": req.model, "error_kind": kind}),
            )
            .await;

        error
    }

    /// Open a streamed chat completion. Streaming bypasses the cache in both
    /// directions; usage is recorded when the stream finishes (with whatever
    /// token counts the upstream reported on its final chunk).
    #[instrument(skip(self, req), fields(owner = %abbrev_uuid(&owner), requested = %req.model))]
    pub async fn chat_stream(
        &self,
        owner: OwnerId,
        req: ModelRequest,
        endpoint_id: Option<EndpointId>,
    ) -> Result<ChatStream> {
        let started = Instant::now();
        let cancel = CancellationToken::new();

        let mut req = match endpoint_id {
            Some(id) => {
                let endpoint = self.endpoints.get(id, owner)?;
                endpoints::rewrite(&req, &endpoint)
            }
            None => req,
        };
        req.stream = true;
        chat::validate(&req)?;

        self.webhooks
            .trigger_event(
                owner,
                WebhookEventType::RequestCreated,
                json!({"model": req.model, "stream": true, "endpoint_id": endpoint_id}),
            )
            .await;

        let routed = match self.router.dispatch_stream(&req, &cancel).await {
            Ok(routed) => routed,
            Err(e) => {
                return Err(self.handle_dispatch_failure(owner, &req, endpoint_id, started, e).await);
            }
        };

        if routed.model_id != req.model && req.model != AUTO_MODEL {
            self.webhooks
                .trigger_event(
                    owner,
                    WebhookEventType::ModelFallback,
                    json!({"requested": req.model, "actual": routed.model_id}),
                )
                .await;
        }

        let (tx, rx) = mpsc::channel(32);
        let analytics = self.analytics.clone();
        let webhooks = self.webhooks.clone();
        let requested = req.model.clone();
        let actual = routed.model_id.clone();
        let route = req.route;
        let mut upstream = routed.deltas;

        tokio::spawn(async move {
            let mut usage = Usage::default();
            let mut failed: Option<ErrorKind> = None;

            while let Some(delta) = upstream.recv().await {
                match &delta {
                    Ok(d) => {
                        if let Some(u) = d.usage {
                            usage = u;
                        }
                    }
                    Err(e) => failed = Some(e.kind()),
                }
                let errored = delta.is_err();
                if tx.send(delta).await.is_err() {
                    // Receiver dropped: the caller cancelled. No analytics,
                    // just the failure event.
                    webhooks
                        .trigger_event(
                            owner,
                            WebhookEventType::RequestFailed,
                            json!({"model": actual, "error_kind": ErrorKind::Cancelled}),
                        )
                        .await;
                    return;
                }
                if errored {
                    break;
                }
            }

            let tokens = token_counts(usage);
            analytics.log_usage(UsageRecord {
                id: Uuid::new_v4(),
                ts: chrono::Utc::now(),
                owner,
                model: ModelIds {
                    requested: requested.clone(),
                    actual: actual.clone(),
                },
                tokens,
                cost_usd: analytics.cost_for(&actual, tokens),
                latency_ms: started.elapsed().as_millis() as u64,
                success: failed.is_none(),
                error_kind: failed,
                routing_strategy: route,
                endpoint_id,
                cache: CacheInfo::default(),
            });
            let (event_type, payload) = match failed {
                None => (
                    WebhookEventType::RequestCompleted,
                    json!({"model": actual, "cache_hit": false, "stream": true}),
                ),
                Some(kind) => (
                    WebhookEventType::RequestFailed,
                    json!({"model": actual, "error_kind": kind}),
                ),
            };
            webhooks.trigger_event(owner, event_type, payload).await;
        });

        Ok(ChatStream {
            model: routed.model_id,
            deltas: rx,
        })
    }

    // --- Batches ---

    /// Validate children independently and create a pending batch from the
    /// valid ones. Fails only when every child is invalid.
    pub async fn create_batch(
        &self,
        owner: OwnerId,
        children: Vec<ModelRequest>,
        options: BatchOptions,
    ) -> Result<BatchIntake> {
        let mut valid = Vec::new();
        let mut invalid = Vec::new();
        for (index, child) in children.into_iter().enumerate() {
            match chat::validate(&child) {
                Ok(()) => valid.push(child),
                Err(e) => invalid.push(InvalidChild {
                    index,
                    error: e.to_string(),
                }),
            }
        }
        if valid.is_empty() {
            return Err(Error::invalid("batch contains no valid requests"));
        }

        let batch = self.batches.create(owner, valid, options);
        info!(batch_id = %abbrev_uuid(&batch.id), accepted = batch.request_count, rejected = invalid.len(), "Batch created");
        Ok(BatchIntake { batch, invalid })
    }

    pub fn get_batch(&self, id: BatchId, owner: OwnerId) -> Result<Batch> {
        self.batches.get(id, owner)
    }

    pub fn list_batches(&self, owner: OwnerId) -> Vec<Batch> {
        self.batches.list(owner)
    }

    pub fn cancel_batch(&self, id: BatchId, owner: OwnerId) -> Result<Batch> {
        self.batches.cancel(id, owner)
    }

    // --- Custom endpoints ---

    pub async fn create_endpoint(&self, owner: OwnerId, create: EndpointCreate) -> CustomEndpoint {
        let endpoint = self.endpoints.create(owner, create);
        self.webhooks
            .trigger_event(
                owner,
                WebhookEventType::EndpointCreated,
                json!({"endpoint_id": endpoint.id, "name": endpoint.name}),
            )
            .await;
        endpoint
    }

    pub fn get_endpoint(&self, id: EndpointId, owner: OwnerId) -> Result<CustomEndpoint> {
        self.endpoints.get(id, owner)
    }

    pub fn list_endpoints(&self, owner: OwnerId) -> Vec<CustomEndpoint> {
        self.endpoints.list(owner)
    }

    pub async fn update_endpoint(
        &self,
        id: EndpointId,
        owner: OwnerId,
        update: EndpointUpdate,
    ) -> Result<CustomEndpoint> {
        let endpoint = self.endpoints.update(id, owner, update)?;
        self.webhooks
            .trigger_event(
                owner,
                WebhookEventType::EndpointUpdated,
                json!({"endpoint_id": endpoint.id, "name": endpoint.name}),
            )
            .await;
        Ok(endpoint)
    }

    pub async fn delete_endpoint(&self, id: EndpointId, owner: OwnerId) -> Result<CustomEndpoint> {
        let endpoint = self.endpoints.delete(id, owner)?;
        self.webhooks
            .trigger_event(
                owner,
                WebhookEventType::EndpointDeleted,
                json!({"endpoint_id": endpoint.id, "name": endpoint.name}),
            )
            .await;
        Ok(endpoint)
    }

    // --- Webhooks ---

    pub fn create_webhook(&self, owner: OwnerId, create: WebhookCreate) -> Result<Webhook> {
        self.webhooks.store().create(owner, create)
    }

    pub fn get_webhook(&self, id: WebhookId, owner: OwnerId) -> Result<Webhook> {
        self.webhooks.store().get(id, owner)
    }

    pub fn list_webhooks(&self, owner: OwnerId) -> Vec<Webhook> {
        self.webhooks.store().list(owner)
    }

    pub fn update_webhook(&self, id: WebhookId, owner: OwnerId, update: WebhookUpdate) -> Result<Webhook> {
        self.webhooks.store().update(id, owner, update)
    }

    pub fn delete_webhook(&self, id: WebhookId, owner: OwnerId) -> Result<Webhook> {
        self.webhooks.store().delete(id, owner)
    }

    pub fn list_events(&self, owner: OwnerId) -> Vec<WebhookEvent> {
        self.webhooks.events(owner)
    }

    pub fn list_deliveries(&self, webhook_id: WebhookId, owner: OwnerId) -> Result<Vec<WebhookDelivery>> {
        self.webhooks.deliveries(webhook_id, owner)
    }

    pub async fn retry_delivery(&self, delivery_id: DeliveryId, owner: OwnerId) -> Result<WebhookDelivery> {
        self.webhooks.retry_delivery(delivery_id, owner).await
    }

    // --- Analytics & cache administration ---

    /// Query usage records, always scoped to the calling owner.
    pub fn query_usage(&self, owner: OwnerId, mut filter: UsageFilter, page: Page) -> Vec<UsageRecord> {
        filter.owner = Some(owner);
        self.analytics.query_usage(&filter, page)
    }

    /// Aggregate metrics, always scoped to the calling owner.
    pub fn get_metrics(&self, owner: OwnerId, mut filter: UsageFilter) -> UsageMetrics {
        filter.owner = Some(owner);
        self.analytics.metrics(&filter)
    }

    /// Remove cached responses matching `filter`; an empty filter clears the
    /// whole cache. Returns the number of entries removed.
    pub fn invalidate_cache(&self, filter: &InvalidateFilter) -> usize {
        self.cache.invalidate(filter)
    }
}

fn token_counts(usage: Usage) -> TokenCounts {
    TokenCounts::new(usage.prompt_tokens as u64, usage.completion_tokens as u64)
}

#[async_trait::async_trait]
impl Dispatch for Gateway {
    async fn dispatch(&self, owner: OwnerId, req: ModelRequest) -> Result<ModelResponse> {
        self.chat_complete(owner, req, None).await
    }
}
