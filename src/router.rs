//! Strategy-driven model selection with feature gating and health probing.
//!
//! Given a validated request the router assembles an ordered candidate list
//! (per the requested strategy), probes each candidate's adapter, and
//! dispatches to the first healthy one. Per-candidate upstream timeouts and
//! errors are swallowed so the next candidate gets a try; only exhaustion
//! surfaces, as `NO_MODEL_AVAILABLE`.
//!
//! There is no sticky blacklist: a failed probe removes the model from the
//! candidate list for the current request only. Deployments wanting
//! last-N-outcome scoring or circuit breaking wrap the adapter.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{quality_rank, speed_rank, ModelCatalog, ModelFeatures, ModelInfo, AUTO_MODEL};
use crate::chat::{ModelRequest, RouteStrategy, StreamDelta};
use crate::config::RouterSettings;
use crate::errors::{Error, Result};
use crate::upstream::{AdapterRegistry, Completion, UpstreamAdapter};

/// Feature set a request requires of its serving model.
pub fn required_features(req: &ModelRequest) -> ModelFeatures {
    ModelFeatures {
        vision: req.has_image_parts(),
        function_calling: req.wants_functions(),
        tool_use: req.wants_tools(),
        json_mode: req.wants_json_mode(),
    }
}

/// A completion together with the model that actually produced it.
#[derive(Debug)]
pub struct RoutedCompletion {
    pub model_id: String,
    pub completion: Completion,
}

/// An open delta stream together with the model serving it.
pub struct RoutedStream {
    pub model_id: String,
    pub deltas: mpsc::Receiver<Result<StreamDelta>>,
}

pub struct Router {
    catalog: Arc<ModelCatalog>,
    adapters: AdapterRegistry,
    settings: RouterSettings,
}

impl Router {
    pub fn new(catalog: Arc<ModelCatalog>, adapters: AdapterRegistry, settings: RouterSettings) -> Self {
        Self {
            catalog,
            adapters,
            settings,
        }
    }

    /// Ordered candidate list for a request, already feature-gated.
    ///
    /// Deterministic: sorted strategies break ties by preferring a provider
    /// different from the previously placed candidate, then stable id order.
    pub fn candidates(&self, req: &ModelRequest) -> Vec<String> {
        let required = required_features(req);
        let eligible: Vec<&ModelInfo> = self.catalog.eligible(required).collect();
        let is_eligible = |id: &str| {
            self.catalog
                .get(id)
                .is_some_and(|m| m.features.superset_of(&required))
        };

        let mut ordered: Vec<String> = Vec::new();
        match req.strategy() {
            RouteStrategy::Default | RouteStrategy::Fallback => {
                if req.model != AUTO_MODEL && is_eligible(&req.model) {
                    ordered.push(req.model.clone());
                }
                let preset: Vec<String> = match req.strategy() {
                    RouteStrategy::Default => self
                        .catalog
                        .get(&req.model)
                        .map(|m| m.fallbacks.clone())
                        .unwrap_or_default(),
                    _ => req.fallbacks.clone().unwrap_or_default(),
                };
                ordered.extend(preset.into_iter().filter(|id| is_eligible(id)));

                let last_provider = ordered
                    .last()
                    .and_then(|id| self.catalog.get(id))
                    .map(|m| m.provider.clone());
                ordered.extend(diversify(eligible, |_| 0u8, last_provider));
            }
            RouteStrategy::LowestCost => {
                ordered = diversify(eligible, |m| m.combined_price(), None);
            }
            RouteStrategy::Fastest => {
                ordered = diversify(eligible, |m| speed_rank(&m.id), None);
            }
            RouteStrategy::HighestQuality => {
                ordered = diversify(eligible, |m| quality_rank(&m.id), None);
            }
        }

        dedupe(ordered)
    }

    /// Select and dispatch, trying candidates in order until one answers.
    #[instrument(skip(self, req, cancel), fields(requested = %req.model, strategy = ?req.strategy()))]
    pub async fn dispatch(
        &self,
        req: &ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<RoutedCompletion> {
        let candidates = self.candidates(req);
        debug!(count = candidates.len(), "Assembled routing candidates");

        for model_id in &candidates {
            let Some(adapter) = self.healthy_adapter(model_id, cancel).await? else {
                continue;
            };
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                outcome = adapter.complete(model_id, req, self.settings.timeout) => outcome,
            };
            match outcome {
                Ok(completion) => {
                    info!(model = %model_id, "Dispatched to upstream");
                    return Ok(RoutedCompletion {
                        model_id: model_id.clone(),
                        completion,
                    });
                }
                Err(e) if e.is_candidate_retriable() => {
                    warn!(model = %model_id, error = %e, "Candidate dispatch failed, trying next");
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::NoModelAvailable {
            requested: req.model.clone(),
        })
    }

    /// Streaming variant of [`dispatch`](Self::dispatch). Fallback only
    /// happens before the first delta; a stream that dies mid-flight
    /// surfaces the error to the consumer.
    #[instrument(skip(self, req, cancel), fields(requested = %req.model))]
    pub async fn dispatch_stream(
        &self,
        req: &ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<RoutedStream> {
        let candidates = self.candidates(req);

        for model_id in &candidates {
            let Some(adapter) = self.healthy_adapter(model_id, cancel).await? else {
                continue;
            };
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                outcome = adapter.stream(model_id, req, self.settings.timeout) => outcome,
            };
            match outcome {
                Ok(deltas) => {
                    info!(model = %model_id, "Opened upstream stream");
                    return Ok(RoutedStream {
                        model_id: model_id.clone(),
                        deltas,
                    });
                }
                Err(e) if e.is_candidate_retriable() => {
                    warn!(model = %model_id, error = %e, "Candidate stream failed, trying next");
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::NoModelAvailable {
            requested: req.model.clone(),
        })
    }

    /// Resolve a candidate's adapter and probe its health. `Ok(None)` means
    /// skip this candidate.
    async fn healthy_adapter(
        &self,
        model_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Arc<dyn UpstreamAdapter>>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Ok(adapter) = self.adapters.for_model(model_id) else {
            debug!(model = %model_id, "No adapter for candidate, skipping");
            return Ok(None);
        };
        if self.probe(adapter.as_ref(), model_id, cancel).await? {
            Ok(Some(adapter))
        } else {
            debug!(model = %model_id, "Candidate failed health probe, trying next");
            Ok(None)
        }
    }

    /// Probe a model's availability with bounded attempts and exponential
    /// backoff plus a small jitter.
    async fn probe(
        &self,
        adapter: &dyn UpstreamAdapter,
        model_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let attempts = self.settings.probe_retries + 1;
        for attempt in 1..=attempts {
            let available = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                probed = tokio::time::timeout(
                    self.settings.timeout,
                    adapter.available(model_id, self.settings.timeout),
                ) => probed.unwrap_or(false),
            };
            if available {
                return Ok(true);
            }
            if attempt < attempts {
                let backoff = self.probe_backoff(attempt);
                debug!(model = %model_id, attempt, backoff_ms = backoff.as_millis() as u64, "Probe failed, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
        Ok(false)
    }

    fn probe_backoff(&self, attempt: u32) -> Duration {
        let base = self.settings.probe_backoff;
        let exponential = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let jitter_cap = (base.as_millis() as u64 / 4).max(1);
        let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
        exponential + Duration::from_millis(jitter)
    }
}

/// Sort models by `key` and emit ids, preferring a provider different from
/// the previously emitted candidate among equal keys.
fn diversify<K, F>(models: Vec<&ModelInfo>, key: F, mut last_provider: Option<String>) -> Vec<String>
where
    K: PartialOrd + PartialEq,
    F: Fn(&ModelInfo) -> K,
{
    let mut sorted = models;
    // Stable sort keeps the catalog's id order within equal keys
    sorted.sort_by(|a, b| key(a).partial_cmp(&key(b)).unwrap_or(Ordering::Equal));

    let mut out = Vec::with_capacity(sorted.len());
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i + 1;
        while j < sorted.len() && key(sorted[j]) == key(sorted[i]) {
            j += 1;
        }
        let mut group: Vec<&ModelInfo> = sorted[i..j].to_vec();
        while !group.is_empty() {
            let pick = group
                .iter()
                .position(|m| last_provider.as_deref() != Some(m.provider.as_str()))
                .unwrap_or(0);
            let model = group.remove(pick);
            last_provider = Some(model.provider.clone());
            out.push(model.id.clone());
        }
        i = j;
    }
    out
}

fn dedupe(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}
