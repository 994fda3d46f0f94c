//! Usage analytics: synchronous recorder, filtered queries, and aggregates.
//!
//! Every routed request appends one [`UsageRecord`]. Cost is computed at
//! record time from the **actual** model's catalog prices, falling back to
//! the configured default rate for models the catalog does not know.
//!
//! Components that only need to write records depend on the narrow
//! [`Recorder`] capability; the concrete store lives here alone.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::ModelCatalog;
use crate::chat::RouteStrategy;
use crate::config::AnalyticsSettings;
use crate::errors::ErrorKind;
use crate::types::{abbrev_uuid, EndpointId, OwnerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelIds {
    pub requested: String,
    pub actual: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

impl TokenCounts {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            total: input + output,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub hit: bool,
    /// TTL of the serving cache entry, in seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

/// Per-request audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub owner: OwnerId,
    pub model: ModelIds,
    pub tokens: TokenCounts,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_strategy: Option<RouteStrategy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<EndpointId>,
    pub cache: CacheInfo,
}

/// Narrow write capability injected into components that record usage.
pub trait Recorder: Send + Sync {
    fn log_usage(&self, record: UsageRecord);
}

/// Filter for usage queries and metric aggregation.
#[derive(Debug, Clone)]
pub struct UsageFilter {
    pub owner: Option<OwnerId>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Match on the actual model that served the request
    pub models: Option<Vec<String>>,
    pub endpoint_id: Option<EndpointId>,
}

impl UsageFilter {
    /// Everything recorded for one owner.
    pub fn for_owner(owner: OwnerId) -> Self {
        Self {
            owner: Some(owner),
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
            models: None,
            endpoint_id: None,
        }
    }

    fn matches(&self, record: &UsageRecord) -> bool {
        if record.ts < self.start || record.ts > self.end {
            return false;
        }
        if let Some(owner) = self.owner {
            if record.owner != owner {
                return false;
            }
        }
        if let Some(models) = &self.models {
            if !models.contains(&record.model.actual) {
                return false;
            }
        }
        if let Some(endpoint_id) = self.endpoint_id {
            if record.endpoint_id != Some(endpoint_id) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Aggregates over a filtered record set.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageMetrics {
    pub total_requests: u64,
    pub successful: u64,
    pub failed: u64,
    pub tokens: TokenCounts,
    pub total_cost_usd: f64,
    pub average_latency_ms: f64,
    pub requests_by_model: BTreeMap<String, u64>,
    /// Records where the actual model differed from the requested one
    pub fallbacks: u64,
    pub cache_hits: u64,
}

pub struct AnalyticsStore {
    records: RwLock<Vec<UsageRecord>>,
    catalog: Arc<ModelCatalog>,
    settings: AnalyticsSettings,
}

impl AnalyticsStore {
    pub fn new(catalog: Arc<ModelCatalog>, settings: AnalyticsSettings) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            catalog,
            settings,
        }
    }

    /// USD cost of a request served by `actual_model`:
    /// `(input * price_in + output * price_out) / 1e6`.
    pub fn cost_for(&self, actual_model: &str, tokens: TokenCounts) -> f64 {
        let (input_price, output_price) = match self.catalog.get(actual_model) {
            Some(model) => (model.input_price, model.output_price),
            None => (
                self.settings.default_input_price,
                self.settings.default_output_price,
            ),
        };
        (tokens.input as f64 * input_price + tokens.output as f64 * output_price) / 1e6
    }

    /// Records matching `filter`, sorted by timestamp descending, paginated.
    pub fn query_usage(&self, filter: &UsageFilter, page: Page) -> Vec<UsageRecord> {
        let mut matching: Vec<UsageRecord> = self
            .records
            .read()
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.ts.cmp(&a.ts));
        matching.into_iter().skip(page.offset).take(page.limit).collect()
    }

    /// Aggregate metrics over the records matching `filter`.
    pub fn metrics(&self, filter: &UsageFilter) -> UsageMetrics {
        let records = self.records.read();
        let mut metrics = UsageMetrics::default();
        let mut latency_total: u64 = 0;

        for record in records.iter().filter(|r| filter.matches(r)) {
            metrics.total_requests += 1;
            if record.success {
                metrics.successful += 1;
            } else {
                metrics.failed += 1;
            }
            metrics.tokens.input += record.tokens.input;
            metrics.tokens.output += record.tokens.output;
            metrics.tokens.total += record.tokens.total;
            metrics.total_cost_usd += record.cost_usd;
            latency_total += record.latency_ms;
            *metrics
                .requests_by_model
                .entry(record.model.actual.clone())
                .or_default() += 1;
            if record.model.requested != record.model.actual {
                metrics.fallbacks += 1;
            }
            if record.cache.hit {
                metrics.cache_hits += 1;
            }
        }

        if metrics.total_requests > 0 {
            metrics.average_latency_ms = latency_total as f64 / metrics.total_requests as f64;
        }
        metrics
    }

    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }
}

impl Recorder for AnalyticsStore {
    fn log_usage(&self, record: UsageRecord) {
        tracing::debug!(
            record_id = %abbrev_uuid(&record.id),
            owner = %abbrev_uuid(&record.owner),
            model = %record.model.actual,
            success = record.success,
            cost_usd = record.cost_usd,
            "Logging usage record"
        );
        self.records.write().push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyticsSettings;

    fn store() -> AnalyticsStore {
        AnalyticsStore::new(Arc::new(ModelCatalog::builtin()), AnalyticsSettings::default())
    }

    fn record(owner: OwnerId, requested: &str, actual: &str, success: bool) -> UsageRecord {
        let tokens = TokenCounts::new(100, 50);
        UsageRecord {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            owner,
            model: ModelIds {
                requested: requested.to_string(),
                actual: actual.to_string(),
            },
            tokens,
            cost_usd: 0.0,
            latency_ms: 40,
            success,
            error_kind: None,
            routing_strategy: None,
            endpoint_id: None,
            cache: CacheInfo::default(),
        }
    }

    #[test]
    fn test_cost_uses_actual_model_prices() {
        let store = store();
        // haiku: 0.25 in / 1.25 out per 1e6 tokens
        let cost = store.cost_for("anthropic/claude-3-haiku", TokenCounts::new(1_000_000, 1_000_000));
        assert!((cost - 1.5).abs() < 1e-9);

        let cost = store.cost_for("anthropic/claude-3-haiku", TokenCounts::new(100, 50));
        let expected = (100.0 * 0.25 + 50.0 * 1.25) / 1e6;
        assert!((cost - expected).abs() < 1e-12);
    }

    #[test]
    fn test_cost_falls_back_to_default_rate() {
        let store = store();
        let cost = store.cost_for("acme/unknown", TokenCounts::new(1_000_000, 500_000));
        // default rate: 1.0 in / 2.0 out
        assert!((cost - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_query_sorted_desc_and_paginated() {
        let store = store();
        let owner = Uuid::new_v4();
        for _ in 0..5 {
            store.log_usage(record(owner, "openai/gpt-4o", "openai/gpt-4o", true));
        }

        let all = store.query_usage(&UsageFilter::for_owner(owner), Page::default());
        assert_eq!(all.len(), 5);
        for pair in all.windows(2) {
            assert!(pair[0].ts >= pair[1].ts);
        }

        let page = store.query_usage(
            &UsageFilter::for_owner(owner),
            Page { offset: 3, limit: 10 },
        );
        assert_eq!(page.len(), 2);
    }

    #[test]
    fn test_query_filters_by_owner_and_model() {
        let store = store();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        store.log_usage(record(alice, "openai/gpt-4o", "openai/gpt-4o", true));
        store.log_usage(record(bob, "openai/gpt-4o", "openai/gpt-4o", true));
        store.log_usage(record(alice, "auto", "anthropic/claude-3-haiku", true));

        assert_eq!(
            store
                .query_usage(&UsageFilter::for_owner(alice), Page::default())
                .len(),
            2
        );

        let mut filter = UsageFilter::for_owner(alice);
        filter.models = Some(vec!["anthropic/claude-3-haiku".to_string()]);
        let haiku_only = store.query_usage(&filter, Page::default());
        assert_eq!(haiku_only.len(), 1);
        assert_eq!(haiku_only[0].model.actual, "anthropic/claude-3-haiku");
    }

    #[test]
    fn test_metrics_aggregates() {
        let store = store();
        let owner = Uuid::new_v4();
        store.log_usage(record(owner, "openai/gpt-4o", "openai/gpt-4o", true));
        store.log_usage(record(owner, "anthropic/claude-3-opus", "openai/gpt-4o", true));
        let mut failed = record(owner, "openai/gpt-4o", "openai/gpt-4o", false);
        failed.error_kind = Some(ErrorKind::UpstreamError);
        store.log_usage(failed);
        let mut hit = record(owner, "openai/gpt-4o", "openai/gpt-4o", true);
        hit.cache.hit = true;
        store.log_usage(hit);

        let metrics = store.metrics(&UsageFilter::for_owner(owner));
        assert_eq!(metrics.total_requests, 4);
        assert_eq!(metrics.successful, 3);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.fallbacks, 1);
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.requests_by_model["openai/gpt-4o"], 4);
        assert_eq!(metrics.tokens.total, 4 * 150);
        assert!((metrics.average_latency_ms - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_empty_filter_window() {
        let store = store();
        let owner = Uuid::new_v4();
        store.log_usage(record(owner, "openai/gpt-4o", "openai/gpt-4o", true));

        let mut filter = UsageFilter::for_owner(owner);
        filter.end = filter.start;
        let metrics = store.metrics(&filter);
        assert_eq!(metrics.total_requests, 0);
        assert_eq!(metrics.average_latency_ms, 0.0);
    }
}
