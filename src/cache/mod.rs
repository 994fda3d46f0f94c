//! Response cache keyed by request fingerprints.
//!
//! The cache stores one answer per fingerprint with a TTL. Expired entries
//! are removed on access, and a background sweeper bounds memory by reaping
//! the rest at a fixed cadence. Concurrent misses may race; the last writer
//! wins, which is fine because cached responses are interchangeable.
//! Streaming requests bypass the cache entirely.

pub mod fingerprint;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chat::{ModelRequest, ModelResponse, Usage};
use crate::config::CacheSettings;

pub use fingerprint::{canonical_json, CacheKeyStrategy, Fingerprint, KeyPolicy};

/// A cached response with its expiry bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The model that actually produced the response
    pub model_id: String,
    pub response: ModelResponse,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token_usage: Usage,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Selector for [`ResponseCache::invalidate`]. An empty filter matches every
/// entry.
#[derive(Debug, Clone, Default)]
pub struct InvalidateFilter {
    /// Remove entries whose stored model id equals this
    pub model: Option<String>,
}

pub struct ResponseCache {
    entries: DashMap<Fingerprint, CacheEntry>,
    settings: CacheSettings,
}

impl ResponseCache {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            entries: DashMap::new(),
            settings,
        }
    }

    fn key_policy(&self) -> KeyPolicy {
        KeyPolicy {
            strategy: self.settings.key_strategy,
            ignore_temperature: self.settings.ignore_temperature,
            ignore_top_p: self.settings.ignore_top_p,
        }
    }

    /// TTL applied to new entries, in whole seconds.
    pub fn ttl_secs(&self) -> u64 {
        self.settings.ttl.as_secs()
    }

    /// Look up the cached entry for a request.
    ///
    /// Expired entries are removed on access and never returned. Streaming
    /// requests always miss.
    pub fn get(&self, req: &ModelRequest) -> Option<CacheEntry> {
        if !self.settings.enabled || req.stream {
            return None;
        }
        let key = fingerprint::fingerprint(req, &self.key_policy());
        let now = Utc::now();

        if let Some(entry) = self.entries.get(&key) {
            if !entry.is_expired(now) {
                return Some(entry.clone());
            }
        }
        // Expired (or concurrently evicted): drop it on the way out
        self.entries.remove_if(&key, |_, entry| entry.is_expired(now));
        None
    }

    /// Store a response. No-op when caching is disabled or the request
    /// streams.
    pub fn set(&self, req: &ModelRequest, response: &ModelResponse, token_usage: Usage) {
        if !self.settings.enabled || req.stream {
            return;
        }
        let key = fingerprint::fingerprint(req, &self.key_policy());
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.settings.ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000));
        self.entries.insert(
            key,
            CacheEntry {
                model_id: response.routed_through.clone(),
                response: response.clone(),
                created_at: now,
                expires_at: now + ttl,
                token_usage,
            },
        );
    }

    /// Remove entries matching `filter`, returning how many were removed.
    /// An empty filter clears the whole cache.
    pub fn invalidate(&self, filter: &InvalidateFilter) -> usize {
        match &filter.model {
            None => {
                let removed = self.entries.len();
                self.entries.clear();
                removed
            }
            Some(model) => {
                let before = self.entries.len();
                self.entries.retain(|_, entry| entry.model_id != *model);
                before - self.entries.len()
            }
        }
    }

    /// Drop every expired entry, returning how many were reaped.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Spawn the background sweeper. It reaps expired entries every
    /// `sweep_interval` until the shutdown token fires; each pass only holds
    /// per-shard map locks, so foreground gets and sets are never blocked
    /// for longer than a single map operation.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let interval = cache.settings.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so the cadence starts
            // one interval after startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Cache sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reaped = cache.sweep();
                        if reaped > 0 {
                            debug!(reaped, remaining = cache.len(), "Cache sweep reaped expired entries");
                        }
                    }
                }
            }
        })
    }
}
