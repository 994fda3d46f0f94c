//! # switchboard: Request Plane for a Multi-Provider LLM Gateway
//!
//! `switchboard` accepts OpenAI-compatible chat completion requests and
//! dispatches them to multiple upstream language-model providers behind a
//! single wire protocol. Given a logical request it picks the best
//! currently-healthy upstream model subject to feature, cost, latency, and
//! quality constraints; deduplicates work against a response cache;
//! optionally enqueues into a batch; emits lifecycle events to webhook
//! subscribers; and records usage for analytics.
//!
//! ## Overview
//!
//! The crate is the *core* of a gateway deployment: the HTTP surface
//! (routing, JSON framing, SSE transport) and per-provider SDKs live
//! outside it. The framing layer authenticates the caller, parses bodies
//! into [`chat::ModelRequest`], and calls the typed entry points on
//! [`Gateway`]; provider integrations implement the
//! [`upstream::UpstreamAdapter`] capability (a generic OpenAI-compatible
//! HTTP adapter ships in [`upstream::http`]).
//!
//! ### Request flow
//!
//! A chat completion passes through validation, optional custom-endpoint
//! rewriting, the response cache, and the router, which probes candidate
//! models for health and dispatches to the first healthy one eligible for
//! the request's required features. Responses are cached, usage is recorded
//! synchronously, and lifecycle events fan out to webhook subscribers with
//! retry and backoff. Batches run the same pipeline for each child under a
//! bounded-concurrency scheduler.
//!
//! ### Core components
//!
//! - [`catalog`]: read-only model catalog (features, pricing, rank tables)
//! - [`chat`]: OpenAI-compatible wire types and the request validator
//! - [`endpoints`]: named presets merged into incoming requests
//! - [`cache`]: fingerprint-keyed TTL response cache with a background sweeper
//! - [`router`]: strategy-driven selection with feature gating and health probes
//! - [`batch`]: priority queue plus bounded-concurrency batch scheduler
//! - [`webhooks`]: per-owner subscriptions, HMAC-signed at-least-once delivery
//! - [`analytics`]: per-request usage records, queries, and aggregates
//! - [`gateway`]: the wiring; every store is dependency-injected, none global
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use switchboard::chat::{ChatMessage, ModelRequest, Role};
//! use switchboard::upstream::http::OpenAiCompatAdapter;
//! use switchboard::upstream::AdapterRegistry;
//! use switchboard::{Config, Gateway};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! switchboard::telemetry::init_telemetry()?;
//!
//! let mut adapters = AdapterRegistry::new();
//! adapters.register(
//!     "openai",
//!     Arc::new(OpenAiCompatAdapter::new(
//!         "https://api.openai.com".parse()?,
//!         std::env::var("OPENAI_API_KEY").ok(),
//!     )),
//! );
//!
//! let gateway = Gateway::new(Config::default(), adapters);
//! let shutdown = CancellationToken::new();
//! let background = gateway.spawn_background(&shutdown);
//!
//! let owner = uuid::Uuid::new_v4();
//! let request = ModelRequest::new(
//!     "openai/gpt-4o",
//!     vec![ChatMessage::text(Role::User, "Hello!")],
//! );
//! let response = gateway.chat_complete(owner, request, None).await?;
//! println!("{}", response.routed_through);
//!
//! shutdown.cancel();
//! for task in background {
//!     task.await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod analytics;
pub mod batch;
pub mod cache;
pub mod catalog;
pub mod chat;
pub mod config;
pub mod endpoints;
pub mod errors;
pub mod gateway;
pub mod router;
pub mod telemetry;
pub mod types;
pub mod upstream;
pub mod webhooks;

pub use config::Config;
pub use errors::{Error, ErrorKind, Result};
pub use gateway::{BatchIntake, ChatStream, Gateway};
pub use types::{BatchId, DeliveryId, EndpointId, EventId, OwnerId, WebhookId};
