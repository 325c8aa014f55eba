//! fedibox - the outbox-processing core of a federated, ActivityPub-compatible
//! social protocol.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - POST/GET /outbox/:actor, actor profile, collection reads  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Outbox Pipeline (C5/C6/C7)                │
//! │  - normalize, per-verb side effects, collections             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │           Federation (C3/C4/C8)        │      Data (C1/C2)   │
//! │  - actor resolution, audience,         │  - SQLite store     │
//! │    signed delivery with retry          │  - normalization    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers (outbox submission/read, metrics)
//! - `outbox`: the pipeline, verb handlers, and collection service
//! - `federation`: actor resolution, audience expansion, signed delivery
//! - `data`: SQLite-backed store and JSON-LD-ish normalization
//! - `config`: configuration management
//! - `error`: error types
//! - `events`: process-local outbox event surface
//! - `metrics`: Prometheus instruments

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod events;
pub mod federation;
pub mod metrics;
pub mod outbox;

use std::sync::Arc;
use std::time::Duration;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::AppConfig>,
    pub store: Arc<data::Store>,
    pub actor_resolver: Arc<federation::ActorResolver>,
    pub delivery: Arc<federation::DeliveryEngine>,
    pub events: Arc<events::OutboxEvents>,
    pub collections: Arc<outbox::CollectionService>,
    pub pipeline: Arc<outbox::PipelineContext>,
    pub http_client: reqwest::Client,
}

impl AppState {
    /// Initialize application state.
    ///
    /// # Steps
    /// 1. Connect to the SQLite activity store, running migrations
    /// 2. Build the shared HTTP client used for federation
    /// 3. Construct the actor resolver (C3) and delivery engine (C8)
    /// 4. Construct the collection service (C7) and pipeline context (C5)
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");

        let store = data::Store::connect(&config.database.path).await?;
        let store = Arc::new(store);
        tracing::info!("Activity store connected");

        let http_client = reqwest::Client::builder()
            .user_agent("fedibox/0.1.0")
            .timeout(Duration::from_secs(config.delivery.request_timeout_secs))
            .build()
            .map_err(|e| error::AppError::Internal(e.into()))?;

        let actor_resolver = Arc::new(federation::ActorResolver::new(
            store.clone(),
            http_client.clone(),
            Duration::from_secs(config.actor_cache.ttl_secs),
        ));
        tracing::info!("Actor resolver initialized");

        let delivery = Arc::new(federation::DeliveryEngine::new(
            http_client.clone(),
            store.clone(),
            config.delivery.max_concurrent_deliveries,
            config.delivery.max_retries,
            Duration::from_secs(config.delivery.initial_backoff_secs),
            Duration::from_secs(config.delivery.max_backoff_secs),
        ));
        tracing::info!("Delivery engine initialized");

        let events = Arc::new(events::OutboxEvents::new());
        let collections = Arc::new(outbox::CollectionService::new(store.clone()));

        let pipeline = Arc::new(outbox::PipelineContext {
            store: store.clone(),
            actor_resolver: actor_resolver.clone(),
            delivery: delivery.clone(),
            events: events.clone(),
            base_url: config.server.base_url(),
        });

        tracing::info!("Application state initialized successfully");

        Ok(Self {
            config: Arc::new(config),
            store,
            actor_resolver,
            delivery,
            events,
            collections,
            pipeline,
            http_client,
        })
    }
}
