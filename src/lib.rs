//! Multi-tenant LLM gateway.
//!
//! Accepts client requests on an OpenAI-style `/v1/chat/completions`
//! surface and an Anthropic-style `/v1/messages` surface and forwards them
//! to OpenAI-family, Anthropic-family, or Google Gemini upstreams, unifying
//! authentication, quota, and usage accounting while preserving SSE
//! streaming semantics end-to-end.
//!
//! # Architecture
//!
//! - [`core`]: configuration snapshots, database access, errors, usage
//!   accounting
//! - [`api`]: HTTP handlers, ingress/egress translators, the fast-path
//!   reverse proxy, the usage snooper
//! - [`provider`]: the canonical message model and the upstream provider
//!   clients
//!
//! A request either takes the **fast path** (ingress and upstream speak the
//! same protocol: byte-level relay with header rewrite and inline token
//! scraping) or the **slow path** (full parse into the canonical shape,
//! provider-specific marshalling, and SSE re-synthesis toward the client).

pub mod api;
pub mod core;
pub mod provider;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use api::AppState;

/// Build the gateway router with all core endpoints.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(api::chat_completions))
        .route("/v1/messages", post(api::messages))
        .route("/v1/models", get(api::list_models))
        .with_state(state)
        .route("/api/event_logging/batch", post(api::telemetry_sink))
        .route("/health", get(api::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
