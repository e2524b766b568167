//! HTTP handlers for the gateway's ingress surface.
//!
//! Both chat surfaces run the same pipeline: authenticate, peek the body for
//! the model name, route to a service, select an upstream key, then either
//! relay bytes on the fast path (ingress and egress protocols match) or run
//! the slow-path protocol adapter through a provider client.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Response};
use axum::response::IntoResponse;
use axum::Json;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::api::auth::authenticate;
use crate::api::egress::{anthropic_response_body, openai_sse_frame, AnthropicSseState};
use crate::api::{ingress, proxy};
use crate::core::config::{GatewayConfig, Protocol, Service};
use crate::core::error::{GatewayError, Result};
use crate::core::usage::{AccountingGuard, UsageCounters};
use crate::provider::anthropic::AnthropicRequest;
use crate::provider::{ChatRequest, ProviderClient, StreamChunk, STREAM_CHANNEL_CAPACITY};

/// Body peek cap. Large enough for tool-augmented conversations.
pub const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

// ============================================================================
// Application State
// ============================================================================

pub struct AppState {
    pub config: Arc<GatewayConfig>,
    /// Slow-path client (pooled, strict TLS)
    pub http_client: reqwest::Client,
    /// Fast-path client (no keep-alive, permissive TLS)
    pub proxy_client: reqwest::Client,
}

impl AppState {
    pub fn new(config: Arc<GatewayConfig>) -> Self {
        AppState {
            config,
            http_client: build_http_client(30),
            proxy_client: proxy::build_proxy_client(30),
        }
    }
}

/// Slow-path HTTP client: finite connect timeout, no overall request
/// deadline (LLM responses can run for minutes).
pub fn build_http_client(connect_timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(connect_timeout_secs))
        .pool_max_idle_per_host(20)
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .build()
        .expect("failed to build HTTP client")
}

// ============================================================================
// Entry Points
// ============================================================================

/// `POST /v1/chat/completions` (OpenAI-shaped ingress).
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request,
) -> Response<Body> {
    match dispatch(state, headers, request, Protocol::OpenAI).await {
        Ok(response) => response,
        Err(err) => err.into_protocol_response(Protocol::OpenAI),
    }
}

/// `POST /v1/messages` (Anthropic-shaped ingress).
pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    request: Request,
) -> Response<Body> {
    match dispatch(state, headers, request, Protocol::Anthropic).await {
        Ok(response) => response,
        Err(err) => err.into_protocol_response(Protocol::Anthropic),
    }
}

/// `GET /v1/models` — every active service by name.
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Response<Body> {
    let snapshot = state.config.snapshot();
    if let Err(err) = authenticate(&headers, &snapshot) {
        return err.into_protocol_response(Protocol::OpenAI);
    }

    let data: Vec<_> = snapshot
        .services
        .iter()
        .filter(|s| s.active)
        .map(|s| {
            json!({
                "id": s.name,
                "object": "model",
                "created": 1677610602,
                "owned_by": "openai",
            })
        })
        .collect();

    Json(json!({"object": "list", "data": data})).into_response()
}

/// `POST /api/event_logging/batch` — telemetry sink for Anthropic clients
/// that POST usage telemetry; always 200 to keep them quiet.
pub async fn telemetry_sink() -> Response<Body> {
    tracing::debug!("telemetry request ignored");
    Json(json!({"status": "ok"})).into_response()
}

/// `GET /health`
pub async fn health() -> Response<Body> {
    Json(json!({"status": "ok"})).into_response()
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Deserialize)]
struct ModelPeek {
    model: String,
}

/// Read the raw body once, capped.
async fn read_body(request: Request) -> Result<Bytes> {
    axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES)
        .await
        .map_err(|err| {
            if err.to_string().contains("length limit") {
                GatewayError::PayloadTooLarge
            } else {
                GatewayError::BadRequest("failed to read request body".to_string())
            }
        })
}

/// Minimal decode pulling only the top-level `model` field.
fn peek_model(body: &Bytes) -> Result<String> {
    let peek: ModelPeek = serde_json::from_slice(body)
        .map_err(|_| GatewayError::BadRequest("invalid JSON body".to_string()))?;
    Ok(peek.model)
}

async fn dispatch(
    state: Arc<AppState>,
    headers: HeaderMap,
    request: Request,
    ingress_protocol: Protocol,
) -> Result<Response<Body>> {
    // Auth and quota run before any body bytes are read
    let snapshot = state.config.snapshot();
    let principal = authenticate(&headers, &snapshot)?;

    let body = read_body(request).await?;
    let model = peek_model(&body)?;

    let service = snapshot
        .find_service(&model)
        .ok_or_else(|| GatewayError::UnknownModel(model.clone()))?;

    let api_key = service
        .next_api_key()
        .ok_or_else(|| GatewayError::Internal("service has no upstream keys".to_string()))?
        .to_string();

    let counters = UsageCounters::new();
    let guard = AccountingGuard::new(
        principal.id,
        service.name.clone(),
        service.upstream_model(),
        counters.clone(),
    );

    let egress_protocol = service.wire_protocol();
    if ingress_protocol == egress_protocol
        && matches!(ingress_protocol, Protocol::OpenAI | Protocol::Anthropic)
    {
        tracing::debug!(
            service = %service.name,
            protocol = %ingress_protocol,
            "Fast path"
        );
        return proxy::forward(
            &state.proxy_client,
            &headers,
            body,
            &service,
            &api_key,
            ingress_protocol,
            counters,
            guard,
        )
        .await;
    }

    tracing::debug!(
        service = %service.name,
        ingress = %ingress_protocol,
        egress = %egress_protocol,
        "Slow path adapter"
    );
    adapt(
        state, body, service, api_key, ingress_protocol, counters, guard,
    )
    .await
}

/// Slow-path protocol adapter: full parse to canonical, provider dispatch,
/// egress shaping per the ingress protocol.
async fn adapt(
    state: Arc<AppState>,
    body: Bytes,
    service: Arc<Service>,
    api_key: String,
    ingress_protocol: Protocol,
    counters: Arc<UsageCounters>,
    mut guard: AccountingGuard,
) -> Result<Response<Body>> {
    let mut canonical: ChatRequest = match ingress_protocol {
        Protocol::Anthropic => {
            let parsed: AnthropicRequest = serde_json::from_slice(&body)
                .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
            ingress::to_canonical(parsed)
        }
        _ => serde_json::from_slice(&body).map_err(|e| GatewayError::BadRequest(e.to_string()))?,
    };

    canonical.model = service.upstream_model().to_string();

    let provider = ProviderClient::for_service(&service, state.http_client.clone());

    if canonical.stream {
        return Ok(stream_response(
            provider,
            canonical,
            api_key,
            ingress_protocol,
            counters,
            guard,
        ));
    }

    let response = provider.chat(canonical, &api_key).await?;

    if let Some(ref usage) = response.usage {
        counters.add_prompt(usage.prompt_tokens);
        counters.add_completion(usage.completion_tokens);
    }
    guard.mark_success();

    match ingress_protocol {
        Protocol::Anthropic => {
            let model = response.model.clone();
            Ok(Json(anthropic_response_body(&response, &model)).into_response())
        }
        _ => Ok(Json(response).into_response()),
    }
}

// ============================================================================
// Slow-Path Streaming
// ============================================================================

enum EgressShaper {
    OpenAI,
    Anthropic(AnthropicSseState),
}

struct StreamState {
    rx: mpsc::Receiver<StreamChunk>,
    err_rx: mpsc::Receiver<GatewayError>,
    counters: Arc<UsageCounters>,
    guard: AccountingGuard,
    shaper: EgressShaper,
    opened: bool,
    finished: bool,
}

/// Spawn the provider into a bounded channel and translate its canonical
/// chunks into the client's SSE dialect, one frame per chunk, in arrival
/// order. The accounting guard rides in the stream state so the usage
/// record fires on completion, upstream error, and client disconnect alike.
fn stream_response(
    provider: ProviderClient,
    canonical: ChatRequest,
    api_key: String,
    ingress_protocol: Protocol,
    counters: Arc<UsageCounters>,
    guard: AccountingGuard,
) -> Response<Body> {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    let (err_tx, err_rx) = mpsc::channel(1);

    let model = canonical.model.clone();
    tokio::spawn(async move {
        if let Err(err) = provider.stream_chat(canonical, &api_key, tx).await {
            tracing::warn!("Upstream stream failed: {}", err);
            let _ = err_tx.send(err).await;
        }
    });

    let shaper = match ingress_protocol {
        Protocol::Anthropic => EgressShaper::Anthropic(AnthropicSseState::new(model)),
        _ => EgressShaper::OpenAI,
    };

    let state = StreamState {
        rx,
        err_rx,
        counters,
        guard,
        shaper,
        opened: false,
        finished: false,
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }

        // Anthropic egress opens its envelope before any upstream data
        if !state.opened {
            state.opened = true;
            if let EgressShaper::Anthropic(ref sse) = state.shaper {
                let frame = sse.open();
                return Some((Ok::<Bytes, std::convert::Infallible>(frame.into()), state));
            }
        }

        loop {
            match state.rx.recv().await {
                Some(chunk) => {
                    if let Some(ref usage) = chunk.usage {
                        state.counters.add_prompt(usage.prompt_tokens);
                        state.counters.add_completion(usage.completion_tokens);
                    }
                    let frame = match state.shaper {
                        EgressShaper::OpenAI => openai_sse_frame(&chunk),
                        EgressShaper::Anthropic(ref mut sse) => sse.handle_chunk(&chunk),
                    };
                    if frame.is_empty() {
                        continue;
                    }
                    return Some((Ok(frame.into()), state));
                }
                None => {
                    state.finished = true;
                    // The producer drops its chunk sender before reporting a
                    // terminal error; recv() here settles the race by waiting
                    // for either the error or the error sender's drop.
                    if let Some(err) = state.err_rx.recv().await {
                        tracing::warn!("Stream terminated by upstream error: {}", err);
                        return None;
                    }
                    state.guard.mark_success();
                    let tail = match state.shaper {
                        EgressShaper::OpenAI => crate::provider::sse::format_sse_done(),
                        EgressShaper::Anthropic(ref mut sse) => sse.close(),
                    };
                    return Some((Ok(tail.into()), state));
                }
            }
        }
    });

    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

// ============================================================================
// Tests
// ============================================================================
