//! Reverse-proxy fast path.
//!
//! Taken when the ingress protocol and the resolved service's egress
//! protocol match: the buffered request body is relayed to the upstream with
//! rewritten headers (and, when a model override applies, a rewritten
//! top-level `model` field), and the upstream response bytes stream back to
//! the client verbatim. The only inspection of the relayed body is the
//! usage snooper's token scraping.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use serde_json::Value;

use crate::api::ingress::flatten_system;
use crate::api::snooper::UsageSnooper;
use crate::core::config::{Protocol, Service};
use crate::core::error::{GatewayError, Result};
use crate::core::usage::{AccountingGuard, UsageCounters};
use crate::provider::anthropic::ANTHROPIC_VERSION;

/// Browser-ish UA; some CDN-fronted relays reject obvious server agents.
const PROXY_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Request headers never forwarded upstream. `accept-encoding` is dropped so
/// the upstream answers in plain text for the snooper; the client credential
/// headers are replaced with the selected upstream key.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "origin",
    "referer",
    "cookie",
    "accept-encoding",
    "x-forwarded-for",
    "host",
    "authorization",
    "x-api-key",
    "content-length",
    "transfer-encoding",
    "connection",
];

/// Hop-by-hop response headers dropped so the relayed body is re-framed.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &["content-length", "transfer-encoding", "connection"];

/// Fixed endpoint suffix appended to the service base URL.
fn endpoint_suffix(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Anthropic => "/messages",
        _ => "/chat/completions",
    }
}

/// Rewrite the buffered body for dispatch: the top-level `model` becomes the
/// service's `target_model`, and on the Anthropic path a structured `system`
/// is flattened to a single string for upstream compatibility.
fn rewrite_body(body: &Bytes, service: &Service, protocol: Protocol) -> Option<Bytes> {
    let mut parsed: Value = serde_json::from_slice(body).ok()?;
    let obj = parsed.as_object_mut()?;

    obj.insert(
        "model".to_string(),
        Value::String(service.upstream_model().to_string()),
    );

    if protocol == Protocol::Anthropic {
        if let Some(system) = obj.get("system") {
            if system.is_array() {
                let flat = flatten_system(system);
                if !flat.is_empty() {
                    obj.insert("system".to_string(), Value::String(flat.trim().to_string()));
                }
            }
        }
    }

    serde_json::to_vec(&parsed).ok().map(Bytes::from)
}

/// Relay the request to the upstream and stream the response back.
pub async fn forward(
    client: &reqwest::Client,
    headers: &HeaderMap,
    body: Bytes,
    service: &Arc<Service>,
    api_key: &str,
    protocol: Protocol,
    counters: Arc<UsageCounters>,
    guard: AccountingGuard,
) -> Result<Response<Body>> {
    let url = format!(
        "{}{}",
        service.base_url.trim_end_matches('/'),
        endpoint_suffix(protocol)
    );

    let (body, rewritten) = if service.rewrites_model() {
        match rewrite_body(&body, service, protocol) {
            Some(new_body) => (new_body, true),
            None => (body, false),
        }
    } else {
        (body, false)
    };

    let mut outbound = HeaderMap::new();
    for (name, value) in headers {
        let lowered = name.as_str().to_ascii_lowercase();
        if STRIPPED_REQUEST_HEADERS.contains(&lowered.as_str()) {
            continue;
        }
        if rewritten && lowered == "content-encoding" {
            continue;
        }
        outbound.insert(name.clone(), value.clone());
    }

    outbound.insert("user-agent", HeaderValue::from_static(PROXY_USER_AGENT));
    match protocol {
        Protocol::Anthropic => {
            outbound.insert(
                "x-api-key",
                HeaderValue::from_str(api_key)
                    .map_err(|_| GatewayError::Internal("invalid upstream key".into()))?,
            );
            outbound.insert(
                "anthropic-version",
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
        }
        _ => {
            outbound.insert(
                "authorization",
                HeaderValue::from_str(&format!("Bearer {}", api_key))
                    .map_err(|_| GatewayError::Internal("invalid upstream key".into()))?,
            );
        }
    }

    tracing::debug!(
        service = %service.name,
        url = %url,
        rewritten = rewritten,
        "Fast path relay"
    );

    let upstream = client
        .post(&url)
        .headers(outbound)
        .body(body)
        .send()
        .await
        .map_err(|e| GatewayError::UpstreamTransport(e.to_string()))?;

    let status = upstream.status();

    let mut response = Response::builder()
        .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in upstream.headers() {
        let lowered = name.as_str().to_ascii_lowercase();
        if STRIPPED_RESPONSE_HEADERS.contains(&lowered.as_str()) {
            continue;
        }
        response = response.header(name, value);
    }

    let stream = UsageSnooper::new(
        Box::pin(upstream.bytes_stream()),
        counters,
        guard,
        status.is_success(),
    );
    response
        .body(Body::from_stream(stream))
        .map_err(|e| GatewayError::Internal(e.to_string()))
}

/// Build the dedicated fast-path HTTP client: fresh connection per request
/// (avoids mid-stream resets from some providers) and permissive TLS for
/// self-hosted relays.
pub fn build_proxy_client(connect_timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .connect_timeout(std::time::Duration::from_secs(connect_timeout_secs))
        .pool_max_idle_per_host(0)
        .build()
        .expect("failed to build proxy HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ServiceType;
    use serde_json::json;

    fn service(target: Option<&str>) -> Service {
        let mut svc = Service::new(
            1,
            "claude-proxy",
            ServiceType::Anthropic,
            "https://api.anthropic.com/v1/",
            vec!["k1".into()],
        );
        svc.target_model = target.map(String::from);
        svc
    }

    #[test]
    fn test_endpoint_suffix() {
        assert_eq!(endpoint_suffix(Protocol::OpenAI), "/chat/completions");
        assert_eq!(endpoint_suffix(Protocol::Anthropic), "/messages");
    }

    #[test]
    fn test_rewrite_body_model_field() {
        let svc = service(Some("claude-3-5-sonnet-20241022"));
        let body = Bytes::from(r#"{"model":"claude-proxy","messages":[]}"#);
        let rewritten = rewrite_body(&body, &svc, Protocol::Anthropic).unwrap();
        let parsed: Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(parsed["model"], "claude-3-5-sonnet-20241022");
    }

    #[test]
    fn test_rewrite_flattens_structured_system() {
        let svc = service(Some("claude-3-5-sonnet-20241022"));
        let body = Bytes::from(
            json!({
                "model": "claude-proxy",
                "system": [
                    {"type": "text", "text": "a"},
                    {"type": "text", "text": "b"}
                ],
                "messages": []
            })
            .to_string(),
        );
        let rewritten = rewrite_body(&body, &svc, Protocol::Anthropic).unwrap();
        let parsed: Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(parsed["system"], "a\nb");
    }

    #[test]
    fn test_rewrite_keeps_string_system() {
        let svc = service(Some("t"));
        let body = Bytes::from(r#"{"model":"claude-proxy","system":"keep me"}"#);
        let rewritten = rewrite_body(&body, &svc, Protocol::Anthropic).unwrap();
        let parsed: Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(parsed["system"], "keep me");
    }

    #[test]
    fn test_rewrite_invalid_json_returns_none() {
        let svc = service(Some("t"));
        assert!(rewrite_body(&Bytes::from_static(b"not json"), &svc, Protocol::OpenAI).is_none());
    }
}
