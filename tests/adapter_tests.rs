//! Slow-path protocol adapter tests: cross-protocol requests through the
//! full router, and provider clients against mocked upstreams.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use llm_gateway::api::AppState;
use llm_gateway::core::{
    ConfigSnapshot, Credential, GatewayConfig, Principal, Role, Service, ServiceType,
};
use llm_gateway::provider::{ChatRequest, Message, OpenAIProvider};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CLIENT_KEY: &str = "sk-client-1";

fn build_app(services: Vec<Service>) -> Router {
    let credentials = vec![Credential {
        key: CLIENT_KEY.into(),
        active: true,
        principal: Principal {
            id: 7,
            role: Role::User,
            quota: -1.0,
            used_amount: 0.0,
        },
    }];
    let config = Arc::new(GatewayConfig::new(ConfigSnapshot::new(services, credentials)));
    llm_gateway::build_router(Arc::new(AppState::new(config)))
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", CLIENT_KEY))
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

// ============================================================================
// Anthropic ingress → OpenAI upstream
// ============================================================================

#[tokio::test]
async fn anthropic_ingress_to_openai_upstream_streaming() {
    let upstream_sse = concat!(
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
        "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: [DONE]\n\n",
    );

    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer k1"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "Hi"}],
            "stream": true
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(upstream_sse.as_bytes(), "text/event-stream"),
        )
        .expect(1)
        .mount(&mock)
        .await;

    let service = Service::new(
        1,
        "claude-on-openai",
        ServiceType::OpenAI,
        mock.uri(),
        vec!["k1".into()],
    )
    .with_target_model("gpt-4o-mini");
    let app = build_app(vec![service]);

    let response = app
        .oneshot(post_json(
            "/v1/messages",
            json!({
                "model": "claude-on-openai",
                "messages": [{"role": "user", "content": [{"type": "text", "text": "Hi"}]}],
                "max_tokens": 100,
                "stream": true
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.starts_with("event: message_start\n"));
    assert!(body.contains("event: content_block_delta\n"));
    assert!(body.contains("\"text\":\"Hel\""));
    assert!(body.contains("\"text\":\"lo\""));
    assert!(body.trim_end().ends_with("data: {\"type\":\"message_stop\"}"));
}

#[tokio::test]
async fn anthropic_ingress_to_openai_upstream_non_streaming() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-9",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o-mini",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello there"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 4, "completion_tokens": 3, "total_tokens": 7}
        })))
        .mount(&mock)
        .await;

    let service = Service::new(
        1,
        "claude-on-openai",
        ServiceType::OpenAI,
        mock.uri(),
        vec!["k1".into()],
    );
    let app = build_app(vec![service]);

    let response = app
        .oneshot(post_json(
            "/v1/messages",
            json!({
                "model": "claude-on-openai",
                "messages": [{"role": "user", "content": "Hi"}],
                "max_tokens": 100
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["content"][0]["type"], "text");
    assert_eq!(body["content"][0]["text"], "Hello there");
    assert_eq!(body["usage"]["input_tokens"], 4);
    assert_eq!(body["usage"]["output_tokens"], 3);
}

// ============================================================================
// OpenAI ingress → Anthropic upstream
// ============================================================================

#[tokio::test]
async fn openai_ingress_to_anthropic_upstream_non_streaming() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .and(header("x-api-key", "k1"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(body_partial_json(json!({"max_tokens": 4096})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_01",
            "type": "message",
            "role": "assistant",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{"type": "text", "text": "Hi from Claude"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 12, "output_tokens": 6}
        })))
        .expect(1)
        .mount(&mock)
        .await;

    let service = Service::new(
        1,
        "claude-proxy",
        ServiceType::Anthropic,
        mock.uri(),
        vec!["k1".into()],
    );
    let app = build_app(vec![service]);

    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({
                "model": "claude-proxy",
                "messages": [{"role": "user", "content": "Hi"}],
                "stream": false
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hi from Claude");
    assert_eq!(body["usage"]["prompt_tokens"], 12);
    assert_eq!(body["usage"]["completion_tokens"], 6);
}

#[tokio::test]
async fn openai_ingress_to_anthropic_upstream_streaming() {
    // A real Anthropic stream always closes with content_block_stop,
    // message_delta (carrying the final output token count), message_stop.
    let upstream_sse = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_01\",\"usage\":{\"input_tokens\":5,\"output_tokens\":1}}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hey\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\",\"stop_sequence\":null},\"usage\":{\"output_tokens\":7}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(upstream_sse.as_bytes(), "text/event-stream"),
        )
        .mount(&mock)
        .await;

    let service = Service::new(
        1,
        "claude-proxy",
        ServiceType::Anthropic,
        mock.uri(),
        vec!["k1".into()],
    );
    let app = build_app(vec![service]);

    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({
                "model": "claude-proxy",
                "messages": [{"role": "user", "content": "Hi"}],
                "stream": true
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = String::from_utf8(body_bytes(response).await).unwrap();

    // Canonical chunks serialized as OpenAI SSE, [DONE]-terminated
    assert!(body.contains("\"role\":\"assistant\""));
    assert!(body.contains("\"content\":\"Hey\""));
    assert!(body.trim_end().ends_with("data: [DONE]"));

    // The message_delta usage carrier must not surface as a chunk with an
    // empty choices array; OpenAI clients index choices[0] unconditionally.
    for frame in body.split("\n\n").filter_map(|f| f.strip_prefix("data: ")) {
        if frame == "[DONE]" {
            continue;
        }
        let chunk: Value = serde_json::from_str(frame).unwrap();
        assert!(
            !chunk["choices"].as_array().unwrap().is_empty(),
            "empty choices frame leaked to client: {}",
            frame
        );
    }
}

#[tokio::test]
async fn slow_path_upstream_error_maps_to_500_with_preview() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/messages"))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({"type": "error", "error": {"message": "bad tools"}})),
        )
        .mount(&mock)
        .await;

    let service = Service::new(
        1,
        "claude-proxy",
        ServiceType::Anthropic,
        mock.uri(),
        vec!["k1".into()],
    );
    let app = build_app(vec![service]);

    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({"model": "claude-proxy", "messages": [{"role": "user", "content": "Hi"}]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.contains("400"));
    assert!(message.contains("bad tools"));
}

// ============================================================================
// OpenAI ingress → Gemini upstream
// ============================================================================

#[tokio::test]
async fn openai_ingress_to_gemini_upstream_non_streaming() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/gemini-1.5-pro:generateContent"))
        .and(query_param("key", "k1"))
        .and(body_partial_json(json!({
            "contents": [{"role": "user", "parts": [{"text": "Hi"}]}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hello from Gemini"}]},
                "finishReason": "STOP",
                "index": 0
            }]
        })))
        .expect(1)
        .mount(&mock)
        .await;

    let service = Service::new(
        1,
        "gemini-proxy",
        ServiceType::Gemini,
        mock.uri(),
        vec!["k1".into()],
    )
    .with_target_model("gemini-1.5-pro");
    let app = build_app(vec![service]);

    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            json!({
                "model": "gemini-proxy",
                "messages": [{"role": "user", "content": "Hi"}]
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "Hello from Gemini"
    );
}

// ============================================================================
// Provider round-trip
// ============================================================================

#[tokio::test]
async fn openai_provider_round_trip_preserves_content() {
    let mock = MockServer::start().await;
    let content = "exact bytes, including unicode: héllo ✓";
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop"
            }]
        })))
        .mount(&mock)
        .await;

    let provider = OpenAIProvider::new(&mock.uri(), reqwest::Client::new());
    let response = provider
        .chat(
            ChatRequest {
                model: "gpt-4o".into(),
                messages: vec![Message::text(llm_gateway::provider::Role::User, "Hi")],
                tools: vec![],
                tool_choice: None,
                temperature: None,
                max_tokens: None,
                stream: false,
            },
            "secret",
        )
        .await
        .unwrap();

    assert_eq!(response.first_content(), content);
}
