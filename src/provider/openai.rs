//! OpenAI-protocol provider client.
//!
//! The canonical request *is* the OpenAI wire shape, so this client posts it
//! verbatim. Covers every OpenAI-compatible vendor (deepseek, glm, yi,
//! moonshot and friends).

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::core::error::{GatewayError, Result};
use crate::provider::sse::SseParser;
use crate::provider::{ChatRequest, ChatResponse, Choice, Message, Role, StreamChunk};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAIProvider {
    base_url: String,
    http: reqwest::Client,
}

impl OpenAIProvider {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        let base_url = if base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            base_url.trim_end_matches('/').to_string()
        };
        OpenAIProvider { base_url, http }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    pub async fn chat(&self, req: ChatRequest, api_key: &str) -> Result<ChatResponse> {
        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamTransport(e.to_string()))?;

        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(GatewayError::upstream(status.as_u16(), &body));
        }

        // Some relays answer a non-streaming request with an SSE body anyway;
        // collapse it into a single synthetic choice.
        let text = String::from_utf8_lossy(&body);
        if text.trim_start().starts_with("data:") {
            return Ok(collapse_sse_body(&body, &req.model));
        }

        let resp: ChatResponse = serde_json::from_slice(&body).map_err(|e| {
            GatewayError::Internal(format!(
                "failed to decode openai response: {}. Body: {}",
                e,
                crate::core::error::preview_bytes(&body)
            ))
        })?;
        Ok(resp)
    }

    pub async fn stream_chat(
        &self,
        mut req: ChatRequest,
        api_key: &str,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        req.stream = true;

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(api_key)
            .json(&req)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamTransport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(GatewayError::upstream(status.as_u16(), &body));
        }

        let mut stream = response.bytes_stream();
        let mut parser = SseParser::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| GatewayError::UpstreamTransport(e.to_string()))?;
            for event in parser.feed(&chunk) {
                let Some(data) = event.data else { continue };
                if data.trim() == "[DONE]" {
                    return Ok(());
                }
                // Bad frames are dropped; the stream carries on.
                let Ok(parsed) = serde_json::from_str::<StreamChunk>(&data) else {
                    continue;
                };
                if tx.send(parsed).await.is_err() {
                    // Consumer gone (client disconnected); stop reading.
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

/// Accumulate delta content fragments from an SSE body into a single choice.
fn collapse_sse_body(body: &[u8], model: &str) -> ChatResponse {
    let mut parser = SseParser::new();
    let mut content = String::new();
    let mut last_id = String::new();
    let mut finish_reason = "stop".to_string();

    let mut events = parser.feed(body);
    // The final event may lack a trailing blank line; force a flush.
    events.extend(parser.feed(b"\n\n"));

    for event in events {
        let Some(data) = event.data else { continue };
        if data.trim() == "[DONE]" {
            break;
        }
        let Ok(chunk) = serde_json::from_str::<StreamChunk>(&data) else {
            continue;
        };
        if let Some(choice) = chunk.choices.first() {
            if let Some(ref text) = choice.delta.content {
                content.push_str(text);
            }
            if let Some(ref reason) = choice.finish_reason {
                finish_reason = reason.clone();
            }
        }
        if !chunk.id.is_empty() {
            last_id = chunk.id;
        }
    }

    ChatResponse {
        id: last_id,
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: Message::text(Role::Assistant, content),
            finish_reason: Some(finish_reason),
        }],
        usage: None,
    }
}
