//! Google Gemini provider client.
//!
//! Gemini's generateContent API differs from the chat-completions family:
//! the model name lives in the URL, auth is a query parameter, the system
//! prompt becomes `system_instruction`, and the assistant role is "model".

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::error::{GatewayError, Result};
use crate::provider::sse::SseParser;
use crate::provider::{ChatRequest, ChatResponse, Choice, Message, Role, StreamChunk};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

// ============================================================================
// Wire Model
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    role: String,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason", default)]
    finish_reason: Option<String>,
    #[serde(default)]
    index: u32,
}

/// Map canonical messages into Gemini contents: system lifts out to
/// `system_instruction`, assistant becomes "model", everything else "user".
fn build_request(req: &ChatRequest) -> GeminiRequest {
    let mut out = GeminiRequest {
        contents: vec![],
        system_instruction: None,
    };

    for msg in &req.messages {
        let text = msg.content_str().to_string();
        match msg.role {
            Some(Role::System) => {
                out.system_instruction = Some(GeminiContent {
                    role: String::new(),
                    parts: vec![GeminiPart { text }],
                });
            }
            Some(Role::Assistant) => out.contents.push(GeminiContent {
                role: "model".to_string(),
                parts: vec![GeminiPart { text }],
            }),
            _ => out.contents.push(GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart { text }],
            }),
        }
    }

    out
}

fn candidate_text(candidate: &GeminiCandidate) -> String {
    candidate
        .content
        .as_ref()
        .map(|c| {
            c.parts
                .iter()
                .map(|p| p.text.as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
}

// ============================================================================
// Provider Client
// ============================================================================

pub struct GeminiProvider {
    base_url: String,
    http: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        let base_url = if base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            base_url.trim_end_matches('/').to_string()
        };
        GeminiProvider { base_url, http }
    }

    fn blocking_url(&self, model: &str, api_key: &str) -> String {
        format!("{}/{}:generateContent?key={}", self.base_url, model, api_key)
    }

    fn streaming_url(&self, model: &str, api_key: &str) -> String {
        format!(
            "{}/{}:streamGenerateContent?key={}&alt=sse",
            self.base_url, model, api_key
        )
    }

    pub async fn chat(&self, req: ChatRequest, api_key: &str) -> Result<ChatResponse> {
        let payload = build_request(&req);
        let response = self
            .http
            .post(self.blocking_url(&req.model, api_key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamTransport(e.to_string()))?;

        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(GatewayError::upstream(status.as_u16(), &body));
        }

        let parsed: GeminiResponse = serde_json::from_slice(&body).map_err(|e| {
            GatewayError::Internal(format!(
                "failed to decode gemini response: {}. Body: {}",
                e,
                crate::core::error::preview_bytes(&body)
            ))
        })?;

        let choices = parsed
            .candidates
            .iter()
            .map(|candidate| Choice {
                index: candidate.index,
                message: Message::text(Role::Assistant, candidate_text(candidate)),
                finish_reason: candidate.finish_reason.clone(),
            })
            .collect();

        Ok(ChatResponse {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: req.model,
            choices,
            usage: None,
        })
    }

    pub async fn stream_chat(
        &self,
        req: ChatRequest,
        api_key: &str,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        let payload = build_request(&req);
        let response = self
            .http
            .post(self.streaming_url(&req.model, api_key))
            .json(&payload)
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
                let Ok(parsed) = serde_json::from_str::<GeminiResponse>(&data) else {
                    continue;
                };
                let Some(candidate) = parsed.candidates.first() else {
                    continue;
                };
                let out = StreamChunk::delta(
                    &req.model,
                    Message {
                        role: Some(Role::Assistant),
                        content: Some(candidate_text(candidate)),
                        ..Default::default()
                    },
                );
                if tx.send(out).await.is_err() {
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}
