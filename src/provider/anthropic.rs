//! Anthropic-protocol provider client.
//!
//! Marshals canonical (OpenAI-shaped) requests into Anthropic block form and
//! demultiplexes Anthropic's named SSE events back into canonical stream
//! chunks. The wire structs here are shared with the Anthropic ingress
//! translator, which parses the same shapes coming from clients.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::core::error::{GatewayError, Result};
use crate::provider::sse::SseParser;
use crate::provider::{
    ChatRequest, ChatResponse, Choice, Message, Role, StreamChunk, ToolCall, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Anthropic requires `max_tokens`; applied when the caller omitted it.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// API version header sent with every upstream request.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

// ============================================================================
// Wire Model
// ============================================================================

/// Anthropic `/v1/messages` request envelope.
///
/// `content` and `system` stay as raw JSON values: both sides of the wire
/// allow either a plain string or a block list, and unknown block types must
/// pass through or be skipped rather than fail the parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub messages: Vec<AnthropicMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<AnthropicTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    /// String or ordered list of content blocks
    pub content: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

/// Anthropic `/v1/messages` non-streaming response.
#[derive(Debug, Clone, Deserialize)]
pub struct AnthropicResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub content: Vec<ResponseBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<AnthropicUsage>,
}

/// Response content block, parsed tolerantly: only `type` and `text` matter
/// for the canonical mapping.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseBlock {
    #[serde(rename = "type", default)]
    pub block_type: String,
    #[serde(default)]
    pub text: String,
}

/// Anthropic SSE event payload (the fields the demux cares about).
#[derive(Debug, Clone, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type", default)]
    event_type: String,
    #[serde(default)]
    delta: Option<EventDelta>,
    #[serde(default)]
    content_block: Option<EventBlock>,
    #[serde(default)]
    message: Option<EventMessage>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Clone, Deserialize)]
struct EventDelta {
    #[serde(rename = "type", default)]
    delta_type: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    partial_json: String,
}

#[derive(Debug, Clone, Deserialize)]
struct EventBlock {
    #[serde(rename = "type", default)]
    block_type: String,
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct EventMessage {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

// ============================================================================
// Canonical → Anthropic Marshalling
// ============================================================================

/// Convert a canonical request into Anthropic block form.
///
/// Consecutive role=tool messages merge into `tool_result` blocks inside a
/// single user message: Anthropic rejects non-alternating roles, and
/// multiple tool results belong to one turn.
pub fn build_request(req: &ChatRequest, stream: bool) -> AnthropicRequest {
    let mut out = AnthropicRequest {
        model: req.model.clone(),
        messages: vec![],
        system: None,
        max_tokens: Some(req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        temperature: req.temperature,
        stream,
        tools: req
            .tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.function.name.clone(),
                description: t.function.description.clone(),
                input_schema: t.function.parameters.clone(),
            })
            .collect(),
        tool_choice: None,
    };

    for msg in &req.messages {
        match msg.role {
            Some(Role::System) => {
                out.system = Some(Value::String(msg.content_str().to_string()));
            }
            Some(Role::Assistant) if !msg.tool_calls.is_empty() => {
                let mut blocks: Vec<Value> = vec![];
                if !msg.content_str().is_empty() {
                    blocks.push(json!({"type": "text", "text": msg.content_str()}));
                }
                for call in &msg.tool_calls {
                    // Arguments arrive as a JSON string; tool_use wants the
                    // parsed object. Unparseable arguments degrade to {}.
                    let input: Value = serde_json::from_str(&call.function.arguments)
                        .unwrap_or_else(|_| json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.function.name,
                        "input": input,
                    }));
                }
                out.messages.push(AnthropicMessage {
                    role: "assistant".to_string(),
                    content: Value::Array(blocks),
                });
            }
            Some(Role::User) | Some(Role::Assistant) => {
                out.messages.push(AnthropicMessage {
                    role: msg
                        .role
                        .map(|r| match r {
                            Role::Assistant => "assistant",
                            _ => "user",
                        })
                        .unwrap_or("user")
                        .to_string(),
                    content: Value::String(msg.content_str().to_string()),
                });
            }
            Some(Role::Tool) => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                    "content": msg.content_str(),
                });
                append_tool_result(&mut out.messages, block);
            }
            None => {}
        }
    }

    out
}

/// Append a tool_result block, merging into the previous user message when
/// one is already open.
fn append_tool_result(messages: &mut Vec<AnthropicMessage>, block: Value) {
    if let Some(last) = messages.last_mut() {
        if last.role == "user" {
            let mut blocks = match std::mem::take(&mut last.content) {
                Value::Array(list) => list,
                Value::String(text) => vec![json!({"type": "text", "text": text})],
                other => vec![other],
            };
            blocks.push(block);
            last.content = Value::Array(blocks);
            return;
        }
    }
    messages.push(AnthropicMessage {
        role: "user".to_string(),
        content: Value::Array(vec![block]),
    });
}

// ============================================================================
// Provider Client
// ============================================================================

pub struct AnthropicProvider {
    base_url: String,
    http: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(base_url: &str, http: reqwest::Client) -> Self {
        let base_url = if base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            base_url.trim_end_matches('/').to_string()
        };
        AnthropicProvider { base_url, http }
    }

    fn endpoint(&self) -> String {
        format!("{}/messages", self.base_url)
    }

    async fn send(&self, payload: &AnthropicRequest, api_key: &str) -> Result<reqwest::Response> {
        self.http
            .post(self.endpoint())
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(payload)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamTransport(e.to_string()))
    }

    pub async fn chat(&self, req: ChatRequest, api_key: &str) -> Result<ChatResponse> {
        let payload = build_request(&req, false);
        let response = self.send(&payload, api_key).await?;

        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(GatewayError::upstream(status.as_u16(), &body));
        }

        let parsed: AnthropicResponse = serde_json::from_slice(&body).map_err(|e| {
            GatewayError::Internal(format!(
                "failed to decode anthropic response: {}. Body: {}",
                e,
                crate::core::error::preview_bytes(&body)
            ))
        })?;

        let content: String = parsed
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .map(|b| b.text.as_str())
            .collect();

        let usage = parsed
            .usage
            .map(|u| Usage::new(u.input_tokens, u.output_tokens));

        Ok(ChatResponse {
            id: parsed.id,
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: req.model,
            choices: vec![Choice {
                index: 0,
                message: Message::text(Role::Assistant, content),
                finish_reason: Some(parsed.stop_reason.unwrap_or_else(|| "stop".to_string())),
            }],
            usage,
        })
    }

    pub async fn stream_chat(
        &self,
        req: ChatRequest,
        api_key: &str,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        let payload = build_request(&req, true);
        let response = self.send(&payload, api_key).await?;

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
                let Ok(parsed) = serde_json::from_str::<StreamEvent>(&data) else {
                    continue;
                };
                for out in demux_event(&parsed, &req.model) {
                    if tx.send(out).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }
}

/// Translate one Anthropic stream event into canonical chunks.
///
/// Anthropic reports input tokens in `message_start` and output tokens in
/// `message_delta`; both are attached as chunk usage so accounting can sum
/// them additively downstream.
fn demux_event(event: &StreamEvent, model: &str) -> Vec<StreamChunk> {
    match event.event_type.as_str() {
        "message_start" => {
            let mut chunk = StreamChunk::delta(
                model,
                Message {
                    role: Some(Role::Assistant),
                    ..Default::default()
                },
            );
            if let Some(usage) = event.message.as_ref().and_then(|m| m.usage.as_ref()) {
                chunk.usage = Some(Usage::new(usage.input_tokens, usage.output_tokens));
            }
            vec![chunk]
        }
        "content_block_start" => match event.content_block {
            Some(ref block) if block.block_type == "tool_use" => {
                vec![StreamChunk::delta(
                    model,
                    Message {
                        tool_calls: vec![ToolCall::function(&block.id, &block.name, "")],
                        ..Default::default()
                    },
                )]
            }
            _ => vec![],
        },
        "content_block_delta" => match event.delta {
            Some(ref delta) if delta.delta_type == "text_delta" => {
                vec![StreamChunk::delta(
                    model,
                    Message {
                        content: Some(delta.text.clone()),
                        ..Default::default()
                    },
                )]
            }
            Some(ref delta) if delta.delta_type == "input_json_delta" => {
                vec![StreamChunk::delta(
                    model,
                    Message {
                        tool_calls: vec![ToolCall {
                            function: crate::provider::FunctionCall {
                                name: String::new(),
                                arguments: delta.partial_json.clone(),
                            },
                            ..Default::default()
                        }],
                        ..Default::default()
                    },
                )]
            }
            _ => vec![],
        },
        "message_delta" => {
            // Carries the final output token count; forward as a bare usage
            // chunk so the egress side can account it.
            match event.usage {
                Some(ref usage) => {
                    let mut chunk = StreamChunk::delta(model, Message::default());
                    chunk.choices.clear();
                    chunk.usage = Some(Usage::new(usage.input_tokens, usage.output_tokens));
                    vec![chunk]
                }
                None => vec![],
            }
        }
        _ => vec![],
    }
}

// ============================================================================
// Tests
// ============================================================================
