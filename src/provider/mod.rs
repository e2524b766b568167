//! Upstream provider clients and the canonical message model.
//!
//! The canonical shape is OpenAI-chat-inspired: every ingress translator
//! normalizes into it and every provider client marshals out of it. Each
//! provider exposes two operations, a blocking `chat` and a channel-fed
//! `stream_chat`; new providers are a new enum variant plus one dispatch arm.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod sse;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::config::{Service, ServiceType};
use crate::core::error::Result;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAIProvider;

// ============================================================================
// Canonical Request Model
// ============================================================================

/// Message role in the canonical model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single chat message. Also used as the `delta` payload inside stream
/// chunks, where every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Only valid on role=tool messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Message {
            role: Some(role),
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Message {
            role: Some(Role::Tool),
            content: Some(content.into()),
            tool_call_id: Some(tool_call_id.into()),
            ..Default::default()
        }
    }

    /// Content with empty-string fallback, for marshalling code.
    pub fn content_str(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// A tool/function call emitted by the assistant. In stream deltas `id` and
/// `function.name` arrive once and `function.arguments` arrives in fragments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub call_type: String,
    #[serde(default)]
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        ToolCall {
            id: id.into(),
            call_type: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Arguments as a JSON-encoded string (possibly partial while streaming)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arguments: String,
}

/// A tool made available to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: ToolFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the tool parameters
    #[serde(default)]
    pub parameters: Value,
}

/// Canonical chat request (the OpenAI `/chat/completions` body is this
/// shape as-is).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
}

// ============================================================================
// Canonical Response Model
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

impl Usage {
    pub fn new(prompt_tokens: i64, completion_tokens: i64) -> Self {
        Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Canonical non-streaming chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// Text content of the first choice, if any.
    pub fn first_content(&self) -> &str {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .unwrap_or("")
    }
}

// ============================================================================
// Canonical Stream Model
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Canonical stream chunk (OpenAI `chat.completion.chunk` shape).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamChunk {
    /// Build a single-choice chunk with the given delta.
    pub fn delta(model: impl Into<String>, delta: Message) -> Self {
        StreamChunk {
            id: "chatcmpl-stream".to_string(),
            object: "chat.completion.chunk".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            choices: vec![StreamChoice {
                index: 0,
                delta,
                finish_reason: None,
            }],
            usage: None,
        }
    }

    /// First choice's delta, if the chunk carries one.
    pub fn first_delta(&self) -> Option<&Message> {
        self.choices.first().map(|c| &c.delta)
    }
}

// ============================================================================
// Provider Dispatch
// ============================================================================

/// Capacity of the chunk channel between a provider task and the egress
/// translator. Bounded so a stalled client applies backpressure upstream.
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Tagged dispatch over the supported upstream providers.
pub enum ProviderClient {
    OpenAI(OpenAIProvider),
    Anthropic(AnthropicProvider),
    Gemini(GeminiProvider),
}

impl ProviderClient {
    /// Build the client matching a service's type. Vendor aliases (deepseek,
    /// glm, yi, moonshot) speak the OpenAI protocol.
    pub fn for_service(service: &Service, http: reqwest::Client) -> Self {
        match service.service_type {
            ServiceType::Anthropic => {
                ProviderClient::Anthropic(AnthropicProvider::new(&service.base_url, http))
            }
            ServiceType::Gemini => {
                ProviderClient::Gemini(GeminiProvider::new(&service.base_url, http))
            }
            _ => ProviderClient::OpenAI(OpenAIProvider::new(&service.base_url, http)),
        }
    }

    /// Non-streaming chat completion.
    pub async fn chat(&self, req: ChatRequest, api_key: &str) -> Result<ChatResponse> {
        match self {
            ProviderClient::OpenAI(p) => p.chat(req, api_key).await,
            ProviderClient::Anthropic(p) => p.chat(req, api_key).await,
            ProviderClient::Gemini(p) => p.chat(req, api_key).await,
        }
    }

    /// Streaming chat completion. Chunks are pushed into `tx` in arrival
    /// order; the sender is dropped when the upstream stream ends. Terminal
    /// errors are returned to the caller (the spawning task forwards them
    /// over its error channel).
    pub async fn stream_chat(
        &self,
        req: ChatRequest,
        api_key: &str,
        tx: mpsc::Sender<StreamChunk>,
    ) -> Result<()> {
        match self {
            ProviderClient::OpenAI(p) => p.stream_chat(req, api_key, tx).await,
            ProviderClient::Anthropic(p) => p.stream_chat(req, api_key, tx).await,
            ProviderClient::Gemini(p) => p.stream_chat(req, api_key, tx).await,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_text_roundtrip() {
        let msg = Message::text(Role::User, "Hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"Hi"}"#);

        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role, Some(Role::User));
        assert_eq!(back.content_str(), "Hi");
    }

    #[test]
    fn test_tool_call_serialization() {
        let call = ToolCall::function("call_1", "get_weather", r#"{"city":"Oslo"}"#);
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["function"]["name"], "get_weather");
        assert_eq!(json["function"]["arguments"], r#"{"city":"Oslo"}"#);
    }

    #[test]
    fn test_delta_omits_empty_fields() {
        let chunk = StreamChunk::delta(
            "gpt-4o",
            Message {
                content: Some("hel".into()),
                ..Default::default()
            },
        );
        let json = serde_json::to_value(&chunk).unwrap();
        let delta = &json["choices"][0]["delta"];
        assert_eq!(delta["content"], "hel");
        assert!(delta.get("role").is_none());
        assert!(delta.get("tool_calls").is_none());
    }

    #[test]
    fn test_chat_request_parses_openai_body() {
        let body = r#"{
            "model": "gpt-proxy",
            "messages": [{"role": "user", "content": "Hi"}],
            "stream": false
        }"#;
        let req: ChatRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.model, "gpt-proxy");
        assert_eq!(req.messages.len(), 1);
        assert!(!req.stream);
        assert!(req.tools.is_empty());
    }

    #[test]
    fn test_chat_request_parses_tool_messages() {
        let body = r#"{
            "model": "m",
            "messages": [
                {"role": "assistant", "tool_calls": [
                    {"id": "call_1", "type": "function",
                     "function": {"name": "f", "arguments": "{}"}}
                ]},
                {"role": "tool", "tool_call_id": "call_1", "content": "42"}
            ]
        }"#;
        let req: ChatRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.messages[0].tool_calls.len(), 1);
        assert_eq!(req.messages[1].role, Some(Role::Tool));
        assert_eq!(req.messages[1].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn test_chat_response_first_content() {
        let resp: ChatResponse = serde_json::from_str(
            r#"{
                "id": "chatcmpl-1",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello"},
                             "finish_reason": "stop"}]
            }"#,
        )
        .unwrap();
        assert_eq!(resp.first_content(), "Hello");
    }

    #[test]
    fn test_usage_totals() {
        let usage = Usage::new(10, 5);
        assert_eq!(usage.total_tokens, 15);
    }
}
