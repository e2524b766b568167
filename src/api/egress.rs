//! Egress shaping: emitting vendor-correct response envelopes and SSE
//! sequences toward the client.
//!
//! The OpenAI egress is trivial (canonical chunks serialize as-is, the
//! stream ends with `data: [DONE]`). The Anthropic egress synthesizes the
//! full named-event sequence from canonical chunks:
//!
//! `message_start, content_block_start, (content_block_delta |
//! content_block_stop content_block_start)*, content_block_stop,
//! message_delta, message_stop`
//!
//! A text block is pre-opened at index 0; tool calls close the current block
//! and open a `tool_use` block at the next index; text arriving after a tool
//! block re-opens a fresh text block. Events are emitted synchronously per
//! canonical chunk to preserve the typewriter effect.

use serde_json::json;

use crate::provider::sse::{format_sse_data, format_sse_event};
use crate::provider::{ChatResponse, StreamChunk};

// ============================================================================
// OpenAI Egress
// ============================================================================

/// Serialize a canonical chunk as an OpenAI SSE frame.
///
/// Usage-only chunks (empty `choices`, e.g. the Anthropic provider's
/// `message_delta` carrier) produce no frame: OpenAI `chat.completion.chunk`
/// events always carry a choice, and OpenAI clients index `choices[0]`
/// unconditionally. Their usage is accounted before frame emission.
pub fn openai_sse_frame(chunk: &StreamChunk) -> String {
    if chunk.first_delta().is_none() {
        return String::new();
    }
    match serde_json::to_string(chunk) {
        Ok(data) => format_sse_data(&data),
        Err(_) => String::new(),
    }
}

// ============================================================================
// Anthropic Egress (non-streaming)
// ============================================================================

/// Shape a canonical response as an Anthropic message envelope.
///
/// Only the first choice's text content is materialized, as a single `text`
/// block; tool calls are not re-materialized into `tool_use` blocks.
pub fn anthropic_response_body(resp: &ChatResponse, model: &str) -> serde_json::Value {
    let usage = resp.usage.clone().unwrap_or_default();
    json!({
        "id": if resp.id.is_empty() { format!("msg_{}", uuid::Uuid::new_v4().simple()) } else { resp.id.clone() },
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{"type": "text", "text": resp.first_content()}],
        "stop_reason": "end_turn",
        "stop_sequence": null,
        "usage": {
            "input_tokens": usage.prompt_tokens,
            "output_tokens": usage.completion_tokens,
        }
    })
}

// ============================================================================
// Anthropic Egress (streaming)
// ============================================================================

/// State machine synthesizing Anthropic SSE from canonical stream chunks.
pub struct AnthropicSseState {
    message_id: String,
    model: String,
    block_index: usize,
    in_tool_use: bool,
    output_tokens: i64,
}

impl AnthropicSseState {
    pub fn new(model: impl Into<String>) -> Self {
        AnthropicSseState {
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            block_index: 0,
            in_tool_use: false,
            output_tokens: 0,
        }
    }

    /// Opening events, written before any upstream chunk arrives:
    /// `message_start` plus a pre-opened empty text block at index 0.
    pub fn open(&self) -> String {
        let mut out = format_sse_event(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.message_id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "usage": {"input_tokens": 0, "output_tokens": 0},
                    "content": [],
                }
            })
            .to_string(),
        );
        out.push_str(&self.text_block_start());
        out
    }

    /// Translate one canonical chunk into zero or more SSE events.
    pub fn handle_chunk(&mut self, chunk: &StreamChunk) -> String {
        if let Some(ref usage) = chunk.usage {
            self.output_tokens += usage.completion_tokens;
        }

        let Some(delta) = chunk.first_delta() else {
            return String::new();
        };

        let mut out = String::new();

        if let Some(ref text) = delta.content {
            if !text.is_empty() {
                if self.in_tool_use {
                    // Text after a tool block: close it and open a fresh
                    // text block
                    out.push_str(&self.block_stop());
                    self.block_index += 1;
                    self.in_tool_use = false;
                    out.push_str(&self.text_block_start());
                }
                out.push_str(&format_sse_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": {"type": "text_delta", "text": text},
                    })
                    .to_string(),
                ));
            }
        }

        if let Some(call) = delta.tool_calls.first() {
            if !self.in_tool_use || !call.id.is_empty() {
                // New tool call: close the current block (the pre-opened
                // text block when nothing streamed yet) and open a tool_use
                // block at the next index.
                out.push_str(&self.block_stop());
                self.block_index += 1;
                self.in_tool_use = true;
                out.push_str(&format_sse_event(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": self.block_index,
                        "content_block": {
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.function.name,
                            "input": {},
                        }
                    })
                    .to_string(),
                ));
            }

            if !call.function.arguments.is_empty() {
                out.push_str(&format_sse_event(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": {
                            "type": "input_json_delta",
                            "partial_json": call.function.arguments,
                        },
                    })
                    .to_string(),
                ));
            }
        }

        out
    }

    /// Closing events once the upstream completes: close the open block,
    /// `message_delta` with the stop reason and accumulated output tokens,
    /// then `message_stop`.
    pub fn close(&mut self) -> String {
        let mut out = self.block_stop();
        out.push_str(&format_sse_event(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": "end_turn", "stop_sequence": null},
                "usage": {"output_tokens": self.output_tokens},
            })
            .to_string(),
        ));
        out.push_str(&format_sse_event(
            "message_stop",
            &json!({"type": "message_stop"}).to_string(),
        ));
        out
    }

    fn text_block_start(&self) -> String {
        format_sse_event(
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": {"type": "text", "text": ""},
            })
            .to_string(),
        )
    }

    fn block_stop(&self) -> String {
        format_sse_event(
            "content_block_stop",
            &json!({"type": "content_block_stop", "index": self.block_index}).to_string(),
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
