//! Anthropic ingress translation.
//!
//! Clients on `/v1/messages` send Anthropic's block-structured envelope;
//! this module normalizes it into the canonical chat shape. The OpenAI
//! ingress needs no translation (the canonical shape is the OpenAI body).
//!
//! Conversion rules per source message:
//! - `text` blocks concatenate (joined with `\n`) into a text buffer.
//! - `tool_use` blocks accumulate as canonical tool_calls, their `input`
//!   object re-serialized into the arguments string.
//! - `tool_result` blocks first flush any buffered text as a user message,
//!   then emit a role=tool message keyed by `tool_use_id`.
//! - A final flush turns leftover text/tool_calls into one message.

use serde_json::Value;

use crate::provider::anthropic::AnthropicRequest;
use crate::provider::{ChatRequest, Message, Role, Tool, ToolCall, ToolFunction};

/// Flatten an Anthropic `system` value (plain string or list of text
/// blocks) into a single string.
pub fn flatten_system(system: &Value) -> String {
    match system {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => {
            let mut out = String::new();
            for block in blocks {
                if block.get("type").and_then(Value::as_str) == Some("text") {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        if !out.is_empty() {
                            out.push('\n');
                        }
                        out.push_str(text);
                    }
                }
            }
            out
        }
        _ => String::new(),
    }
}

/// Extract the text carried by a `tool_result` content value: a plain
/// string is used as-is, a block list contributes its `text` sub-blocks.
fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

/// Convert an Anthropic messages request into the canonical chat shape.
pub fn to_canonical(req: AnthropicRequest) -> ChatRequest {
    let mut messages: Vec<Message> = vec![];

    if let Some(ref system) = req.system {
        let system_text = flatten_system(system);
        if !system_text.is_empty() {
            messages.push(Message::text(Role::System, system_text));
        }
    }

    for msg in &req.messages {
        let role = match msg.role.as_str() {
            "assistant" => Role::Assistant,
            _ => Role::User,
        };

        let blocks = match &msg.content {
            Value::String(text) => {
                messages.push(Message::text(role, text.clone()));
                continue;
            }
            Value::Array(blocks) => blocks,
            _ => {
                messages.push(Message::text(role, ""));
                continue;
            }
        };

        if blocks.is_empty() {
            messages.push(Message::text(role, ""));
            continue;
        }

        let mut text_parts: Vec<&str> = vec![];
        let mut tool_calls: Vec<ToolCall> = vec![];

        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(Value::as_str) {
                        text_parts.push(text);
                    }
                }
                Some("tool_use") => {
                    let id = block.get("id").and_then(Value::as_str).unwrap_or("");
                    let name = block.get("name").and_then(Value::as_str).unwrap_or("");
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    let arguments = serde_json::to_string(&input).unwrap_or_default();
                    tool_calls.push(ToolCall::function(id, name, arguments));
                }
                Some("tool_result") => {
                    // Buffered text belongs to the turn before the result
                    if !text_parts.is_empty() {
                        messages.push(Message::text(Role::User, text_parts.join("\n")));
                        text_parts.clear();
                    }
                    let tool_use_id = block
                        .get("tool_use_id")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    let content = block
                        .get("content")
                        .map(tool_result_text)
                        .unwrap_or_default();
                    messages.push(Message::tool_result(tool_use_id, content));
                }
                // Unknown block types (images etc.) are skipped, not fatal
                _ => {}
            }
        }

        // Final flush for this source message
        if role == Role::Assistant && !tool_calls.is_empty() {
            let content = if text_parts.is_empty() {
                None
            } else {
                Some(text_parts.join("\n"))
            };
            messages.push(Message {
                role: Some(Role::Assistant),
                content,
                tool_calls,
                tool_call_id: None,
            });
        } else if !text_parts.is_empty() {
            messages.push(Message::text(role, text_parts.join("\n")));
        }
    }

    let tools = req
        .tools
        .into_iter()
        .map(|t| Tool {
            tool_type: "function".to_string(),
            function: ToolFunction {
                name: t.name,
                description: t.description,
                parameters: t.input_schema,
            },
        })
        .collect();

    ChatRequest {
        model: req.model,
        messages,
        tools,
        tool_choice: None,
        temperature: req.temperature,
        max_tokens: req.max_tokens,
        stream: req.stream,
    }
}
