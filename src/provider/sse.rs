//! Server-Sent Events parsing and formatting.
//!
//! Upstream SSE bodies arrive as arbitrary byte chunks; the parser buffers
//! until a full `\n\n`-terminated event is available and tolerates frames
//! split across reads. Malformed frames are dropped by callers, never fatal.

/// A parsed SSE event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: Option<String>,
}

/// Incremental SSE parser over a byte stream.
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        SseParser {
            buffer: String::new(),
        }
    }

    /// Feed incoming bytes and return the complete events they finish.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let chunk_str = match std::str::from_utf8(chunk) {
            Ok(s) => s,
            Err(_) => return vec![],
        };

        self.buffer.push_str(chunk_str);

        let mut events = vec![];
        while let Some(pos) = self.buffer.find("\n\n") {
            let block = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);

            let mut event = SseEvent::default();
            for line in block.lines() {
                let line = line.strip_suffix('\r').unwrap_or(line);
                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                if let Some((field, value)) = line.split_once(':') {
                    let value = value.strip_prefix(' ').unwrap_or(value);
                    match field {
                        "event" => event.event = Some(value.to_string()),
                        "data" => match event.data {
                            Some(ref mut data) => {
                                data.push('\n');
                                data.push_str(value);
                            }
                            None => event.data = Some(value.to_string()),
                        },
                        _ => {}
                    }
                }
            }

            if event.data.is_some() || event.event.is_some() {
                events.push(event);
            }
        }

        events
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a named SSE event for transmission.
pub fn format_sse_event(event: &str, data: &str) -> String {
    format!("event: {}\ndata: {}\n\n", event, data)
}

/// Format a data-only SSE frame.
pub fn format_sse_data(data: &str) -> String {
    format!("data: {}\n\n", data)
}

/// The OpenAI stream terminator.
pub fn format_sse_done() -> String {
    "data: [DONE]\n\n".to_string()
}
