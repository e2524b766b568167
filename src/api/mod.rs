//! API layer: HTTP handlers, ingress/egress translation, the fast-path
//! reverse proxy, and the usage snooper.

pub mod auth;
pub mod egress;
pub mod handlers;
pub mod ingress;
pub mod proxy;
pub mod snooper;

// Re-export commonly used types
pub use auth::authenticate;
pub use egress::{anthropic_response_body, openai_sse_frame, AnthropicSseState};
pub use handlers::{
    chat_completions, health, list_models, messages, telemetry_sink, AppState, MAX_BODY_BYTES,
};
pub use snooper::UsageSnooper;
