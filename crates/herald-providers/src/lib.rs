//! LLM provider abstraction.
//!
//! Two wire-protocol families are supported: the Anthropic Messages API
//! ("anthropic-compat") and OpenAI chat completions ("openai-compat").
//! Adapters normalize both into [`LlmResponse`] so the agentic loop never
//! sees vendor shapes; the `format_*` methods go the other way, shaping the
//! internal message/tool/system types into each vendor's request format.

pub mod anthropic;
pub mod openai;
mod sse;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use herald_core::config::ModelConfig;
use herald_core::types::{Message, SystemBlock, ToolCall, ToolSchema, Usage};

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Final reply — no more tool calls requested.
    EndTurn,
    /// The assistant wants tools executed before continuing.
    ToolUse,
    /// Output was cut by the max-token limit.
    MaxTokens,
}

/// Normalized response from one provider completion.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    /// Human-readable reasoning text, when the vendor exposes it.
    pub thinking: Option<String>,
    /// Opaque vendor reasoning block (with signature), preserved verbatim
    /// for tool-use continuity.
    pub thinking_block: Option<Value>,
    /// Raw vendor response body.
    pub raw: Value,
}

impl LlmResponse {
    /// Convert to the internal message shape for session storage.
    pub fn to_message(&self) -> Message {
        Message::Assistant {
            text: self.text.clone(),
            tool_calls: self.tool_calls.clone(),
            thinking: self.thinking.clone(),
            thinking_block: self.thinking_block.clone(),
            usage: self.usage,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

/// Common interface for all LLM providers.
///
/// The `format_*` methods return vendor-shaped JSON; the agentic loop treats
/// their output as opaque and passes it straight back into [`complete`].
///
/// [`complete`]: Provider::complete
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    /// Provider name for logging and error messages.
    fn name(&self) -> &str;

    /// Shape tool descriptors into the vendor's tool-declaration format.
    fn format_tools(&self, tools: &[ToolSchema]) -> Value;

    /// Shape tiered system blocks into the vendor's system-prompt format.
    fn format_system(&self, blocks: &[SystemBlock]) -> Value;

    /// Convert internal messages to the vendor's messages shape.
    fn format_messages(&self, messages: &[Message]) -> Value;

    /// Perform one completion request.
    async fn complete(
        &self,
        system: &Value,
        messages: &Value,
        tools: &Value,
    ) -> Result<LlmResponse, ProviderError>;
}

/// Factory: build a provider from a `[models.<name>]` config section.
pub fn create_provider(
    cfg: &ModelConfig,
    api_key: &str,
) -> Result<Arc<dyn Provider>, ProviderError> {
    match cfg.provider.as_str() {
        "anthropic-compat" => Ok(Arc::new(anthropic::AnthropicCompatProvider::new(
            api_key.to_string(),
            cfg.clone(),
        )?)),
        "openai-compat" => Ok(Arc::new(openai::OpenAiCompatProvider::new(
            api_key.to_string(),
            cfg.clone(),
        )?)),
        other => Err(ProviderError::Unavailable(format!(
            "unknown provider type '{other}'"
        ))),
    }
}

/// Normalize a tool-call argument payload to a JSON object.
///
/// Vendors usually return an object, but may hand back a string (or worse)
/// in edge cases. Anything that does not parse to an object becomes
/// `{"raw": <literal>}` so the turn survives.
pub(crate) fn normalize_tool_arguments(raw: Value) -> Value {
    match raw {
        Value::Object(_) => raw,
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(parsed @ Value::Object(_)) => parsed,
            _ => serde_json::json!({ "raw": s }),
        },
        other => serde_json::json!({ "raw": other }),
    }
}
