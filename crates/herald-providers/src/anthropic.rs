//! Anthropic-compatible adapter (Messages API).
//!
//! Works with any endpoint speaking the Anthropic Messages wire protocol.
//! Supports prompt caching (`cache_control` markers on stable system blocks)
//! and extended thinking in adaptive or budgeted mode. When thinking is
//! enabled the request streams and the SSE events are accumulated into a
//! final message — long reasoning chains would otherwise hit HTTP timeouts.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use herald_core::config::ModelConfig;
use herald_core::types::{ContentBlock, Message, SystemBlock, Tier, ToolCall, ToolResultContent, ToolSchema, Usage};

use crate::sse::{parse_sse_line, SseParsed};
use crate::{normalize_tool_arguments, LlmResponse, Provider, ProviderError, StopReason};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

#[derive(Debug)]
pub struct AnthropicCompatProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    base_url: String,
    cache_control: bool,
    thinking_mode: String,
    thinking_budget: u32,
    thinking_effort: String,
}

impl AnthropicCompatProvider {
    pub fn new(api_key: String, cfg: ModelConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("HTTP client init failed: {e}")))?;
        let base_url = if cfg.base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            cfg.base_url.trim_end_matches('/').to_string()
        };
        Ok(Self {
            client,
            api_key,
            model: cfg.model,
            max_tokens: cfg.max_tokens,
            base_url,
            cache_control: cfg.cache_control,
            thinking_mode: cfg.thinking_mode,
            thinking_budget: cfg.thinking_budget,
            thinking_effort: cfg.thinking_effort,
        })
    }

    /// Build the `thinking` request parameter from config. `None` = off.
    fn thinking_param(&self) -> Option<Value> {
        match self.thinking_mode.as_str() {
            "disabled" | "" => None,
            "adaptive" => {
                let mut param = json!({ "type": "adaptive" });
                if !self.thinking_effort.is_empty() {
                    param["effort"] = json!(self.thinking_effort);
                }
                Some(param)
            }
            "budgeted" => Some(json!({
                "type": "enabled",
                "budget_tokens": self.thinking_budget,
            })),
            other => {
                warn!(mode = other, "unknown thinking_mode, thinking disabled");
                None
            }
        }
    }

    /// Convert neutral content blocks to the Messages API shape. Plain text
    /// passes through as a string; image blocks become nested base64 sources.
    fn convert_blocks(blocks: &[ContentBlock]) -> Value {
        let converted: Vec<Value> = blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
                ContentBlock::Image { media_type, data } => json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": media_type,
                        "data": data,
                    },
                }),
            })
            .collect();
        Value::Array(converted)
    }
}

#[async_trait]
impl Provider for AnthropicCompatProvider {
    fn name(&self) -> &str {
        "anthropic-compat"
    }

    fn format_tools(&self, tools: &[ToolSchema]) -> Value {
        let formatted: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        Value::Array(formatted)
    }

    fn format_system(&self, blocks: &[SystemBlock]) -> Value {
        let formatted: Vec<Value> = blocks
            .iter()
            .map(|block| {
                let mut entry = json!({ "type": "text", "text": block.text });
                if self.cache_control && matches!(block.tier, Tier::Stable | Tier::SemiStable) {
                    entry["cache_control"] = json!({ "type": "ephemeral" });
                }
                entry
            })
            .collect();
        Value::Array(formatted)
    }

    fn format_messages(&self, messages: &[Message]) -> Value {
        let mut result: Vec<Value> = Vec::new();

        for msg in messages {
            match msg {
                Message::User { content, .. } => {
                    let content = match content {
                        herald_core::types::UserContent::Text(t) => Value::String(t.clone()),
                        herald_core::types::UserContent::Blocks(blocks) => Self::convert_blocks(blocks),
                    };
                    result.push(json!({ "role": "user", "content": content }));
                }
                Message::Assistant {
                    text,
                    tool_calls,
                    thinking,
                    thinking_block,
                    ..
                } => {
                    let mut blocks: Vec<Value> = Vec::new();
                    // The signed block must be echoed back verbatim; the API
                    // rejects tool-result turns whose reasoning block was
                    // altered or dropped.
                    if let Some(block) = thinking_block {
                        blocks.push(block.clone());
                    } else if let Some(thinking) = thinking {
                        blocks.push(json!({ "type": "thinking", "thinking": thinking }));
                    }
                    if let Some(text) = text {
                        if !text.is_empty() {
                            blocks.push(json!({ "type": "text", "text": text }));
                        }
                    }
                    for tc in tool_calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments,
                        }));
                    }
                    if !blocks.is_empty() {
                        result.push(json!({ "role": "assistant", "content": blocks }));
                    }
                }
                Message::ToolResults { results } => {
                    let blocks: Vec<Value> = results
                        .iter()
                        .map(|r| {
                            let content = match &r.content {
                                ToolResultContent::Text(t) => Value::String(t.clone()),
                                ToolResultContent::Blocks(blocks) => Self::convert_blocks(blocks),
                            };
                            json!({
                                "type": "tool_result",
                                "tool_use_id": r.tool_call_id,
                                "content": content,
                            })
                        })
                        .collect();
                    if !blocks.is_empty() {
                        result.push(json!({ "role": "user", "content": blocks }));
                    }
                }
            }
        }

        Value::Array(result)
    }

    async fn complete(
        &self,
        system: &Value,
        messages: &Value,
        tools: &Value,
    ) -> Result<LlmResponse, ProviderError> {
        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": messages,
        });
        if tools.as_array().map(|a| !a.is_empty()).unwrap_or(false) {
            body["tools"] = tools.clone();
        }
        let thinking = self.thinking_param();
        if let Some(param) = &thinking {
            body["thinking"] = param.clone();
        }

        let url = format!("{}/v1/messages", self.base_url);
        debug!(model = %self.model, streaming = thinking.is_some(), "sending request to Anthropic");

        let raw = if thinking.is_some() {
            body["stream"] = json!(true);
            let resp = self.send_request(&url, &body).await?;
            collect_stream(resp).await?
        } else {
            let resp = self.send_request(&url, &body).await?;
            resp.json::<Value>()
                .await
                .map_err(|e| ProviderError::Parse(e.to_string()))?
        };

        let api: ApiResponse = serde_json::from_value(raw.clone())
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(parse_response(api, raw))
    }
}

impl AnthropicCompatProvider {
    async fn send_request(&self, url: &str, body: &Value) -> Result<reqwest::Response, ProviderError> {
        let resp = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Anthropic API error");
            return Err(ProviderError::Api { status, message: text });
        }
        Ok(resp)
    }
}

/// Accumulate a Messages-API SSE stream into the equivalent non-streaming
/// response body, so both paths share one parser.
async fn collect_stream(resp: reqwest::Response) -> Result<Value, ProviderError> {
    use futures_util::StreamExt;

    let mut model = String::new();
    let mut stop_reason: Option<String> = None;
    let mut usage = json!({});
    let mut blocks: Vec<Value> = Vec::new();
    let mut builder: Option<BlockBuilder> = None;

    let mut current_event = String::new();
    let mut line_buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(ProviderError::Http)?;
        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };

        line_buf.push_str(text);
        let lines: Vec<&str> = line_buf.split('\n').collect();
        let (complete, remainder) = lines.split_at(lines.len() - 1);
        let remainder = remainder.first().unwrap_or(&"").to_string();

        for line in complete {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_sse_line(line) {
                Some(SseParsed::Event(ev)) => current_event = ev,
                Some(SseParsed::Data(data)) => {
                    apply_stream_event(
                        &current_event,
                        &data,
                        &mut model,
                        &mut stop_reason,
                        &mut usage,
                        &mut blocks,
                        &mut builder,
                    )?;
                }
                None => {}
            }
        }

        line_buf = remainder;
    }

    // A block left open by a truncated stream still carries useful content.
    if let Some(b) = builder.take() {
        blocks.push(b.finish());
    }

    Ok(json!({
        "model": model,
        "content": blocks,
        "stop_reason": stop_reason,
        "usage": usage,
    }))
}

fn apply_stream_event(
    event_type: &str,
    data: &str,
    model: &mut String,
    stop_reason: &mut Option<String>,
    usage: &mut Value,
    blocks: &mut Vec<Value>,
    builder: &mut Option<BlockBuilder>,
) -> Result<(), ProviderError> {
    match event_type {
        "message_start" => {
            if let Ok(start) = serde_json::from_str::<Value>(data) {
                if let Some(m) = start["message"]["model"].as_str() {
                    *model = m.to_string();
                }
                if start["message"]["usage"].is_object() {
                    *usage = start["message"]["usage"].clone();
                }
            }
        }
        "content_block_start" => {
            if let Some(b) = builder.take() {
                blocks.push(b.finish());
            }
            if let Ok(start) = serde_json::from_str::<Value>(data) {
                *builder = Some(BlockBuilder::start(start["content_block"].clone()));
            }
        }
        "content_block_delta" => {
            if let (Some(b), Ok(delta)) = (builder.as_mut(), serde_json::from_str::<Value>(data)) {
                b.apply_delta(&delta["delta"]);
            }
        }
        "content_block_stop" => {
            if let Some(b) = builder.take() {
                blocks.push(b.finish());
            }
        }
        "message_delta" => {
            if let Ok(delta) = serde_json::from_str::<Value>(data) {
                if let Some(reason) = delta["delta"]["stop_reason"].as_str() {
                    *stop_reason = Some(reason.to_string());
                }
                if let Some(out) = delta["usage"]["output_tokens"].as_u64() {
                    usage["output_tokens"] = json!(out);
                }
            }
        }
        "error" => {
            return Err(ProviderError::Api {
                status: 0,
                message: data.to_string(),
            });
        }
        // message_stop, ping, unknown — nothing to do
        _ => {}
    }
    Ok(())
}

/// Accumulates one streamed content block until `content_block_stop`.
struct BlockBuilder {
    start: Value,
    kind: String,
    text: String,
    thinking: String,
    signature: String,
    partial_json: String,
}

impl BlockBuilder {
    fn start(content_block: Value) -> Self {
        let kind = content_block["type"].as_str().unwrap_or_default().to_string();
        Self {
            start: content_block,
            kind,
            text: String::new(),
            thinking: String::new(),
            signature: String::new(),
            partial_json: String::new(),
        }
    }

    fn apply_delta(&mut self, delta: &Value) {
        match delta["type"].as_str().unwrap_or_default() {
            "text_delta" => {
                if let Some(t) = delta["text"].as_str() {
                    self.text.push_str(t);
                }
            }
            "thinking_delta" => {
                if let Some(t) = delta["thinking"].as_str() {
                    self.thinking.push_str(t);
                }
            }
            "signature_delta" => {
                if let Some(s) = delta["signature"].as_str() {
                    self.signature.push_str(s);
                }
            }
            "input_json_delta" => {
                if let Some(p) = delta["partial_json"].as_str() {
                    self.partial_json.push_str(p);
                }
            }
            _ => {}
        }
    }

    fn finish(self) -> Value {
        match self.kind.as_str() {
            "text" => json!({ "type": "text", "text": self.text }),
            "thinking" => {
                let mut block = json!({ "type": "thinking", "thinking": self.thinking });
                if !self.signature.is_empty() {
                    block["signature"] = json!(self.signature);
                }
                block
            }
            "tool_use" => {
                let input = serde_json::from_str::<Value>(&self.partial_json)
                    .unwrap_or_else(|_| json!({}));
                json!({
                    "type": "tool_use",
                    "id": self.start["id"].clone(),
                    "name": self.start["name"].clone(),
                    "input": input,
                })
            }
            // redacted_thinking and anything unknown arrive complete in the
            // start event
            _ => self.start,
        }
    }
}

fn parse_response(resp: ApiResponse, raw: Value) -> LlmResponse {
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut thinking_text: Option<String> = None;
    let mut thinking_block: Option<Value> = None;

    for block in resp.content {
        match block {
            WireBlock::Text { text } => text_parts.push(text),
            WireBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id,
                name,
                arguments: normalize_tool_arguments(input),
            }),
            WireBlock::Thinking { thinking, signature } => {
                let mut block = json!({ "type": "thinking", "thinking": thinking });
                if let Some(sig) = &signature {
                    block["signature"] = json!(sig);
                }
                thinking_text = Some(thinking);
                thinking_block = Some(block);
            }
            WireBlock::RedactedThinking { data } => {
                if thinking_block.is_none() {
                    thinking_block = Some(json!({ "type": "redacted_thinking", "data": data }));
                }
            }
            WireBlock::Unknown => {}
        }
    }

    let stop_reason = match resp.stop_reason.as_deref() {
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    };

    LlmResponse {
        text: if text_parts.is_empty() {
            None
        } else {
            Some(text_parts.join("\n"))
        },
        tool_calls,
        stop_reason,
        usage: Usage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
            cache_read_tokens: resp.usage.cache_read_input_tokens.unwrap_or(0),
            cache_write_tokens: resp.usage.cache_creation_input_tokens.unwrap_or(0),
        },
        thinking: thinking_text,
        thinking_block,
        raw,
    }
}

// Messages API response types (private — deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    #[allow(dead_code)]
    #[serde(default)]
    model: String,
    content: Vec<WireBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum WireBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: Option<String>,
    },
    #[serde(rename = "redacted_thinking")]
    RedactedThinking { data: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
}
