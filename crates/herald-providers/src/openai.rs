//! OpenAI-compatible adapter (chat completions).
//!
//! Works with OpenAI cloud, Ollama, vLLM, llama.cpp server, LM Studio, or
//! any endpoint implementing the chat completions API. Reasoning blocks are
//! not modeled by this family; system prompts are a single concatenated
//! string (caching, where it exists, is server-side).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use herald_core::config::ModelConfig;
use herald_core::types::{ContentBlock, Message, SystemBlock, ToolCall, ToolResultContent, ToolSchema, Usage};

use crate::{normalize_tool_arguments, LlmResponse, Provider, ProviderError, StopReason};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug)]
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    base_url: String,
}

impl OpenAiCompatProvider {
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
        })
    }

    /// Convert neutral content blocks to the chat-completions shape. Images
    /// become data-URI `image_url` entries.
    fn convert_blocks(blocks: &[ContentBlock]) -> Value {
        let converted: Vec<Value> = blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
                ContentBlock::Image { media_type, data } => json!({
                    "type": "image_url",
                    "image_url": { "url": format!("data:{media_type};base64,{data}") },
                }),
            })
            .collect();
        Value::Array(converted)
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compat"
    }

    fn format_tools(&self, tools: &[ToolSchema]) -> Value {
        let formatted: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    },
                })
            })
            .collect();
        Value::Array(formatted)
    }

    fn format_system(&self, blocks: &[SystemBlock]) -> Value {
        Value::String(
            blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
        )
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
                Message::Assistant { text, tool_calls, .. } => {
                    let mut entry = json!({ "role": "assistant" });
                    match text {
                        Some(t) if !t.is_empty() => entry["content"] = json!(t),
                        _ => {
                            if tool_calls.is_empty() {
                                entry["content"] = json!("");
                            }
                        }
                    }
                    if !tool_calls.is_empty() {
                        let calls: Vec<Value> = tool_calls
                            .iter()
                            .map(|tc| {
                                json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": tc.arguments.to_string(),
                                    },
                                })
                            })
                            .collect();
                        entry["tool_calls"] = Value::Array(calls);
                    }
                    result.push(entry);
                }
                Message::ToolResults { results } => {
                    // One "tool" role message per result — this family has no
                    // grouped tool_result block.
                    for r in results {
                        let content = match &r.content {
                            ToolResultContent::Text(t) => t.clone(),
                            ToolResultContent::Blocks(_) => {
                                serde_json::to_string(&r.content).unwrap_or_default()
                            }
                        };
                        result.push(json!({
                            "role": "tool",
                            "tool_call_id": r.tool_call_id,
                            "content": content,
                        }));
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
        let mut api_messages: Vec<Value> = Vec::new();
        if system.as_str().map(|s| !s.is_empty()).unwrap_or(false) {
            api_messages.push(json!({ "role": "system", "content": system }));
        }
        if let Some(arr) = messages.as_array() {
            api_messages.extend(arr.iter().cloned());
        }

        let mut body = json!({
            "model": self.model,
            "messages": api_messages,
            "max_tokens": self.max_tokens,
        });
        if tools.as_array().map(|a| !a.is_empty()).unwrap_or(false) {
            body["tools"] = tools.clone();
        }

        let url = format!("{}/chat/completions", self.base_url);
        debug!(model = %self.model, "sending request to OpenAI-compatible endpoint");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "OpenAI API error");
            return Err(ProviderError::Api { status, message: text });
        }

        let raw: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        let api: ApiResponse = serde_json::from_value(raw.clone())
            .map_err(|e| ProviderError::Parse(e.to_string()))?;
        Ok(parse_response(api, raw))
    }
}

fn parse_response(resp: ApiResponse, raw: Value) -> LlmResponse {
    let choice = resp.choices.into_iter().next();

    let text = choice
        .as_ref()
        .and_then(|c| c.message.content.clone())
        .filter(|t| !t.is_empty());

    let tool_calls: Vec<ToolCall> = choice
        .as_ref()
        .and_then(|c| c.message.tool_calls.as_ref())
        .map(|calls| {
            calls
                .iter()
                .map(|tc| ToolCall {
                    id: tc.id.clone(),
                    name: tc.function.name.clone(),
                    arguments: normalize_tool_arguments(Value::String(
                        tc.function.arguments.clone(),
                    )),
                })
                .collect()
        })
        .unwrap_or_default();

    let stop_reason = match choice.and_then(|c| c.finish_reason).as_deref() {
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    };

    LlmResponse {
        text,
        tool_calls,
        stop_reason,
        usage: Usage {
            input_tokens: resp.usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            output_tokens: resp.usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
            cache_read_tokens: 0,
            cache_write_tokens: 0,
        },
        thinking: None,
        thinking_block: None,
        raw,
    }
}

// Chat completions response types (private — deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::types::{ToolResultEntry, UserContent};

    fn provider() -> OpenAiCompatProvider {
        OpenAiCompatProvider::new(
            "test-key".into(),
            ModelConfig {
                provider: "openai-compat".into(),
                model: "gpt-4o".into(),
                ..ModelConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn tools_are_wrapped_in_function_envelopes() {
        let p = provider();
        let tools = p.format_tools(&[ToolSchema {
            name: "read".into(),
            description: "Read a file".into(),
            input_schema: json!({"type": "object"}),
        }]);
        assert_eq!(tools[0]["type"], "function");
        assert_eq!(tools[0]["function"]["name"], "read");
        assert_eq!(tools[0]["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn system_blocks_concatenate_to_one_string() {
        let p = provider();
        let system = p.format_system(&[
            SystemBlock::new("a", herald_core::types::Tier::Stable),
            SystemBlock::new("b", herald_core::types::Tier::Dynamic),
        ]);
        assert_eq!(system, json!("a\n\nb"));
    }

    #[test]
    fn tool_round_trip_uses_tool_role_messages() {
        let p = provider();
        let messages = vec![
            Message::user("do it", "", ""),
            Message::Assistant {
                text: Some("on it".into()),
                tool_calls: vec![ToolCall {
                    id: "call_1".into(),
                    name: "echo".into(),
                    arguments: json!({"text": "ping"}),
                }],
                thinking: None,
                thinking_block: None,
                usage: Usage::default(),
            },
            Message::ToolResults {
                results: vec![ToolResultEntry {
                    tool_call_id: "call_1".into(),
                    content: ToolResultContent::Text("ping".into()),
                }],
            },
        ];
        let formatted = p.format_messages(&messages);
        let assistant = &formatted[1];
        assert_eq!(assistant["content"], "on it");
        assert_eq!(assistant["tool_calls"][0]["id"], "call_1");
        assert_eq!(
            assistant["tool_calls"][0]["function"]["arguments"],
            r#"{"text":"ping"}"#
        );
        let tool_msg = &formatted[2];
        assert_eq!(tool_msg["role"], "tool");
        assert_eq!(tool_msg["tool_call_id"], "call_1");
        assert_eq!(tool_msg["content"], "ping");
    }

    #[test]
    fn images_become_data_uris() {
        let p = provider();
        let messages = vec![Message::User {
            content: UserContent::Blocks(vec![ContentBlock::Image {
                media_type: "image/jpeg".into(),
                data: "eHk=".into(),
            }]),
            sender: String::new(),
            source: String::new(),
        }];
        let formatted = p.format_messages(&messages);
        assert_eq!(
            formatted[0]["content"][0]["image_url"]["url"],
            "data:image/jpeg;base64,eHk="
        );
    }

    #[test]
    fn finish_reasons_map_to_canonical_stops() {
        for (reason, expected) in [
            ("tool_calls", StopReason::ToolUse),
            ("length", StopReason::MaxTokens),
            ("stop", StopReason::EndTurn),
        ] {
            let raw = json!({
                "choices": [{
                    "message": {"content": "x"},
                    "finish_reason": reason,
                }],
                "usage": {"prompt_tokens": 1, "completion_tokens": 1},
            });
            let api: ApiResponse = serde_json::from_value(raw.clone()).unwrap();
            assert_eq!(parse_response(api, raw).stop_reason, expected);
        }
    }

    #[test]
    fn malformed_function_arguments_fall_back_to_raw() {
        let raw = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "echo", "arguments": "{broken"},
                    }],
                },
                "finish_reason": "tool_calls",
            }],
        });
        let api: ApiResponse = serde_json::from_value(raw.clone()).unwrap();
        let resp = parse_response(api, raw);
        assert_eq!(resp.tool_calls[0].arguments, json!({"raw": "{broken"}));
        assert_eq!(resp.usage.input_tokens, 0);
    }
}
