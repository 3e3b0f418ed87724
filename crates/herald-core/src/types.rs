//! Shared message and work-item types.
//!
//! The internal message shape is provider-neutral: adapters in
//! `herald-providers` translate it to each vendor's wire format, and the
//! session store serializes it verbatim into snapshots and audit events.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Token counters reported by a provider for one completion. Zero when the
/// vendor did not report a value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

/// A tool invocation requested by the model.
///
/// `arguments` is always a JSON object: adapters normalize malformed
/// payloads to `{"raw": <literal>}` instead of failing the turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One typed block inside a user message or tool result. Block lists never
/// nest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Image { media_type: String, data: String },
}

/// User message content: plain text, or an ordered block list when the
/// message carries images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl UserContent {
    /// Concatenated text of all text blocks (block images contribute nothing).
    pub fn text(&self) -> String {
        match self {
            UserContent::Text(t) => t.clone(),
            UserContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

impl From<String> for UserContent {
    fn from(text: String) -> Self {
        UserContent::Text(text)
    }
}

impl From<&str> for UserContent {
    fn from(text: &str) -> Self {
        UserContent::Text(text.to_string())
    }
}

/// Content of a single tool result: a string in the common case, or an
/// image-block list for tools that return pictures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl ToolResultContent {
    pub fn text(&self) -> String {
        match self {
            ToolResultContent::Text(t) => t.clone(),
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    ContentBlock::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// One entry of a tool-results message, paired by id with the tool_use block
/// of the preceding assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultEntry {
    pub tool_call_id: String,
    pub content: ToolResultContent,
}

/// Internal conversation message.
///
/// System-injected notes (compaction continuity markers, pending warnings)
/// are `User` messages whose text carries a `[system: …]` marker — there is
/// no fourth serialized role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    User {
        content: UserContent,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        sender: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        source: String,
    },
    Assistant {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking: Option<String>,
        /// Opaque vendor reasoning block (with signature). Echoed back
        /// verbatim on the next request — required for tool-use continuity.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking_block: Option<serde_json::Value>,
        #[serde(default)]
        usage: Usage,
    },
    ToolResults {
        results: Vec<ToolResultEntry>,
    },
}

impl Message {
    pub fn user(text: impl Into<String>, sender: impl Into<String>, source: impl Into<String>) -> Self {
        Message::User {
            content: UserContent::Text(text.into()),
            sender: sender.into(),
            source: source.into(),
        }
    }
}

/// Cache tier of a system prompt block. Providers that support prompt
/// caching mark `Stable` and `SemiStable` blocks with their cache marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Stable,
    SemiStable,
    Dynamic,
}

/// One block of the system prompt, with its cache tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    pub text: String,
    pub tier: Tier,
}

impl SystemBlock {
    pub fn new(text: impl Into<String>, tier: Tier) -> Self {
        Self { text: text.into(), tier }
    }
}

/// Tool descriptor as exposed to providers — no handler reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// An attachment decoded from an inbound request and saved to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedAttachment {
    pub content_type: String,
    pub local_path: String,
    pub filename: String,
    pub size: u64,
}

/// Metadata echoed back to the configured webhook for `/notify` items.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "ref")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Where the dispatcher delivers the reply for a work item.
#[derive(Debug)]
pub enum ReplyPath {
    /// Synchronous HTTP request awaiting a JSON reply.
    Http(oneshot::Sender<serde_json::Value>),
    /// Message arrived through the chat transport; reply via the channel.
    Channel,
    /// Automated system notification; optional webhook echo-back.
    System { notify_meta: Option<NotifyMeta> },
}

/// A dequeued request for the dispatcher.
#[derive(Debug)]
pub struct WorkItem {
    pub sender: String,
    /// Routing label ("http", "system", or the channel name).
    pub source: String,
    pub text: String,
    pub tier: String,
    pub attachments: Vec<SavedAttachment>,
    pub reply: ReplyPath,
}
