//! Messaging tools — channel-agnostic message sending and reactions.
//!
//! Both tools talk to the transport through the `Channel` trait; the daemon
//! wires the concrete adapter at startup. Tool descriptions embed the
//! configured contact names so the model addresses real recipients.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use herald_core::channel::Channel;

use crate::filesystem::PathAllowlist;
use crate::{parse_args, Tool, ToolError};

/// Look up the timestamp of the last inbound message from a sender.
pub type TimestampLookup = Arc<dyn Fn(&str) -> Option<i64> + Send + Sync>;

fn target_description(contacts: &[String]) -> String {
    if contacts.is_empty() {
        "Recipient contact name. No contacts configured — check deployment config.".to_string()
    } else {
        format!(
            "Recipient contact name (case-insensitive). Available contacts: {}. Self-sends are blocked.",
            contacts.join(", ")
        )
    }
}

pub struct MessageTool {
    channel: Option<Arc<dyn Channel>>,
    allowlist: Arc<PathAllowlist>,
    contacts: Vec<String>,
}

impl MessageTool {
    pub fn new(
        channel: Option<Arc<dyn Channel>>,
        allowlist: Arc<PathAllowlist>,
        contacts: Vec<String>,
    ) -> Self {
        Self {
            channel,
            allowlist,
            contacts,
        }
    }
}

#[derive(Deserialize)]
struct MessageArgs {
    target: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    attachments: Vec<String>,
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }

    fn description(&self) -> String {
        "Send a message (text and/or file attachments) to a contact. \
         In system/HTTP sessions, your text replies are NOT delivered — \
         this tool is the only way to notify the operator."
            .into()
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "target": {"type": "string", "description": target_description(&self.contacts)},
                "text": {"type": "string", "description": "Message text to send"},
                "attachments": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "List of absolute file paths to send as attachments",
                },
            },
            "required": ["target"],
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let args: MessageArgs = parse_args(arguments)?;
        let Some(channel) = &self.channel else {
            return Ok("Error: No channel configured".to_string());
        };
        if args.text.is_empty() && args.attachments.is_empty() {
            return Ok("Error: Must provide text or attachments".to_string());
        }
        for path in &args.attachments {
            if self.allowlist.check(path).is_err() {
                return Ok(format!("Error: Attachment path not allowed: {path}"));
            }
        }

        match channel.send(&args.target, &args.text, &args.attachments).await {
            Ok(()) => {
                let mut parts = Vec::new();
                if !args.text.is_empty() {
                    parts.push("text".to_string());
                }
                if !args.attachments.is_empty() {
                    parts.push(format!("{} attachment(s)", args.attachments.len()));
                }
                Ok(format!("Sent {} to {}", parts.join(" + "), args.target))
            }
            Err(e) => {
                warn!(target = %args.target, error = %e, "message delivery failed");
                Ok("Error: Message delivery failed".to_string())
            }
        }
    }
}

pub struct ReactTool {
    channel: Option<Arc<dyn Channel>>,
    timestamps: Option<TimestampLookup>,
    contacts: Vec<String>,
}

impl ReactTool {
    pub fn new(
        channel: Option<Arc<dyn Channel>>,
        timestamps: Option<TimestampLookup>,
        contacts: Vec<String>,
    ) -> Self {
        Self {
            channel,
            timestamps,
            contacts,
        }
    }
}

#[derive(Deserialize)]
struct ReactArgs {
    target: String,
    emoji: String,
    #[serde(default)]
    sender: String,
}

#[async_trait]
impl Tool for ReactTool {
    fn name(&self) -> &str {
        "react"
    }

    fn description(&self) -> String {
        "Send an emoji reaction to the last message from a contact.".into()
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "target": {"type": "string", "description": target_description(&self.contacts)},
                "emoji": {
                    "type": "string",
                    "description": "Reaction emoji supported by the transport.",
                    "enum": [
                        "❤", "👍", "👎", "🔥", "🥰", "👏", "😁", "🤔", "🤯", "😱",
                        "😢", "🎉", "🤩", "🙏", "👌", "💯", "🤣", "⚡", "🏆", "😎",
                    ],
                },
                "sender": {
                    "type": "string",
                    "description": "Contact who sent the message to react to. Leave empty to react to target's last message (most common).",
                },
            },
            "required": ["target", "emoji"],
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let args: ReactArgs = parse_args(arguments)?;
        let Some(channel) = &self.channel else {
            return Ok("Error: No channel configured".to_string());
        };
        let Some(timestamps) = &self.timestamps else {
            return Ok("Error: Timestamp tracking not configured".to_string());
        };
        let who = if args.sender.is_empty() {
            args.target.as_str()
        } else {
            args.sender.as_str()
        };
        let Some(ts) = timestamps(who) else {
            return Ok(format!("Error: No recent message timestamp for {who}"));
        };

        match channel.send_reaction(&args.target, &args.emoji, ts).await {
            Ok(()) => Ok(format!(
                "Reacted with {} to {}'s last message",
                args.emoji, args.target
            )),
            Err(e) => {
                warn!(target = %args.target, error = %e, "reaction failed");
                Ok("Error: Reaction failed".to_string())
            }
        }
    }
}
