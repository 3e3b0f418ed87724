//! Summarizing compaction — collapse the oldest two-thirds of a session
//! into a single synthetic user message.
//!
//! The transcript handed to the summarizer must include tool calls and tool
//! results, not just user/assistant text — without them the summaries go
//! opaque ("the assistant did some work") and downstream turns lose the
//! thread. Failure leaves the session untouched.

use serde_json::Value;
use tracing::{error, info};

use herald_core::types::{Message, SystemBlock, Tier};
use herald_providers::Provider;
use herald_sessions::Session;

/// Cap on tool arguments / tool results quoted into the transcript.
const TRANSCRIPT_SNIPPET_LIMIT: usize = 2000;

/// Continuity marker appended after the summary so the model knows what
/// happened to its context.
const CONTINUITY_MARKER: &str = "[system: This conversation was compacted. The summary above covers \
     earlier messages. Some details may be lost.]";

/// Compact a session's oldest messages via the summarization provider.
/// Returns true when a compaction actually happened.
pub async fn compact_session(
    session: &mut Session,
    provider: &dyn Provider,
    compaction_prompt: &str,
) -> bool {
    if session.messages.len() < 4 {
        return false;
    }

    let split_point = session.messages.len() * 2 / 3;
    let old_messages = session.messages[..split_point].to_vec();
    let recent_messages = session.messages[split_point..].to_vec();

    let transcript = build_transcript(&old_messages);
    if transcript.trim().is_empty() {
        return false;
    }

    let summary_request = vec![Message::user(
        format!("{compaction_prompt}\n\n---\n\n{transcript}"),
        "",
        "",
    )];
    let fmt_system = provider.format_system(&[SystemBlock::new(
        "You are a conversation summarizer.",
        Tier::Stable,
    )]);
    let fmt_messages = provider.format_messages(&summary_request);

    let response = match provider
        .complete(&fmt_system, &fmt_messages, &Value::Array(Vec::new()))
        .await
    {
        Ok(response) => response,
        Err(e) => {
            error!(session = %session.id, error = %e, "compaction failed");
            return false;
        }
    };
    let summary = response.text.clone().unwrap_or_default();

    let mut new_messages = vec![
        Message::user(format!("[Previous conversation summary]\n{summary}"), "", ""),
        Message::user(CONTINUITY_MARKER, "", ""),
    ];
    new_messages.extend(recent_messages.iter().cloned());

    match session.record_compaction(new_messages, old_messages.len(), &summary, response.usage) {
        Ok(()) => {
            info!(
                session = %session.id,
                removed = old_messages.len(),
                kept = recent_messages.len(),
                "compacted session"
            );
            true
        }
        Err(e) => {
            error!(session = %session.id, error = %e, "failed to persist compaction");
            false
        }
    }
}

/// Serialize messages to a prose transcript, including tool calls and tool
/// results.
fn build_transcript(messages: &[Message]) -> String {
    let mut out = String::new();
    let snippet = |s: &str| -> String { s.chars().take(TRANSCRIPT_SNIPPET_LIMIT).collect() };

    for message in messages {
        match message {
            Message::User { content, .. } => {
                let text = content.text();
                if !text.is_empty() {
                    out.push_str(&format!("user: {text}\n\n"));
                }
            }
            Message::Assistant { text, tool_calls, .. } => {
                if let Some(text) = text {
                    if !text.is_empty() {
                        out.push_str(&format!("assistant: {text}\n\n"));
                    }
                }
                for call in tool_calls {
                    out.push_str(&format!(
                        "assistant [tool_call]: {}({})\n\n",
                        call.name,
                        snippet(&call.arguments.to_string())
                    ));
                }
            }
            Message::ToolResults { results } => {
                for result in results {
                    out.push_str(&format!("tool_result: {}\n\n", snippet(&result.content.text())));
                }
            }
        }
    }
    out
}
