//! End-to-end pipeline: loop mutates the session in place, the persist
//! path records audit events, and the session survives snapshot loss.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use herald_agent::{run_agentic_loop, LoopOptions};
use herald_core::types::{Message, SystemBlock, ToolCall, ToolSchema, Usage};
use herald_providers::{LlmResponse, Provider, ProviderError, StopReason};
use herald_sessions::Session;
use herald_tools::registry::ToolRegistry;
use herald_tools::{Tool, ToolError};

#[derive(Debug)]
struct ScriptedProvider {
    script: Mutex<VecDeque<LlmResponse>>,
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }
    fn format_tools(&self, tools: &[ToolSchema]) -> Value {
        json!(tools)
    }
    fn format_system(&self, blocks: &[SystemBlock]) -> Value {
        json!(blocks.iter().map(|b| b.text.clone()).collect::<Vec<_>>())
    }
    fn format_messages(&self, messages: &[Message]) -> Value {
        serde_json::to_value(messages).unwrap()
    }
    async fn complete(&self, _: &Value, _: &Value, _: &Value) -> Result<LlmResponse, ProviderError> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::Unavailable("script exhausted".into()))
    }
}

struct UptimeTool {
    executions: AtomicUsize,
}

#[async_trait]
impl Tool for UptimeTool {
    fn name(&self) -> &str {
        "uptime"
    }
    fn description(&self) -> String {
        "Report host uptime".into()
    }
    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }
    async fn execute(&self, _: Value) -> Result<String, ToolError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        Ok("up 3 days".into())
    }
}

fn assistant_turn(
    text: Option<&str>,
    tool_calls: Vec<ToolCall>,
    stop_reason: StopReason,
) -> LlmResponse {
    LlmResponse {
        text: text.map(String::from),
        tool_calls,
        stop_reason,
        usage: Usage {
            input_tokens: 100,
            output_tokens: 40,
            ..Usage::default()
        },
        thinking: None,
        thinking_block: None,
        raw: Value::Null,
    }
}

#[tokio::test]
async fn loop_output_persists_and_survives_snapshot_loss() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = Session::new("s-pipeline", dir.path(), "primary", "alice").unwrap();
    session
        .add_user_message("is the server up?", "alice", "telegram")
        .unwrap();

    let provider = ScriptedProvider {
        script: Mutex::new(
            vec![
                assistant_turn(
                    Some("checking"),
                    vec![ToolCall {
                        id: "tu_1".into(),
                        name: "uptime".into(),
                        arguments: json!({}),
                    }],
                    StopReason::ToolUse,
                ),
                assistant_turn(Some("Server is up, 3 days."), Vec::new(), StopReason::EndTurn),
            ]
            .into(),
        ),
    };

    let registry = Arc::new(ToolRegistry::new(30_000));
    let tool = Arc::new(UptimeTool {
        executions: AtomicUsize::new(0),
    });
    registry.register(tool.clone());

    let options = LoopOptions {
        max_turns: 10,
        timeout: Duration::from_secs(5),
        session_id: session.id.clone(),
        ..LoopOptions::default()
    };

    let mark = session.messages.len();
    let response = run_agentic_loop(
        &provider,
        &Value::Null,
        &mut session.messages,
        &registry.get_schemas(),
        &registry,
        None,
        &options,
        None,
    )
    .await
    .unwrap();

    assert_eq!(response.text.as_deref(), Some("Server is up, 3 days."));
    assert_eq!(tool.executions.load(Ordering::SeqCst), 1);
    assert_eq!(session.messages.len(), 4);

    // The dispatcher's persist path: audit what the loop appended in place.
    let appended: Vec<Message> = session.messages[mark..].to_vec();
    for message in &appended {
        match message {
            Message::Assistant { .. } => session.persist_assistant_message(message).unwrap(),
            Message::ToolResults { results } => session.persist_tool_results(results).unwrap(),
            Message::User { .. } => {}
        }
    }
    session.save_state().unwrap();
    assert_eq!(session.total_input_tokens, 200);
    assert_eq!(session.total_output_tokens, 80);

    // Snapshot load reproduces the conversation element-wise.
    let mut reloaded = Session::new("s-pipeline", dir.path(), "", "").unwrap();
    assert!(reloaded.load());
    assert_eq!(reloaded.messages, session.messages);

    // And after losing the snapshot, the audit trail still carries the
    // user/assistant history and the token totals.
    std::fs::write(reloaded.state_path(), "garbage").unwrap();
    let mut rebuilt = Session::new("s-pipeline", dir.path(), "", "").unwrap();
    assert!(rebuilt.load());
    assert_eq!(rebuilt.total_input_tokens, 200);
    assert_eq!(rebuilt.total_output_tokens, 80);
    let assistant_texts: Vec<String> = rebuilt
        .messages
        .iter()
        .filter_map(|m| match m {
            Message::Assistant { text, .. } => text.clone(),
            _ => None,
        })
        .collect();
    assert_eq!(assistant_texts, vec!["checking", "Server is up, 3 days."]);
}
