//! Provider-agnostic agentic tool-use loop.
//!
//! The core of the agent: call the provider, execute any requested tools,
//! feed results back, repeat until end_turn, no tool calls, max_turns, or
//! the spend cap. Text generated alongside tool calls is kept only as a
//! fallback for a silent final turn — deliberate outbound messages go
//! through the message tool.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, warn};

use herald_core::types::{Message, ToolResultContent, ToolResultEntry, ToolSchema};
use herald_providers::{LlmResponse, Provider, ProviderError, StopReason};
use herald_tools::registry::ToolRegistry;

use crate::cost::CostLedger;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("API call timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Per-call knobs for one loop run.
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub max_turns: u32,
    /// Timeout per provider call, not per loop.
    pub timeout: Duration,
    pub session_id: String,
    pub model_name: String,
    /// `[input, output, cache_read]` USD per million tokens. Empty disables
    /// spend tracking for this run.
    pub cost_rates: Vec<f64>,
    /// Max USD for this run; <= 0 disables the circuit breaker.
    pub max_cost: f64,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            max_turns: 50,
            timeout: Duration::from_secs(600),
            session_id: String::new(),
            model_name: String::new(),
            cost_rates: Vec::new(),
            max_cost: 0.0,
        }
    }
}

/// Observer hooks fired as the loop progresses (live monitor, logging).
pub trait LoopObserver: Send + Sync {
    fn on_response(&self, _response: &LlmResponse) {}
    fn on_tool_results(&self, _results: &[ToolResultEntry]) {}
}

/// Run the agentic loop.
///
/// `messages` is mutated in place — assistant and tool-results messages are
/// appended as they happen and remain visible to the caller after return.
/// The returned response's `text` is the final turn's text; intermediate
/// text is salvaged into it only when the final turn is silent.
#[allow(clippy::too_many_arguments)]
pub async fn run_agentic_loop(
    provider: &dyn Provider,
    system: &Value,
    messages: &mut Vec<Message>,
    tools: &[ToolSchema],
    registry: &Arc<ToolRegistry>,
    ledger: Option<&CostLedger>,
    opts: &LoopOptions,
    observer: Option<&dyn LoopObserver>,
) -> Result<LlmResponse, AgentError> {
    let max_turns = opts.max_turns.max(1);
    let fmt_tools = if tools.is_empty() {
        Value::Array(Vec::new())
    } else {
        provider.format_tools(tools)
    };
    let mut accumulated_cost = 0.0_f64;
    let mut fallback_text: Vec<String> = Vec::new();
    let mut last_response: Option<LlmResponse> = None;

    for turn in 0..max_turns {
        let fmt_messages = provider.format_messages(messages);

        let mut response =
            match tokio::time::timeout(opts.timeout, provider.complete(system, &fmt_messages, &fmt_tools))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    error!(turn, timeout_secs = opts.timeout.as_secs(), "API call timed out");
                    return Err(AgentError::Timeout(opts.timeout));
                }
            };

        if let Some(ledger) = ledger {
            if !opts.cost_rates.is_empty() {
                accumulated_cost += ledger
                    .record(&opts.session_id, &opts.model_name, response.usage, &opts.cost_rates)
                    .await;
            }
        }

        // Spend circuit breaker. The notice is appended, never substituted —
        // whatever the model already said survives.
        if opts.max_cost > 0.0 && accumulated_cost > opts.max_cost {
            warn!(
                turn,
                accumulated = accumulated_cost,
                max = opts.max_cost,
                "cost limit reached"
            );
            let notice = format!("[Cost limit reached: ${accumulated_cost:.4}]");
            response.text = Some(match response.text.take() {
                Some(text) if !text.is_empty() => format!("{text}\n{notice}"),
                _ => notice,
            });
            return Ok(response);
        }

        messages.push(response.to_message());
        if let Some(observer) = observer {
            observer.on_response(&response);
        }

        // Intermediate text alongside tool calls — the safety net for a
        // silent final turn.
        if let Some(text) = &response.text {
            if !text.is_empty() && !response.tool_calls.is_empty() {
                fallback_text.push(text.clone());
            }
        }

        if response.stop_reason == StopReason::MaxTokens {
            warn!(turn, "response truncated (max_tokens)");
        }

        // Stop on end_turn or when there is nothing to execute. A truncated
        // response that still carries tool calls is NOT a stop: the calls
        // were generated before the cutoff, and dropping them would leave a
        // dangling tool_use in the session.
        if response.tool_calls.is_empty() || response.stop_reason == StopReason::EndTurn {
            if response.text.as_deref().map(str::is_empty).unwrap_or(true)
                && !fallback_text.is_empty()
            {
                response.text = Some(fallback_text.join("\n\n"));
            }
            return Ok(response);
        }

        // Execute all tool calls in parallel; collect results by call index
        // so ids stay paired. One broken tool never aborts the turn.
        let mut handles = Vec::with_capacity(response.tool_calls.len());
        for call in &response.tool_calls {
            info!(tool = %call.name, args = %truncate_args(&call.arguments), "tool call");
            let registry = registry.clone();
            let name = call.name.clone();
            let arguments = call.arguments.clone();
            handles.push(tokio::spawn(async move {
                registry.execute(&name, arguments).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (i, handle) in handles.into_iter().enumerate() {
            let call = &response.tool_calls[i];
            let content = match handle.await {
                Ok(content) => content,
                Err(e) => {
                    error!(tool = %call.name, error = %e, "tool task failed");
                    let kind = if e.is_panic() { "Panic" } else { "Cancelled" };
                    format!("Error: {kind}: tool '{}' did not complete", call.name)
                }
            };
            results.push(ToolResultEntry {
                tool_call_id: call.id.clone(),
                content: ToolResultContent::Text(content),
            });
        }

        messages.push(Message::ToolResults {
            results: results.clone(),
        });
        if let Some(observer) = observer {
            observer.on_tool_results(&results);
        }

        last_response = Some(response);
    }

    warn!(max_turns, "max turns reached");
    match last_response {
        Some(mut response) => {
            if response.text.as_deref().map(str::is_empty).unwrap_or(true)
                && !fallback_text.is_empty()
            {
                response.text = Some(fallback_text.join("\n\n"));
            }
            Ok(response)
        }
        None => Err(AgentError::Provider(ProviderError::Parse(
            "agentic loop ended without a response".into(),
        ))),
    }
}

/// Truncate tool arguments for logging.
fn truncate_args(arguments: &Value) -> String {
    let s = arguments.to_string();
    if s.chars().count() > 200 {
        let cut: String = s.chars().take(200).collect();
        format!("{cut}...")
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use herald_core::types::{ToolCall, Usage};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Provider that replays a fixed script of responses.
    #[derive(Debug)]
    struct ScriptedProvider {
        script: Mutex<VecDeque<LlmResponse>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(script: Vec<LlmResponse>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        fn format_tools(&self, tools: &[ToolSchema]) -> Value {
            json!(tools)
        }
        fn format_system(&self, blocks: &[herald_core::types::SystemBlock]) -> Value {
            json!(blocks.iter().map(|b| b.text.clone()).collect::<Vec<_>>())
        }
        fn format_messages(&self, messages: &[Message]) -> Value {
            serde_json::to_value(messages).unwrap()
        }
        async fn complete(
            &self,
            _system: &Value,
            _messages: &Value,
            _tools: &Value,
        ) -> Result<LlmResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| ProviderError::Unavailable("script exhausted".into()))
        }
    }

    fn response(
        text: Option<&str>,
        tool_calls: Vec<ToolCall>,
        stop_reason: StopReason,
        input_tokens: u64,
    ) -> LlmResponse {
        LlmResponse {
            text: text.map(String::from),
            tool_calls,
            stop_reason,
            usage: Usage {
                input_tokens,
                output_tokens: 50,
                ..Usage::default()
            },
            thinking: None,
            thinking_block: None,
            raw: Value::Null,
        }
    }

    fn echo_call(id: &str, text: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "echo".into(),
            arguments: json!({ "text": text }),
        }
    }

    struct EchoTool {
        executions: AtomicUsize,
    }

    #[async_trait]
    impl herald_tools::Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> String {
            "Echo text".into()
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]})
        }
        async fn execute(&self, arguments: Value) -> Result<String, herald_tools::ToolError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(arguments["text"].as_str().unwrap_or_default().to_string())
        }
    }

    fn registry_with_echo() -> (Arc<ToolRegistry>, Arc<EchoTool>) {
        let registry = Arc::new(ToolRegistry::new(30_000));
        let echo = Arc::new(EchoTool {
            executions: AtomicUsize::new(0),
        });
        registry.register(echo.clone());
        (registry, echo)
    }

    fn echo_schema() -> Vec<ToolSchema> {
        vec![ToolSchema {
            name: "echo".into(),
            description: "Echo text".into(),
            input_schema: json!({"type": "object"}),
        }]
    }

    fn opts(max_turns: u32) -> LoopOptions {
        LoopOptions {
            max_turns,
            timeout: Duration::from_secs(5),
            ..LoopOptions::default()
        }
    }

    #[tokio::test]
    async fn single_turn_without_tools() {
        let provider = ScriptedProvider::new(vec![response(
            Some("Hello"),
            Vec::new(),
            StopReason::EndTurn,
            100,
        )]);
        let (registry, _) = registry_with_echo();
        let mut messages = vec![Message::user("hi", "", "")];

        let result = run_agentic_loop(
            &provider,
            &Value::Null,
            &mut messages,
            &[],
            &registry,
            None,
            &opts(10),
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.text.as_deref(), Some("Hello"));
        assert_eq!(provider.call_count(), 1);
        assert_eq!(messages.len(), 2); // user + assistant
    }

    #[tokio::test]
    async fn tool_round_trip_appends_four_messages() {
        let provider = ScriptedProvider::new(vec![
            response(None, vec![echo_call("tu_1", "ping")], StopReason::ToolUse, 100),
            response(Some("Pong"), Vec::new(), StopReason::EndTurn, 120),
        ]);
        let (registry, echo) = registry_with_echo();
        let mut messages = vec![Message::user("ping me", "", "")];

        let result = run_agentic_loop(
            &provider,
            &Value::Null,
            &mut messages,
            &echo_schema(),
            &registry,
            None,
            &opts(10),
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.text.as_deref(), Some("Pong"));
        assert_eq!(messages.len(), 4);
        assert!(matches!(messages[1], Message::Assistant { .. }));
        match &messages[2] {
            Message::ToolResults { results } => {
                assert_eq!(results[0].tool_call_id, "tu_1");
                assert_eq!(results[0].content.text(), "ping");
            }
            other => panic!("expected tool results, got {other:?}"),
        }
        assert!(matches!(messages[3], Message::Assistant { .. }));
        assert_eq!(echo.executions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn truncated_response_with_tool_calls_still_executes() {
        let provider = ScriptedProvider::new(vec![
            response(None, vec![echo_call("tu_7", "x")], StopReason::MaxTokens, 100),
            response(Some("Done"), Vec::new(), StopReason::EndTurn, 100),
        ]);
        let (registry, echo) = registry_with_echo();
        let mut messages = vec![Message::user("go", "", "")];

        let result = run_agentic_loop(
            &provider,
            &Value::Null,
            &mut messages,
            &echo_schema(),
            &registry,
            None,
            &opts(10),
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.text.as_deref(), Some("Done"));
        assert_eq!(echo.executions.load(Ordering::SeqCst), 1);
        let has_result_for_call = messages.iter().any(|m| match m {
            Message::ToolResults { results } => results.iter().any(|r| r.tool_call_id == "tu_7"),
            _ => false,
        });
        assert!(has_result_for_call);
    }

    #[tokio::test]
    async fn silent_final_turn_salvages_intermediate_text() {
        let provider = ScriptedProvider::new(vec![
            response(Some("First thought"), vec![echo_call("tu_1", "a")], StopReason::ToolUse, 1),
            response(Some("Second thought"), vec![echo_call("tu_2", "b")], StopReason::ToolUse, 1),
            response(Some(""), Vec::new(), StopReason::EndTurn, 1),
        ]);
        let (registry, _) = registry_with_echo();
        let mut messages = vec![Message::user("go", "", "")];

        let result = run_agentic_loop(
            &provider,
            &Value::Null,
            &mut messages,
            &echo_schema(),
            &registry,
            None,
            &opts(10),
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.text.as_deref(), Some("First thought\n\nSecond thought"));
    }

    #[tokio::test]
    async fn provider_called_at_most_max_turns_times() {
        let always_tools: Vec<LlmResponse> = (0..10)
            .map(|i| {
                response(
                    None,
                    vec![echo_call(&format!("tu_{i}"), "x")],
                    StopReason::ToolUse,
                    1,
                )
            })
            .collect();
        let provider = ScriptedProvider::new(always_tools);
        let (registry, _) = registry_with_echo();
        let mut messages = vec![Message::user("go", "", "")];

        let result = run_agentic_loop(
            &provider,
            &Value::Null,
            &mut messages,
            &echo_schema(),
            &registry,
            None,
            &opts(3),
            None,
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn cost_cap_accumulates_and_preserves_text() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = CostLedger::new(dir.path().join("cost.db"));
        ledger.init().unwrap();

        // Each turn: 100k input tokens at $75/Mtok = $7.50.
        let provider = ScriptedProvider::new(vec![
            response(None, vec![echo_call("tu_1", "a")], StopReason::ToolUse, 100_000),
            response(Some("Partial reply"), vec![echo_call("tu_2", "b")], StopReason::ToolUse, 100_000),
        ]);
        let (registry, _) = registry_with_echo();
        let mut messages = vec![Message::user("go", "", "")];

        let options = LoopOptions {
            max_turns: 10,
            timeout: Duration::from_secs(5),
            session_id: "s1".into(),
            model_name: "expensive".into(),
            cost_rates: vec![75.0, 0.0, 0.0],
            max_cost: 8.0,
        };
        let result = run_agentic_loop(
            &provider,
            &Value::Null,
            &mut messages,
            &echo_schema(),
            &registry,
            Some(&ledger),
            &options,
            None,
        )
        .await
        .unwrap();

        // $7.50 after turn one (under the cap), $15 after turn two — proves
        // += semantics. The notice is appended after the model's own text.
        assert_eq!(provider.call_count(), 2);
        let text = result.text.unwrap();
        assert!(text.starts_with("Partial reply"));
        assert!(text.contains("Cost limit"));
        let report = ledger.query("all").await;
        assert_eq!(report.models.len(), 1);
        assert!((report.total_cost - 15.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn disabled_cost_tracking_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = CostLedger::new(dir.path().join("cost.db"));
        ledger.init().unwrap();

        let provider = ScriptedProvider::new(vec![
            response(None, vec![echo_call("tu_1", "a")], StopReason::ToolUse, 1_000_000),
            response(Some("done"), Vec::new(), StopReason::EndTurn, 1_000_000),
        ]);
        let (registry, _) = registry_with_echo();
        let mut messages = vec![Message::user("go", "", "")];

        let options = LoopOptions {
            max_turns: 10,
            timeout: Duration::from_secs(5),
            cost_rates: Vec::new(), // disabled
            max_cost: 0.001,        // would trip instantly if tracking ran
            ..LoopOptions::default()
        };
        let result = run_agentic_loop(
            &provider,
            &Value::Null,
            &mut messages,
            &echo_schema(),
            &registry,
            Some(&ledger),
            &options,
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.text.as_deref(), Some("done"));
        assert!(ledger.query("all").await.models.is_empty());
    }

    #[tokio::test]
    async fn one_broken_tool_does_not_abort_the_turn() {
        struct FailTool;
        #[async_trait]
        impl herald_tools::Tool for FailTool {
            fn name(&self) -> &str {
                "fail"
            }
            fn description(&self) -> String {
                "Always fails".into()
            }
            fn input_schema(&self) -> Value {
                json!({"type": "object"})
            }
            async fn execute(&self, _: Value) -> Result<String, herald_tools::ToolError> {
                Err(herald_tools::ToolError::Failed("kaboom".into()))
            }
        }

        let provider = ScriptedProvider::new(vec![
            response(
                None,
                vec![
                    ToolCall {
                        id: "tu_1".into(),
                        name: "fail".into(),
                        arguments: json!({}),
                    },
                    echo_call("tu_2", "fine"),
                ],
                StopReason::ToolUse,
                1,
            ),
            response(Some("recovered"), Vec::new(), StopReason::EndTurn, 1),
        ]);
        let (registry, _) = registry_with_echo();
        registry.register(Arc::new(FailTool));
        let mut messages = vec![Message::user("go", "", "")];

        let result = run_agentic_loop(
            &provider,
            &Value::Null,
            &mut messages,
            &echo_schema(),
            &registry,
            None,
            &opts(10),
            None,
        )
        .await
        .unwrap();

        assert_eq!(result.text.as_deref(), Some("recovered"));
        match &messages[2] {
            Message::ToolResults { results } => {
                assert_eq!(results.len(), 2);
                assert_eq!(results[0].tool_call_id, "tu_1");
                assert_eq!(results[0].content.text(), "Error: Tool 'fail' execution failed");
                assert_eq!(results[1].content.text(), "fine");
            }
            other => panic!("expected tool results, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn observers_fire_per_turn() {
        #[derive(Default)]
        struct Counter {
            responses: AtomicUsize,
            tool_results: AtomicUsize,
        }
        impl LoopObserver for Counter {
            fn on_response(&self, _: &LlmResponse) {
                self.responses.fetch_add(1, Ordering::SeqCst);
            }
            fn on_tool_results(&self, _: &[ToolResultEntry]) {
                self.tool_results.fetch_add(1, Ordering::SeqCst);
            }
        }

        let provider = ScriptedProvider::new(vec![
            response(None, vec![echo_call("tu_1", "a")], StopReason::ToolUse, 1),
            response(Some("bye"), Vec::new(), StopReason::EndTurn, 1),
        ]);
        let (registry, _) = registry_with_echo();
        let counter = Counter::default();
        let mut messages = vec![Message::user("go", "", "")];

        run_agentic_loop(
            &provider,
            &Value::Null,
            &mut messages,
            &echo_schema(),
            &registry,
            None,
            &opts(10),
            Some(&counter),
        )
        .await
        .unwrap();

        assert_eq!(counter.responses.load(Ordering::SeqCst), 2);
        assert_eq!(counter.tool_results.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_timeout_propagates() {
        #[derive(Debug)]
        struct SlowProvider;
        #[async_trait]
        impl Provider for SlowProvider {
            fn name(&self) -> &str {
                "slow"
            }
            fn format_tools(&self, _: &[ToolSchema]) -> Value {
                Value::Array(Vec::new())
            }
            fn format_system(&self, _: &[herald_core::types::SystemBlock]) -> Value {
                Value::Null
            }
            fn format_messages(&self, _: &[Message]) -> Value {
                Value::Array(Vec::new())
            }
            async fn complete(
                &self,
                _: &Value,
                _: &Value,
                _: &Value,
            ) -> Result<LlmResponse, ProviderError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                unreachable!()
            }
        }

        let (registry, _) = registry_with_echo();
        let mut messages = vec![Message::user("go", "", "")];
        let options = LoopOptions {
            timeout: Duration::from_millis(50),
            ..LoopOptions::default()
        };
        let result = run_agentic_loop(
            &SlowProvider,
            &Value::Null,
            &mut messages,
            &[],
            &registry,
            None,
            &options,
            None,
        )
        .await;
        assert!(matches!(result, Err(AgentError::Timeout(_))));
    }
}
