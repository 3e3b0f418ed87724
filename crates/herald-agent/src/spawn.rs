//! Sub-agent spawning — the `sessions_spawn` tool.
//!
//! Launches a nested agentic loop with a scoped tool set. The deny-list is
//! always subtracted, even from an explicitly requested tool list: without
//! it a sub-agent could fan out recursively, fire resource-heavy side
//! effects, or impersonate the operator through the messaging tools.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use herald_core::config::ModelConfig;
use herald_core::types::{Message, SystemBlock, Tier, ToolSchema};
use herald_providers::Provider;
use herald_tools::registry::ToolRegistry;
use herald_tools::{parse_args, Tool, ToolError};

use crate::agentic::{run_agentic_loop, AgentError, LoopOptions};
use crate::cost::CostLedger;

/// Defaults resolved from configuration at daemon start.
#[derive(Debug, Clone)]
pub struct SubAgentDefaults {
    pub model: String,
    pub max_turns: u32,
    pub timeout: Duration,
}

pub struct SpawnTool {
    /// Weak so the registry can own this tool without a reference cycle.
    registry: Weak<ToolRegistry>,
    providers: HashMap<String, Arc<dyn Provider>>,
    models: HashMap<String, ModelConfig>,
    ledger: Option<CostLedger>,
    defaults: SubAgentDefaults,
    deny: HashSet<String>,
    contact_names: Vec<String>,
    allowed_paths: Vec<String>,
}

impl SpawnTool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Weak<ToolRegistry>,
        providers: HashMap<String, Arc<dyn Provider>>,
        models: HashMap<String, ModelConfig>,
        ledger: Option<CostLedger>,
        defaults: SubAgentDefaults,
        deny: impl IntoIterator<Item = String>,
        contact_names: Vec<String>,
        allowed_paths: Vec<String>,
    ) -> Self {
        Self {
            registry,
            providers,
            models,
            ledger,
            defaults,
            deny: deny.into_iter().collect(),
            contact_names,
            allowed_paths,
        }
    }

    /// Explicit preamble so sub-agents know their environment.
    fn build_preamble(&self, scoped: &[ToolSchema], denied: &[String], max_turns: u32) -> String {
        let now = chrono::Local::now().format("%a, %d. %b %Y - %H:%M");
        let mut parts: Vec<String> = vec![
            "You are a sub-agent spawned to complete a specific task. \
             Complete the task and return a clear, concise text summary of what you did."
                .into(),
            String::new(),
            format!("Current date/time: {now}"),
            String::new(),
            "## Your Available Tools".into(),
            String::new(),
        ];
        for tool in scoped {
            parts.push(format!("- **{}**: {}", tool.name, tool.description));
        }

        if !denied.is_empty() {
            parts.push(String::new());
            parts.push("## Denied Tools (do NOT call these)".into());
            parts.push(String::new());
            for name in denied {
                parts.push(format!("- {name}"));
            }
        }

        parts.push(String::new());
        parts.push("## Limits".into());
        parts.push(String::new());
        parts.push(format!("- You have **{max_turns} tool-use turns**. Work efficiently."));
        parts.push(
            "- When done, respond with a clear text answer summarizing what you did and the result."
                .into(),
        );

        let scoped_names: HashSet<&str> = scoped.iter().map(|t| t.name.as_str()).collect();
        if scoped_names.contains("message") && !self.contact_names.is_empty() {
            parts.push(String::new());
            parts.push(format!("## Contacts: {}", self.contact_names.join(", ")));
        }
        if ["read", "write", "edit"].iter().any(|t| scoped_names.contains(t))
            && !self.allowed_paths.is_empty()
        {
            parts.push(String::new());
            parts.push(format!("## Allowed file paths: {}", self.allowed_paths.join(", ")));
        }

        parts.push(String::new());
        parts.push("## Session".into());
        parts.push(String::new());
        parts.push("Your session is ephemeral — context is discarded after this task.".into());
        parts.push(String::new());
        parts.push("---".into());
        parts.push(String::new());
        parts.push("## Task".into());
        parts.push(String::new());

        parts.join("\n")
    }

    /// Scope the registry's tools: optional explicit subset, minus the
    /// deny-set. Returns (scoped, denied names).
    fn scope_tools(
        &self,
        registry: &ToolRegistry,
        requested: Option<&[String]>,
    ) -> (Vec<ToolSchema>, Vec<String>) {
        let available = registry.get_schemas();
        let scoped: Vec<ToolSchema> = available
            .iter()
            .filter(|t| {
                let requested_ok = requested
                    .map(|names| names.iter().any(|n| n == &t.name))
                    .unwrap_or(true);
                requested_ok && !self.deny.contains(&t.name)
            })
            .cloned()
            .collect();
        let scoped_names: HashSet<&str> = scoped.iter().map(|t| t.name.as_str()).collect();
        let mut denied: Vec<String> = available
            .iter()
            .map(|t| t.name.clone())
            .filter(|name| !scoped_names.contains(name.as_str()))
            .collect();
        denied.sort();
        (scoped, denied)
    }
}

#[derive(Deserialize)]
struct SpawnArgs {
    prompt: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    tools: Option<Vec<String>>,
    #[serde(default)]
    max_turns: u32,
    #[serde(default)]
    timeout: f64,
    #[serde(default)]
    parent_session_id: String,
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "sessions_spawn"
    }

    fn description(&self) -> String {
        format!(
            "Spawn a sub-agent for delegated work. Same model and tools as you, but ephemeral — \
             context is discarded after the task. Use for heavy tool work (document editing, \
             bulk file operations) to keep your main session clean. \
             Unavailable to sub-agents: {}.",
            {
                let mut denied: Vec<&str> = self.deny.iter().map(String::as_str).collect();
                denied.sort_unstable();
                denied.join(", ")
            }
        )
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {"type": "string", "description": "Task description / instructions for the sub-agent"},
                "model": {"type": "string", "description": "Model name from config (default: primary)"},
                "tools": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Tool names to make available (default: all except the denied set)",
                },
                "max_turns": {"type": "integer", "description": "Max agentic loop iterations (0 = config default)"},
                "timeout": {"type": "number", "description": "Timeout per API call in seconds (0 = config default)"},
            },
            "required": ["prompt"],
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let args: SpawnArgs = parse_args(arguments)?;
        let Some(registry) = self.registry.upgrade() else {
            return Ok("Error: Agent system not initialized".to_string());
        };

        let model = if args.model.is_empty() {
            self.defaults.model.clone()
        } else {
            args.model
        };
        let max_turns = if args.max_turns > 0 {
            args.max_turns
        } else {
            self.defaults.max_turns
        };
        let timeout = if args.timeout > 0.0 {
            Duration::from_secs_f64(args.timeout)
        } else {
            self.defaults.timeout
        };

        let Some(provider) = self.providers.get(&model) else {
            return Ok(format!("Error: No provider configured for model '{model}'"));
        };

        let (scoped, denied) = self.scope_tools(&registry, args.tools.as_deref());
        let preamble = self.build_preamble(&scoped, &denied, max_turns);
        let system_blocks = [SystemBlock::new(
            format!("{preamble}{}", args.prompt),
            Tier::Stable,
        )];
        let fmt_system = provider.format_system(&system_blocks);

        let mut messages = vec![Message::user(args.prompt.clone(), "", "")];

        // Sub-agent spend is segregated in the ledger by the "sub-" prefix.
        let session_id = if args.parent_session_id.is_empty() {
            format!("sub-{}", uuid::Uuid::new_v4())
        } else {
            format!("sub-{}", args.parent_session_id)
        };
        let model_cfg = self.models.get(&model).cloned().unwrap_or_default();
        let options = LoopOptions {
            max_turns,
            timeout,
            session_id,
            model_name: model_cfg.model.clone(),
            cost_rates: model_cfg.cost_per_mtok.clone(),
            max_cost: 0.0,
        };

        let started = std::time::Instant::now();
        let result = run_agentic_loop(
            provider.as_ref(),
            &fmt_system,
            &mut messages,
            &scoped,
            &registry,
            self.ledger.as_ref(),
            &options,
            None,
        )
        .await;

        match result {
            Ok(response) => {
                let text = response
                    .text
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| "(no output)".to_string());
                info!(
                    elapsed_secs = started.elapsed().as_secs_f64(),
                    tokens_in = response.usage.input_tokens,
                    tokens_out = response.usage.output_tokens,
                    "sub-agent completed"
                );
                Ok(text)
            }
            Err(AgentError::Timeout(t)) => {
                Ok(format!("Error: Sub-agent timed out after {}s", t.as_secs()))
            }
            Err(e) => {
                error!(error = %e, "sub-agent failed");
                Ok(format!("Error: Sub-agent failed: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::types::{ToolCall, Usage};
    use herald_providers::{LlmResponse, ProviderError, StopReason};
    use serde_json::Value;
    use std::sync::Mutex;

    /// Provider that records the tool schemas it receives and answers once.
    #[derive(Debug)]
    struct Recorder {
        seen_tools: Mutex<Vec<String>>,
        seen_system: Mutex<String>,
        reply: String,
    }

    impl Recorder {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                seen_tools: Mutex::new(Vec::new()),
                seen_system: Mutex::new(String::new()),
                reply: reply.into(),
            })
        }
    }

    #[async_trait]
    impl Provider for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }
        fn format_tools(&self, tools: &[ToolSchema]) -> Value {
            *self.seen_tools.lock().unwrap() =
                tools.iter().map(|t| t.name.clone()).collect();
            json!(tools)
        }
        fn format_system(&self, blocks: &[SystemBlock]) -> Value {
            *self.seen_system.lock().unwrap() = blocks
                .iter()
                .map(|b| b.text.clone())
                .collect::<Vec<_>>()
                .join("\n");
            Value::Null
        }
        fn format_messages(&self, messages: &[Message]) -> Value {
            serde_json::to_value(messages).unwrap()
        }
        async fn complete(
            &self,
            _: &Value,
            _: &Value,
            _: &Value,
        ) -> Result<LlmResponse, ProviderError> {
            Ok(LlmResponse {
                text: Some(self.reply.clone()),
                tool_calls: Vec::new(),
                stop_reason: StopReason::EndTurn,
                usage: Usage::default(),
                thinking: None,
                thinking_block: None,
                raw: Value::Null,
            })
        }
    }

    struct NamedTool(&'static str);

    #[async_trait]
    impl Tool for NamedTool {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> String {
            format!("The {} tool", self.0)
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _: Value) -> Result<String, ToolError> {
            Ok("ok".into())
        }
    }

    fn default_deny() -> Vec<String> {
        ["sessions_spawn", "tts", "react", "schedule_message"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    fn build(
        registry: &Arc<ToolRegistry>,
        provider: Arc<Recorder>,
        deny: Vec<String>,
    ) -> SpawnTool {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert("primary".into(), provider);
        SpawnTool::new(
            Arc::downgrade(registry),
            providers,
            HashMap::new(),
            None,
            SubAgentDefaults {
                model: "primary".into(),
                max_turns: 5,
                timeout: Duration::from_secs(5),
            },
            deny,
            vec!["alice".into()],
            vec!["/data".into()],
        )
    }

    fn seeded_registry() -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new(30_000));
        registry.register_many(vec![
            Arc::new(NamedTool("read")),
            Arc::new(NamedTool("write")),
            Arc::new(NamedTool("message")),
            Arc::new(NamedTool("react")),
        ]);
        registry
    }

    #[tokio::test]
    async fn deny_set_is_always_subtracted_from_requested_tools() {
        let registry = seeded_registry();
        let provider = Recorder::new("done");
        let spawn = build(&registry, provider.clone(), default_deny());
        registry.register(Arc::new(NamedTool("sessions_spawn")));

        let result = spawn
            .execute(json!({
                "prompt": "do something",
                "tools": ["read", "sessions_spawn"],
            }))
            .await
            .unwrap();
        assert_eq!(result, "done");
        // explicit request for sessions_spawn still filtered
        assert_eq!(*provider.seen_tools.lock().unwrap(), vec!["read".to_string()]);
    }

    #[tokio::test]
    async fn default_scope_is_everything_minus_deny() {
        let registry = seeded_registry();
        let provider = Recorder::new("done");
        let spawn = build(&registry, provider.clone(), default_deny());

        spawn.execute(json!({"prompt": "go"})).await.unwrap();
        let seen = provider.seen_tools.lock().unwrap().clone();
        assert!(seen.contains(&"read".to_string()));
        assert!(seen.contains(&"message".to_string()));
        assert!(!seen.contains(&"react".to_string()));
    }

    #[tokio::test]
    async fn empty_deny_list_disables_denial() {
        let registry = seeded_registry();
        let provider = Recorder::new("done");
        let spawn = build(&registry, provider.clone(), Vec::new());

        spawn.execute(json!({"prompt": "go"})).await.unwrap();
        let seen = provider.seen_tools.lock().unwrap().clone();
        assert!(seen.contains(&"react".to_string()));
    }

    #[tokio::test]
    async fn preamble_names_tools_limits_and_ephemerality() {
        let registry = seeded_registry();
        let provider = Recorder::new("done");
        let spawn = build(&registry, provider.clone(), default_deny());

        spawn.execute(json!({"prompt": "the task"})).await.unwrap();
        let system = provider.seen_system.lock().unwrap().clone();
        assert!(system.contains("## Your Available Tools"));
        assert!(system.contains("- **read**"));
        assert!(system.contains("## Denied Tools"));
        assert!(system.contains("- react"));
        assert!(system.contains("**5 tool-use turns**"));
        assert!(system.contains("## Contacts: alice"));
        assert!(system.contains("## Allowed file paths: /data"));
        assert!(system.contains("ephemeral"));
        assert!(system.ends_with("## Task\nthe task"));
    }

    #[tokio::test]
    async fn unknown_model_is_reported_not_raised() {
        let registry = seeded_registry();
        let provider = Recorder::new("done");
        let spawn = build(&registry, provider, default_deny());
        let result = spawn
            .execute(json!({"prompt": "go", "model": "phantom"}))
            .await
            .unwrap();
        assert_eq!(result, "Error: No provider configured for model 'phantom'");
    }

    #[tokio::test]
    async fn empty_reply_becomes_no_output() {
        let registry = seeded_registry();
        let provider = Recorder::new("");
        let spawn = build(&registry, provider, default_deny());
        let result = spawn.execute(json!({"prompt": "go"})).await.unwrap();
        assert_eq!(result, "(no output)");
    }

    #[tokio::test]
    async fn dropped_registry_is_reported() {
        let registry = seeded_registry();
        let provider = Recorder::new("done");
        let spawn = build(&registry, provider, default_deny());
        drop(registry);
        let result = spawn.execute(json!({"prompt": "go"})).await.unwrap();
        assert_eq!(result, "Error: Agent system not initialized");
    }
}
