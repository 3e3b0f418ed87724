//! Configuration loading — herald.toml + HERALD_* env overrides.
//!
//! Immutable after load; there is no runtime reloading. Validation collects
//! every problem and fails startup with the full list rather than stopping
//! at the first missing field.

use std::collections::HashMap;
use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{HeraldError, Result};

/// Default truncation limit for tool output returned to the model.
pub const DEFAULT_TOOL_TRUNCATION: usize = 30_000;

/// Top-level config (herald.toml + HERALD_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeraldConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    /// Source label → model name. Sources without an entry use "primary".
    #[serde(default)]
    pub routing: HashMap<String, String>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub agentic: AgenticConfig,
    #[serde(default)]
    pub subagent: SubagentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub cost: CostConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_name")]
    pub name: String,
    /// Root directory for state (sessions, cost db, monitor file).
    #[serde(default)]
    pub workspace: String,
    /// Operator-visible reply when the loop fails or times out.
    #[serde(default = "default_error_message")]
    pub error_message: String,
    /// Stable identity/instruction blocks for the system prompt.
    #[serde(default)]
    pub context_stable: Vec<String>,
    #[serde(default)]
    pub context_semi_stable: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            workspace: String::new(),
            error_message: default_error_message(),
            context_stable: Vec::new(),
            context_semi_stable: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Transport type ("telegram", "none", …). Required; "none" is valid for
    /// HTTP-only deployments.
    #[serde(default)]
    pub r#type: String,
    /// Contact names known to the transport, used in tool descriptions and
    /// the sub-agent preamble.
    #[serde(default)]
    pub contacts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_http_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
    /// Env var holding the bearer token. Unset/empty token → protected
    /// endpoints answer 503.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// How long /chat waits for the dispatcher before answering 408.
    #[serde(default = "default_agent_timeout")]
    pub agent_timeout_secs: u64,
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Webhook for /notify echo-back. Empty = disabled.
    #[serde(default)]
    pub callback_url: String,
    #[serde(default)]
    pub callback_token_env: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_http_host(),
            port: default_http_port(),
            token_env: default_token_env(),
            agent_timeout_secs: default_agent_timeout(),
            download_dir: default_download_dir(),
            max_body_bytes: default_max_body_bytes(),
            callback_url: String::new(),
            callback_token_env: String::new(),
        }
    }
}

/// One `[models.<name>]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// "anthropic-compat" | "openai-compat"
    #[serde(default)]
    pub provider: String,
    /// Vendor model identifier.
    #[serde(default)]
    pub model: String,
    /// Env var holding the API key.
    #[serde(default)]
    pub api_key_env: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub base_url: String,
    /// Mark stable system blocks with the vendor's cache marker.
    #[serde(default)]
    pub cache_control: bool,
    /// "adaptive" | "budgeted" | "disabled" | "" (off)
    #[serde(default)]
    pub thinking_mode: String,
    #[serde(default = "default_thinking_budget")]
    pub thinking_budget: u32,
    /// "high" | "medium" | "low" | "" — adaptive mode only.
    #[serde(default)]
    pub thinking_effort: String,
    /// [input, output, cache_read] USD per million tokens. Empty disables
    /// spend tracking for this model.
    #[serde(default)]
    pub cost_per_mtok: Vec<f64>,
    /// Max USD per inbound message (0 = no circuit breaker).
    #[serde(default)]
    pub max_cost: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: String::new(),
            model: String::new(),
            api_key_env: String::new(),
            max_tokens: default_max_tokens(),
            base_url: String::new(),
            cache_control: false,
            thinking_mode: String::new(),
            thinking_budget: default_thinking_budget(),
            thinking_effort: String::new(),
            cost_per_mtok: Vec::new(),
            max_cost: 0.0,
        }
    }
}

impl ModelConfig {
    /// Resolve the API key from the configured env var. Empty when unset.
    pub fn api_key(&self) -> String {
        if self.api_key_env.is_empty() {
            return String::new();
        }
        std::env::var(&self.api_key_env).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub dir: String,
    /// Input tokens on the last assistant turn above which the session is
    /// compacted.
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: u64,
    #[serde(default = "default_compaction_prompt")]
    pub compaction_prompt: String,
    /// How many messages a recall excerpt includes.
    #[serde(default = "default_recall_count")]
    pub recall_count: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dir: String::new(),
            compaction_threshold: default_compaction_threshold(),
            compaction_prompt: default_compaction_prompt(),
            recall_count: default_recall_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgenticConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    /// Per provider call, not per work item.
    #[serde(default = "default_call_timeout")]
    pub timeout_secs: u64,
}

impl Default for AgenticConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            timeout_secs: default_call_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentConfig {
    #[serde(default = "default_subagent_model")]
    pub model: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_call_timeout")]
    pub timeout_secs: u64,
    /// Tools sub-agents can never invoke, even when requested explicitly.
    /// Set `deny = []` to disable denial entirely.
    #[serde(default = "default_subagent_deny")]
    pub deny: Vec<String>,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            model: default_subagent_model(),
            max_turns: default_max_turns(),
            timeout_secs: default_call_timeout(),
            deny: default_subagent_deny(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_truncation_limit")]
    pub truncation_limit: usize,
    /// Resolved path prefixes the filesystem tools may touch. Empty denies
    /// everything.
    #[serde(default)]
    pub filesystem_allowed_paths: Vec<String>,
    #[serde(default = "default_shell_timeout")]
    pub shell_default_timeout_secs: u64,
    #[serde(default = "default_shell_max_timeout")]
    pub shell_max_timeout_secs: u64,
    /// Env var name prefixes stripped from shell tool children.
    #[serde(default = "default_secret_prefixes")]
    pub secret_env_prefixes: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            truncation_limit: default_truncation_limit(),
            filesystem_allowed_paths: Vec::new(),
            shell_default_timeout_secs: default_shell_timeout(),
            shell_max_timeout_secs: default_shell_max_timeout(),
            secret_env_prefixes: default_secret_prefixes(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostConfig {
    /// SQLite file. Empty = workspace/cost.db.
    #[serde(default)]
    pub db_path: String,
}

impl HeraldConfig {
    /// Load from an explicit path, HERALD_CONFIG, or ~/.herald/herald.toml.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("HERALD_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let config: HeraldConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HERALD_").split("__"))
            .extract()
            .map_err(|e| HeraldError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate required fields, collecting every failure.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.agent.workspace.is_empty() {
            errors.push("[agent] workspace is required".into());
        }
        if self.channel.r#type.is_empty() {
            errors.push("[channel] type is required (\"none\" for HTTP-only)".into());
        }
        match self.models.get("primary") {
            None => errors.push("[models.primary] section is required".into()),
            Some(primary) => {
                if primary.provider.is_empty() {
                    errors.push("[models.primary] provider is required".into());
                }
                if primary.model.is_empty() {
                    errors.push("[models.primary] model is required".into());
                }
            }
        }
        for (name, model) in &self.models {
            if !matches!(model.provider.as_str(), "" | "anthropic-compat" | "openai-compat") {
                errors.push(format!(
                    "[models.{name}] unknown provider type '{}'",
                    model.provider
                ));
            }
        }
        for (source, model) in &self.routing {
            if !self.models.contains_key(model) {
                errors.push(format!("[routing] {source} points at unknown model '{model}'"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(HeraldError::Config(
                errors
                    .iter()
                    .map(|e| format!("  - {e}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            ))
        }
    }

    /// Model name routed for a source label. Unrouted sources use "primary".
    pub fn route_model(&self, source: &str) -> &str {
        self.routing.get(source).map(String::as_str).unwrap_or("primary")
    }

    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name)
    }

    pub fn workspace_path(&self) -> PathBuf {
        resolve_path(&self.agent.workspace)
    }

    pub fn sessions_dir(&self) -> PathBuf {
        if self.session.dir.is_empty() {
            self.workspace_path().join("sessions")
        } else {
            resolve_path(&self.session.dir)
        }
    }

    pub fn cost_db_path(&self) -> PathBuf {
        if self.cost.db_path.is_empty() {
            self.workspace_path().join("cost.db")
        } else {
            resolve_path(&self.cost.db_path)
        }
    }

    pub fn monitor_path(&self) -> PathBuf {
        self.workspace_path().join("monitor.json")
    }

    /// Bearer token for the HTTP API, read from the configured env var.
    pub fn http_auth_token(&self) -> String {
        if self.http.token_env.is_empty() {
            return String::new();
        }
        std::env::var(&self.http.token_env).unwrap_or_default()
    }

    pub fn http_callback_token(&self) -> String {
        if self.http.callback_token_env.is_empty() {
            return String::new();
        }
        std::env::var(&self.http.callback_token_env).unwrap_or_default()
    }
}

/// Expand a leading `~` and normalize to an absolute path where possible.
pub fn resolve_path(p: &str) -> PathBuf {
    let expanded = if let Some(rest) = p.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}/{rest}")
    } else {
        p.to_string()
    };
    PathBuf::from(expanded)
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.herald/herald.toml")
}

fn default_agent_name() -> String {
    "Herald".to_string()
}

fn default_error_message() -> String {
    "Sorry, something went wrong while processing your message.".to_string()
}

fn default_http_host() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8100
}

fn default_token_env() -> String {
    "HERALD_HTTP_TOKEN".to_string()
}

fn default_agent_timeout() -> u64 {
    600
}

fn default_download_dir() -> String {
    "/tmp/herald-http".to_string()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_thinking_budget() -> u32 {
    10_000
}

fn default_compaction_threshold() -> u64 {
    150_000
}

fn default_compaction_prompt() -> String {
    "Summarize the conversation below for continuity. Preserve decisions, \
     open tasks, names, and anything the user asked to remember. Write \
     compact prose, not bullet fragments."
        .to_string()
}

fn default_recall_count() -> usize {
    20
}

fn default_max_turns() -> u32 {
    50
}

fn default_call_timeout() -> u64 {
    600
}

fn default_subagent_model() -> String {
    "primary".to_string()
}

fn default_subagent_deny() -> Vec<String> {
    ["sessions_spawn", "tts", "react", "schedule_message"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_truncation_limit() -> usize {
    DEFAULT_TOOL_TRUNCATION
}

fn default_shell_timeout() -> u64 {
    120
}

fn default_shell_max_timeout() -> u64 {
    600
}

fn default_secret_prefixes() -> Vec<String> {
    vec!["HERALD_".to_string()]
}
