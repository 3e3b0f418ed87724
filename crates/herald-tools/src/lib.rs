//! Tool system — the local operations the agentic loop can dispatch.
//!
//! Every tool implements [`Tool`]; the [`registry::ToolRegistry`] is the
//! single dispatch entry with error isolation and output truncation. Tool
//! results are fed back to the model verbatim, so runtime failures are
//! reduced to a stable prefix — details go to the log, never to the model.

pub mod filesystem;
pub mod messaging;
pub mod registry;
pub mod shell;

use async_trait::async_trait;

use herald_core::types::ToolSchema;

/// Tool execution failure, as seen by the registry.
///
/// `InvalidArguments` surfaces its detail to the model (argument shape is
/// model-produced data, not host state); `Failed` does not.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),
}

/// Trait all tools implement.
///
/// Blocking work inside `execute` must go through `spawn_blocking` — the
/// registry calls handlers on the scheduler threads.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name (e.g. "read"). Re-registering a name overwrites.
    fn name(&self) -> &str;
    /// Description shown to the model.
    fn description(&self) -> String;
    /// JSON Schema for the tool's input.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute with the model-produced arguments.
    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError>;
}

/// Descriptor for a tool, without its handler.
pub fn schema_of(tool: &dyn Tool) -> ToolSchema {
    ToolSchema {
        name: tool.name().to_string(),
        description: tool.description(),
        input_schema: tool.input_schema(),
    }
}

/// Parse tool arguments into a typed struct, mapping failures to
/// `InvalidArguments` with the serde detail.
pub fn parse_args<T: serde::de::DeserializeOwned>(
    arguments: serde_json::Value,
) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}
