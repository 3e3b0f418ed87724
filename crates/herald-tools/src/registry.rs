//! Tool registry — registration, dispatch, error isolation, truncation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{error, warn};

use herald_core::types::ToolSchema;

use crate::{schema_of, Tool, ToolError};

/// Registers tools and dispatches calls from the agentic loop.
///
/// `execute` never fails: every outcome is a string the loop can hand back
/// to the model as a tool result. Internal detail stays in the log.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    truncation_limit: usize,
}

impl ToolRegistry {
    pub fn new(truncation_limit: usize) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            truncation_limit,
        }
    }

    /// Register one tool. Last registration wins on a name collision.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools
            .write()
            .expect("tool registry lock poisoned")
            .insert(tool.name().to_string(), tool);
    }

    pub fn register_many(&self, tools: Vec<Arc<dyn Tool>>) {
        for tool in tools {
            self.register(tool);
        }
    }

    /// Tool descriptors for the provider — no handler references.
    pub fn get_schemas(&self) -> Vec<ToolSchema> {
        let tools = self.tools.read().expect("tool registry lock poisoned");
        let mut schemas: Vec<ToolSchema> = tools.values().map(|t| schema_of(t.as_ref())).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// (name, description) pairs for the context builder.
    pub fn brief_descriptions(&self) -> Vec<(String, String)> {
        self.get_schemas()
            .into_iter()
            .map(|s| (s.name, s.description))
            .collect()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.get_schemas().into_iter().map(|s| s.name).collect()
    }

    /// Single dispatch entry: execute a tool call with error isolation and
    /// output truncation.
    pub async fn execute(&self, name: &str, arguments: serde_json::Value) -> String {
        let tool = {
            let tools = self.tools.read().expect("tool registry lock poisoned");
            tools.get(name).cloned()
        };
        let tool = match tool {
            Some(t) => t,
            None => return format!("Error: Unknown tool '{name}'"),
        };

        let result = match tool.execute(arguments).await {
            Ok(result) => result,
            Err(ToolError::InvalidArguments(detail)) => {
                warn!(tool = name, detail = %detail, "tool argument error");
                return format!("Error: Invalid arguments for '{name}': {detail}");
            }
            Err(ToolError::Failed(detail)) => {
                // The returned string goes back to the model — keep host
                // paths and internals out of it.
                error!(tool = name, detail = %detail, "tool execution failed");
                return format!("Error: Tool '{name}' execution failed");
            }
        };

        self.truncate(result)
    }

    fn truncate(&self, result: String) -> String {
        if result.chars().count() <= self.truncation_limit {
            return result;
        }
        let cut: String = result.chars().take(self.truncation_limit).collect();
        format!("{cut}\n[truncated at {} chars]", self.truncation_limit)
    }
}
