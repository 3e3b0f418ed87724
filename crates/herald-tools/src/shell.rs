//! Shell execution tool — `exec`.
//!
//! Commands run under `sh -c` in their own process group with a filtered
//! environment: anything that looks like a secret never reaches the child.
//! On timeout the whole group is SIGKILLed so background children don't
//! survive as orphans.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::{parse_args, Tool, ToolError};

/// Env var name suffixes treated as secrets regardless of prefix.
const SECRET_SUFFIXES: [&str; 8] = [
    "_KEY",
    "_TOKEN",
    "_SECRET",
    "_PASSWORD",
    "_CREDENTIALS",
    "_ID",
    "_CODE",
    "_PASS",
];

pub struct ExecTool {
    default_timeout_secs: u64,
    max_timeout_secs: u64,
    secret_prefixes: Vec<String>,
}

impl ExecTool {
    pub fn new(default_timeout_secs: u64, max_timeout_secs: u64, secret_prefixes: Vec<String>) -> Self {
        Self {
            default_timeout_secs,
            max_timeout_secs,
            secret_prefixes,
        }
    }

    /// Environment for the child, with secret variables filtered out.
    fn safe_env(&self) -> Vec<(String, String)> {
        std::env::vars()
            .filter(|(name, _)| !is_secret_name(name, &self.secret_prefixes))
            .collect()
    }
}

fn is_secret_name(name: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| name.starts_with(p.as_str()))
        || SECRET_SUFFIXES.iter().any(|s| name.ends_with(s))
}

#[derive(Deserialize)]
struct ExecArgs {
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> String {
        "Execute a shell command. Returns stdout, stderr, and exit code.".into()
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command to execute"},
                "timeout": {
                    "type": "integer",
                    "description": format!(
                        "Timeout in seconds (default: {}, max: {})",
                        self.default_timeout_secs, self.max_timeout_secs
                    ),
                },
            },
            "required": ["command"],
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let args: ExecArgs = parse_args(arguments)?;
        let timeout_secs = args
            .timeout
            .unwrap_or(self.default_timeout_secs)
            .min(self.max_timeout_secs);

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&args.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear()
            .envs(self.safe_env());
        // Own process group, so a timeout kill reaches grandchildren too.
        #[cfg(unix)]
        cmd.process_group(0);

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "shell spawn failed");
                return Ok("Error: Command execution failed".to_string());
            }
        };
        let pid = child.id();

        let mut wait = tokio::spawn(child.wait_with_output());
        let output = match tokio::time::timeout(Duration::from_secs(timeout_secs), &mut wait).await
        {
            Ok(Ok(Ok(output))) => output,
            Ok(Ok(Err(e))) => {
                warn!(error = %e, "shell wait failed");
                return Ok("Error: Command execution failed".to_string());
            }
            Ok(Err(_join)) => {
                return Ok("Error: Command execution failed".to_string());
            }
            Err(_elapsed) => {
                kill_hard(pid);
                // Reap — the wait task still owns the child.
                let _ = wait.await;
                return Ok(format!("Error: Command timed out after {timeout_secs}s"));
            }
        };

        let mut result = String::new();
        let out = String::from_utf8_lossy(&output.stdout);
        let err = String::from_utf8_lossy(&output.stderr);
        if !out.is_empty() {
            result.push_str(&out);
        }
        if !err.is_empty() {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str(&format!("STDERR:\n{err}"));
        }
        let exit_code = output.status.code().unwrap_or(-1);
        if exit_code != 0 {
            result.push_str(&format!("\n[exit code: {exit_code}]"));
        }

        if result.is_empty() {
            Ok("(no output)".to_string())
        } else {
            Ok(result)
        }
    }
}

/// SIGKILL the process group; fall back to the direct child.
fn kill_hard(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    #[cfg(unix)]
    // Safety: pid is our direct child, placed in its own group at spawn.
    unsafe {
        if libc::killpg(pid as libc::pid_t, libc::SIGKILL) != 0 {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .output();
    }
}
