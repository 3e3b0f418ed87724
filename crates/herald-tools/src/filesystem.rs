//! File operation tools — read, write, edit — behind a path allowlist.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::{parse_args, Tool, ToolError};

/// Longest line kept verbatim by `read`; longer lines are cut.
const MAX_LINE_CHARS: usize = 2000;
const DEFAULT_READ_LIMIT: usize = 2000;

/// Process-wide allowlist of resolved path prefixes.
///
/// A path is allowed iff, after tilde expansion and symlink resolution, it
/// equals a prefix or sits below one. An empty allowlist denies everything.
#[derive(Debug, Clone, Default)]
pub struct PathAllowlist {
    prefixes: Vec<PathBuf>,
}

impl PathAllowlist {
    /// Build from configured prefix strings; each prefix is itself resolved.
    pub fn new(paths: &[String]) -> Self {
        Self {
            prefixes: paths.iter().map(|p| resolve(p)).collect(),
        }
    }

    /// Resolve `path` and validate it against the allowlist.
    pub fn check(&self, path: &str) -> Result<PathBuf, String> {
        let resolved = resolve(path);
        if self.prefixes.is_empty() {
            return Err("Error: No allowed paths configured — filesystem access denied".into());
        }
        for prefix in &self.prefixes {
            if resolved.starts_with(prefix) {
                return Ok(resolved);
            }
        }
        let allowed: Vec<String> = self
            .prefixes
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        Err(format!(
            "Error: Path not allowed: {path} (allowed prefixes: {})",
            allowed.join(", ")
        ))
    }
}

/// Expand `~`, make absolute, and resolve symlinks.
///
/// `std::fs::canonicalize` requires the path to exist, but `write` targets
/// usually don't yet: canonicalize the deepest existing ancestor and append
/// the remaining components lexically.
fn resolve(path: &str) -> PathBuf {
    let expanded = if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    };
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir().unwrap_or_default().join(expanded)
    };

    let mut base = absolute.clone();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match std::fs::canonicalize(&base) {
            Ok(canonical) => {
                let mut result = canonical;
                for component in tail.iter().rev() {
                    result.push(component);
                }
                return normalize_lexically(&result);
            }
            Err(_) => match (base.file_name(), base.parent()) {
                (Some(name), Some(parent)) => {
                    tail.push(name.to_os_string());
                    base = parent.to_path_buf();
                }
                _ => return normalize_lexically(&absolute),
            },
        }
    }
}

/// Strip `.` and fold `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub struct ReadTool {
    allowlist: Arc<PathAllowlist>,
}

impl ReadTool {
    pub fn new(allowlist: Arc<PathAllowlist>) -> Self {
        Self { allowlist }
    }
}

#[derive(Deserialize)]
struct ReadArgs {
    file_path: String,
    #[serde(default)]
    offset: usize,
    #[serde(default = "default_read_limit")]
    limit: usize,
}

fn default_read_limit() -> usize {
    DEFAULT_READ_LIMIT
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> String {
        "Read a file. Returns numbered lines. Use offset/limit for large files.".into()
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {"type": "string", "description": "Absolute path to the file"},
                "offset": {"type": "integer", "description": "Line offset (0-based)", "default": 0},
                "limit": {"type": "integer", "description": "Max lines to read", "default": DEFAULT_READ_LIMIT},
            },
            "required": ["file_path"],
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let args: ReadArgs = parse_args(arguments)?;
        let path = match self.allowlist.check(&args.file_path) {
            Ok(p) => p,
            Err(msg) => return Ok(msg),
        };
        if !path.exists() {
            return Ok(format!("Error: File not found: {}", args.file_path));
        }
        if !path.is_file() {
            return Ok(format!("Error: Not a file: {}", args.file_path));
        }
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Ok(format!("Error: Permission denied: {}", args.file_path));
            }
            Err(e) => return Err(ToolError::Failed(e.to_string())),
        };
        let content = match String::from_utf8(bytes) {
            Ok(c) => c,
            Err(_) => return Ok(format!("Error: Cannot read binary file: {}", args.file_path)),
        };

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();
        let mut result = String::new();
        for (i, line) in lines.iter().enumerate().skip(args.offset).take(args.limit) {
            let line = if line.chars().count() > MAX_LINE_CHARS {
                let cut: String = line.chars().take(MAX_LINE_CHARS).collect();
                format!("{cut}...")
            } else {
                (*line).to_string()
            };
            result.push_str(&format!("{:>6}\t{}\n", i + 1, line));
        }
        if args.offset + args.limit < total {
            result.push_str(&format!(
                "\n[... {} more lines]",
                total - args.offset - args.limit
            ));
        }
        Ok(result)
    }
}

pub struct WriteTool {
    allowlist: Arc<PathAllowlist>,
}

impl WriteTool {
    pub fn new(allowlist: Arc<PathAllowlist>) -> Self {
        Self { allowlist }
    }
}

#[derive(Deserialize)]
struct WriteArgs {
    file_path: String,
    content: String,
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> String {
        "Write content to a file. Creates directories as needed. Overwrites existing files.".into()
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {"type": "string", "description": "Absolute path to the file"},
                "content": {"type": "string", "description": "Content to write"},
            },
            "required": ["file_path", "content"],
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let args: WriteArgs = parse_args(arguments)?;
        let path = match self.allowlist.check(&args.file_path) {
            Ok(p) => p,
            Err(msg) => return Ok(msg),
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Err(ToolError::Failed(e.to_string()));
            }
        }
        match tokio::fs::write(&path, &args.content).await {
            Ok(()) => Ok(format!(
                "Written {} chars to {}",
                args.content.chars().count(),
                args.file_path
            )),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Ok(format!("Error: Permission denied: {}", args.file_path))
            }
            Err(e) => Err(ToolError::Failed(e.to_string())),
        }
    }
}

pub struct EditTool {
    allowlist: Arc<PathAllowlist>,
}

impl EditTool {
    pub fn new(allowlist: Arc<PathAllowlist>) -> Self {
        Self { allowlist }
    }
}

#[derive(Deserialize)]
struct EditArgs {
    file_path: String,
    old_string: String,
    new_string: String,
    #[serde(default)]
    replace_all: bool,
}

#[async_trait]
impl Tool for EditTool {
    fn name(&self) -> &str {
        "edit"
    }

    fn description(&self) -> String {
        "Edit a file by exact string replacement. old_string must be unique unless replace_all is true.".into()
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "file_path": {"type": "string", "description": "Absolute path to the file"},
                "old_string": {"type": "string", "description": "Exact text to find"},
                "new_string": {"type": "string", "description": "Replacement text"},
                "replace_all": {"type": "boolean", "description": "Replace all occurrences", "default": false},
            },
            "required": ["file_path", "old_string", "new_string"],
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let args: EditArgs = parse_args(arguments)?;
        let path = match self.allowlist.check(&args.file_path) {
            Ok(p) => p,
            Err(msg) => return Ok(msg),
        };
        if !path.exists() {
            return Ok(format!("Error: File not found: {}", args.file_path));
        }
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) => return Err(ToolError::Failed(e.to_string())),
        };
        let content = match String::from_utf8(bytes) {
            Ok(c) => c,
            Err(_) => return Ok(format!("Error: Cannot read binary file: {}", args.file_path)),
        };

        let count = content.matches(&args.old_string).count();
        if count == 0 {
            return Ok(format!("Error: old_string not found in {}", args.file_path));
        }
        let updated = if args.replace_all {
            content.replace(&args.old_string, &args.new_string)
        } else {
            if count > 1 {
                return Ok(format!(
                    "Error: old_string found {count} times in {}. Use replace_all=true or provide more context.",
                    args.file_path
                ));
            }
            content.replacen(&args.old_string, &args.new_string, 1)
        };

        match tokio::fs::write(&path, updated).await {
            Ok(()) => {
                if args.replace_all {
                    Ok(format!("Replaced {count} occurrences in {}", args.file_path))
                } else {
                    Ok(format!("Edited {}", args.file_path))
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Ok(format!("Error: Permission denied: {}", args.file_path))
            }
            Err(e) => Err(ToolError::Failed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn allow(dir: &tempfile::TempDir) -> Arc<PathAllowlist> {
        Arc::new(PathAllowlist::new(&[dir.path().display().to_string()]))
    }

    #[test]
    fn empty_allowlist_denies_everything() {
        let allowlist = PathAllowlist::new(&[]);
        let err = allowlist.check("/tmp/x").unwrap_err();
        assert!(err.contains("filesystem access denied"));
    }

    #[test]
    fn denial_enumerates_allowed_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let allowlist = allow(&dir);
        let err = allowlist.check("/definitely/not/allowed").unwrap_err();
        assert!(err.contains("Path not allowed"));
        assert!(err.contains(&dir.path().display().to_string()));
    }

    #[test]
    fn prefix_match_is_component_wise() {
        let dir = tempfile::tempdir().unwrap();
        let allowlist = allow(&dir);
        // the prefix itself and children are allowed
        assert!(allowlist.check(&dir.path().display().to_string()).is_ok());
        assert!(allowlist
            .check(&dir.path().join("sub/file.txt").display().to_string())
            .is_ok());
        // a sibling sharing the string prefix is not
        let sibling = format!("{}-evil/file.txt", dir.path().display());
        assert!(allowlist.check(&sibling).is_err());
    }

    #[test]
    fn dotdot_cannot_escape_the_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let allowlist = allow(&dir);
        let sneaky = dir.path().join("sub/../../outside.txt");
        assert!(allowlist.check(&sneaky.display().to_string()).is_err());
    }

    #[tokio::test]
    async fn read_numbers_lines_from_offset_plus_one() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.txt");
        let body: String = (1..=10).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&file, body).unwrap();

        let tool = ReadTool::new(allow(&dir));
        let result = tool
            .execute(json!({"file_path": file.display().to_string(), "offset": 3, "limit": 2}))
            .await
            .unwrap();

        assert!(result.starts_with("     4\tline 4\n"));
        assert!(result.contains("     5\tline 5\n"));
        assert!(!result.contains("line 6\t"));
        // 10 total − 3 offset − 2 limit = 5 remaining
        assert!(result.ends_with("[... 5 more lines]"));
    }

    #[tokio::test]
    async fn read_omits_footer_when_file_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("short.txt");
        std::fs::write(&file, "a\nb\n").unwrap();

        let tool = ReadTool::new(allow(&dir));
        let result = tool
            .execute(json!({"file_path": file.display().to_string()}))
            .await
            .unwrap();
        assert!(!result.contains("more lines"));
        assert!(result.contains("     1\ta\n"));
    }

    #[tokio::test]
    async fn read_missing_field_is_invalid_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReadTool::new(allow(&dir));
        let err = tool.execute(json!({"offset": 1})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }

    #[tokio::test]
    async fn write_then_edit_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes/today.md");
        let path = file.display().to_string();

        let write = WriteTool::new(allow(&dir));
        let result = write
            .execute(json!({"file_path": path, "content": "alpha beta alpha"}))
            .await
            .unwrap();
        assert!(result.starts_with("Written 16 chars"));

        let edit = EditTool::new(allow(&dir));
        let ambiguous = edit
            .execute(json!({"file_path": path, "old_string": "alpha", "new_string": "gamma"}))
            .await
            .unwrap();
        assert!(ambiguous.contains("found 2 times"));

        let replaced = edit
            .execute(json!({
                "file_path": path,
                "old_string": "alpha",
                "new_string": "gamma",
                "replace_all": true,
            }))
            .await
            .unwrap();
        assert_eq!(replaced, format!("Replaced 2 occurrences in {path}"));
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "gamma beta gamma");
    }

    #[tokio::test]
    async fn write_outside_allowlist_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let tool = WriteTool::new(allow(&dir));
        let target = other.path().join("escape.txt");
        let result = tool
            .execute(json!({"file_path": target.display().to_string(), "content": "x"}))
            .await
            .unwrap();
        assert!(result.starts_with("Error: Path not allowed"));
        assert!(!target.exists());
    }
}
