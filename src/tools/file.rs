//! Sandboxed file read/write for task output.
//!
//! Paths resolve inside `{base}/{project_id}/`; traversal outside the
//! sandbox is rejected. The executor injects `project_id` into the call
//! parameters, so the model only ever supplies relative paths.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::Tool;

const MAX_READ_CHARS: usize = 50_000;

/// Resolve a relative path within the project sandbox, rejecting traversal.
fn safe_path(base: &Path, project_id: &str, rel_path: &str) -> anyhow::Result<PathBuf> {
    let rel = Path::new(rel_path);
    if rel.is_absolute() {
        anyhow::bail!("absolute paths are not allowed: {rel_path}");
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => anyhow::bail!("path traversal detected: {rel_path}"),
        }
    }
    Ok(base.join(project_id).join(rel))
}

fn param_str<'a>(params: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    params[key]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("missing '{key}' parameter"))
}

/// Read a file from the project workspace.
pub struct ReadFileTool {
    base: PathBuf,
}

impl ReadFileTool {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file from the project workspace."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Relative file path within the project workspace"
                },
                "project_id": {
                    "type": "string",
                    "description": "Project ID (auto-injected by the executor)"
                }
            },
            "required": ["path", "project_id"]
        })
    }

    async fn execute(&self, params: Value) -> anyhow::Result<String> {
        let project_id = param_str(&params, "project_id")?;
        let rel_path = param_str(&params, "path")?;
        let path = safe_path(&self.base, project_id, rel_path)?;

        if !path.exists() {
            return Ok(format!("Error: file not found: {rel_path}"));
        }
        let content = tokio::fs::read_to_string(&path).await?;
        if content.chars().count() > MAX_READ_CHARS {
            let truncated: String = content.chars().take(MAX_READ_CHARS).collect();
            return Ok(format!(
                "{truncated}\n\n... (truncated, {} chars total)",
                content.chars().count()
            ));
        }
        Ok(content)
    }
}

/// Write a file into the project workspace.
pub struct WriteFileTool {
    base: PathBuf,
}

impl WriteFileTool {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a file to the project workspace."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Relative file path within the project workspace"
                },
                "content": {
                    "type": "string",
                    "description": "File content to write"
                },
                "project_id": {
                    "type": "string",
                    "description": "Project ID (auto-injected by the executor)"
                }
            },
            "required": ["path", "content", "project_id"]
        })
    }

    async fn execute(&self, params: Value) -> anyhow::Result<String> {
        let project_id = param_str(&params, "project_id")?;
        let rel_path = param_str(&params, "path")?;
        let content = param_str(&params, "content")?;
        let path = safe_path(&self.base, project_id, rel_path)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        Ok(format!("File written: {rel_path} ({} chars)", content.len()))
    }
}
