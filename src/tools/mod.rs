//! Tool system for task agents.
//!
//! Each tool exposes a name, a JSON schema, and a synchronous contract:
//! inputs in, one result string out. Tools may perform their own I/O (file
//! access inside a project sandbox, calls to the local model). Failures
//! become error strings returned to the model, never panics.

mod file;
mod local_llm;

pub use file::{ReadFileTool, WriteFileTool};
pub use local_llm::LocalLlmTool;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::provider::ToolSpec;

/// Trait for implementing tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name of this tool.
    fn name(&self) -> &str;

    /// What this tool does, shown to the model.
    fn description(&self) -> &str;

    /// JSON schema for the tool's parameters.
    fn input_schema(&self) -> Value;

    /// Health resource this tool needs online before the owning task can be
    /// dispatched. None means always available.
    fn required_resource(&self) -> Option<&str> {
        None
    }

    /// Execute the tool with the given parameters.
    async fn execute(&self, params: Value) -> anyhow::Result<String>;
}

/// Validate parameters against a tool's schema: every property listed in
/// `required` must be present.
pub fn validate_params(schema: &Value, params: &Value) -> Result<(), String> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    for key in required.iter().filter_map(Value::as_str) {
        if params.get(key).is_none() {
            return Err(format!("missing required parameter '{key}'"));
        }
    }
    Ok(())
}

/// Registry of tools available to task agents.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool under its own name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Resolve multiple tools by name. Unknown names are skipped.
    pub fn get_many(&self, names: &[String]) -> Vec<Arc<dyn Tool>> {
        names.iter().filter_map(|n| self.get(n)).collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn all_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Provider-facing definitions for a subset of tools.
    pub fn specs_for(&self, names: &[String]) -> Vec<ToolSpec> {
        self.get_many(names)
            .into_iter()
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back."
        }
        fn input_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            })
        }
        async fn execute(&self, params: Value) -> anyhow::Result<String> {
            Ok(params["text"].as_str().unwrap_or_default().to_string())
        }
    }

    #[test]
    fn registry_resolves_known_names_only() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));

        assert!(registry.has_tool("echo"));
        let resolved = registry.get_many(&["echo".to_string(), "missing".to_string()]);
        assert_eq!(resolved.len(), 1);

        let specs = registry.specs_for(&["echo".to_string()]);
        assert_eq!(specs[0].name, "echo");
        assert_eq!(specs[0].input_schema["required"][0], "text");
    }

    #[test]
    fn required_params_enforced() {
        let schema = json!({"type": "object", "required": ["path"]});
        assert!(validate_params(&schema, &json!({"path": "x"})).is_ok());
        let err = validate_params(&schema, &json!({})).unwrap_err();
        assert!(err.contains("path"));
    }

    #[tokio::test]
    async fn execute_round_trip() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        let tool = registry.get("echo").unwrap();
        let out = tool.execute(json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, "hi");
    }
}
