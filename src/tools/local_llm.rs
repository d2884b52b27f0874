//! Free local-model delegation tool.
//!
//! Lets a paid task hand drafting or summarization sub-work to the local
//! tier at zero cost. Requires the local host to be online.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::provider::{GenerateRequest, Provider};

use super::Tool;

pub struct LocalLlmTool {
    provider: Arc<dyn Provider>,
    model: String,
    timeout: Duration,
}

impl LocalLlmTool {
    pub fn new(provider: Arc<dyn Provider>, model: String, timeout: Duration) -> Self {
        Self {
            provider,
            model,
            timeout,
        }
    }
}

#[async_trait]
impl Tool for LocalLlmTool {
    fn name(&self) -> &str {
        "local_llm"
    }

    fn description(&self) -> &str {
        "Run a prompt on the free local model. Good for drafts, summaries, and sub-tasks that don't need the main model."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The prompt to run on the local model"
                }
            },
            "required": ["prompt"]
        })
    }

    fn required_resource(&self) -> Option<&str> {
        Some("ollama_local")
    }

    async fn execute(&self, params: Value) -> anyhow::Result<String> {
        let prompt = params["prompt"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing 'prompt' parameter"))?;

        let request = GenerateRequest {
            model: self.model.clone(),
            system: String::new(),
            max_tokens: 2048,
            messages: vec![crate::provider::ProviderMessage::user_text(prompt)],
            tools: Vec::new(),
            timeout: self.timeout,
        };
        let response = self.provider.generate(request).await?;
        Ok(response.text())
    }
}
