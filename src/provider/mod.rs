//! Provider abstraction over language model backends.
//!
//! The core requires only the capability set {generate, embed} plus the
//! health probe owned by the resource monitor; concrete providers are
//! swappable. Messages use typed content blocks so the agent loop can route
//! tool invocations without touching provider wire formats.

mod anthropic;
mod error;
mod ollama;

pub use anthropic::AnthropicProvider;
pub use error::{classify_http_status, ProviderError, ProviderErrorKind};
pub use ollama::OllamaProvider;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One content block of a message or response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// The model requests a tool invocation.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// Result of a tool invocation, fed back to the model.
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
        }
    }
}

/// A message in the conversation sent to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
}

impl ProviderMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
        }
    }

    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: MessageRole::User,
            content: results,
        }
    }
}

/// Tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A generate request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub system: String,
    pub max_tokens: u32,
    pub messages: Vec<ProviderMessage>,
    pub tools: Vec<ToolSpec>,
    /// Per-request timeout; overrides the client default.
    pub timeout: Duration,
}

/// A generate response.
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub content: Vec<ContentBlock>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub stop_reason: Option<String>,
    pub model: String,
}

impl GenerateResponse {
    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        parts.join("\n")
    }

    /// Tool invocations requested by the model, in response order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// Capability set the core requires from a model backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier used for routing and usage attribution
    /// (e.g. "anthropic", "ollama").
    fn id(&self) -> &str;

    /// One request/response turn, optionally advertising tools.
    async fn generate(&self, request: GenerateRequest)
        -> Result<GenerateResponse, ProviderError>;

    /// Embed text into a vector. Not every provider supports this.
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::unsupported(format!(
            "provider '{}' does not support embeddings",
            self.id()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_block_wire_shape() {
        let block = ContentBlock::ToolUse {
            id: "tu_1".into(),
            name: "read_file".into(),
            input: json!({"path": "a.txt"}),
        };
        let wire = serde_json::to_value(&block).unwrap();
        assert_eq!(wire["type"], "tool_use");
        assert_eq!(wire["name"], "read_file");

        let back: ContentBlock = serde_json::from_value(wire).unwrap();
        match back {
            ContentBlock::ToolUse { name, .. } => assert_eq!(name, "read_file"),
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn response_accessors() {
        let response = GenerateResponse {
            content: vec![
                ContentBlock::text("thinking"),
                ContentBlock::ToolUse {
                    id: "tu_1".into(),
                    name: "write_file".into(),
                    input: json!({}),
                },
                ContentBlock::text("done"),
            ],
            input_tokens: 10,
            output_tokens: 5,
            stop_reason: Some("tool_use".into()),
            model: "m".into(),
        };
        assert_eq!(response.text(), "thinking\ndone");
        assert_eq!(response.tool_uses().len(), 1);
    }
}
