//! Hosted messages-API client.
//!
//! Speaks the Anthropic messages wire format: system string, content-block
//! messages, tool definitions with JSON schemas. One client instance is
//! created at startup and shared by all workers; per-request timeouts
//! override the client default.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{classify_http_status, ProviderError, ProviderErrorKind};
use super::{ContentBlock, GenerateRequest, GenerateResponse, Provider, ProviderMessage};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [ProviderMessage],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Serialize)]
struct WireTool<'a> {
    name: &'a str,
    description: &'a str,
    input_schema: &'a Value,
}

#[derive(Deserialize)]
struct WireResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    model: Option<String>,
    usage: WireUsage,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct WireError {
    error: WireErrorBody,
}

#[derive(Deserialize)]
struct WireErrorBody {
    #[serde(default)]
    message: String,
}

impl AnthropicProvider {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            // Generous client default; callers pass tighter per-request timeouts.
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .expect("reqwest client"),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    async fn generate(
        &self,
        request: GenerateRequest,
    ) -> Result<GenerateResponse, ProviderError> {
        let tools: Vec<WireTool<'_>> = request
            .tools
            .iter()
            .map(|t| WireTool {
                name: &t.name,
                description: &t.description,
                input_schema: &t.input_schema,
            })
            .collect();
        let body = WireRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            system: &request.system,
            messages: &request.messages,
            tools,
        };

        let response = self
            .http
            .post(self.endpoint())
            .timeout(request.timeout)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let message = match response.json::<WireError>().await {
                Ok(e) => e.error.message,
                Err(_) => format!("HTTP {status}"),
            };
            return Err(match classify_http_status(status) {
                ProviderErrorKind::RateLimited => ProviderError::rate_limited(message, retry_after),
                ProviderErrorKind::ClientError => ProviderError::client_error(status, message),
                _ => ProviderError::server_error(status, message),
            });
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::parse_error(e.to_string()))?;

        Ok(GenerateResponse {
            content: wire.content,
            input_tokens: wire.usage.input_tokens,
            output_tokens: wire.usage.output_tokens,
            stop_reason: wire.stop_reason,
            model: wire.model.unwrap_or(request.model),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_to_wire_format() {
        let messages = [ProviderMessage::user_text("hi")];
        let request = WireRequest {
            model: "claude-haiku-4-5",
            max_tokens: 256,
            system: "be brief",
            messages: &messages,
            tools: vec![],
        };
        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["model"], "claude-haiku-4-5");
        assert_eq!(wire["messages"][0]["role"], "user");
        assert_eq!(wire["messages"][0]["content"][0]["type"], "text");
        // Empty tool list is omitted entirely.
        assert!(wire.get("tools").is_none());
    }

    #[test]
    fn response_parses_tool_use() {
        let raw = json!({
            "content": [
                {"type": "text", "text": "let me check"},
                {"type": "tool_use", "id": "tu_1", "name": "read_file", "input": {"path": "x"}}
            ],
            "stop_reason": "tool_use",
            "model": "claude-haiku-4-5",
            "usage": {"input_tokens": 12, "output_tokens": 34}
        });
        let wire: WireResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(wire.usage.input_tokens, 12);
        assert_eq!(wire.content.len(), 2);
    }
}
