//! Local inference client (free tier).
//!
//! Talks to an Ollama-compatible host: `/api/generate` for completions and
//! `/api/embeddings` for vectors. The local tier ignores tool definitions;
//! a response with no tool blocks terminates the agent loop after one round.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::{classify_http_status, ProviderError, ProviderErrorKind};
use super::{ContentBlock, GenerateRequest, GenerateResponse, Provider};

pub struct OllamaProvider {
    http: reqwest::Client,
    base_url: String,
    embed_model: String,
    embed_timeout: Duration,
}

#[derive(Serialize)]
struct WireGenerate<'a> {
    model: &'a str,
    prompt: String,
    system: &'a str,
    stream: bool,
}

#[derive(Deserialize)]
struct WireGenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

#[derive(Serialize)]
struct WireEmbed<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct WireEmbedResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

impl OllamaProvider {
    pub fn new(
        base_url: impl Into<String>,
        embed_model: impl Into<String>,
        embed_timeout: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .expect("reqwest client"),
            base_url: base_url.into(),
            embed_model: embed_model.into(),
            embed_timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(response);
        }
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| format!("HTTP {status}"));
        Err(match classify_http_status(status) {
            ProviderErrorKind::ClientError => ProviderError::client_error(status, message),
            _ => ProviderError::server_error(status, message),
        })
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn id(&self) -> &str {
        "ollama"
    }

    async fn generate(
        &self,
        request: GenerateRequest,
    ) -> Result<GenerateResponse, ProviderError> {
        // Flatten the conversation into a single prompt; the local endpoint
        // has no multi-turn tool protocol.
        let prompt = request
            .messages
            .iter()
            .flat_map(|m| m.content.iter())
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        let body = WireGenerate {
            model: &request.model,
            prompt,
            system: &request.system,
            stream: false,
        };

        let response = self
            .http
            .post(self.url("/api/generate"))
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await?;
        let wire: WireGenerateResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::parse_error(e.to_string()))?;

        Ok(GenerateResponse {
            content: vec![ContentBlock::text(wire.response)],
            input_tokens: wire.prompt_eval_count,
            output_tokens: wire.eval_count,
            stop_reason: Some("end_turn".to_string()),
            model: request.model,
        })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = WireEmbed {
            model: &self.embed_model,
            prompt: text,
        };
        let response = self
            .http
            .post(self.url("/api/embeddings"))
            .timeout(self.embed_timeout)
            .json(&body)
            .send()
            .await?;
        let wire: WireEmbedResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::parse_error(e.to_string()))?;
        if wire.embedding.is_empty() {
            return Err(ProviderError::parse_error("empty embedding"));
        }
        Ok(wire.embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_response_shape() {
        let raw = serde_json::json!({
            "response": "42",
            "prompt_eval_count": 7,
            "eval_count": 2
        });
        let wire: WireGenerateResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(wire.response, "42");
        assert_eq!(wire.prompt_eval_count, 7);
    }

    #[test]
    fn missing_counts_default_to_zero() {
        let wire: WireGenerateResponse =
            serde_json::from_value(serde_json::json!({"response": "ok"})).unwrap();
        assert_eq!(wire.eval_count, 0);
    }
}
