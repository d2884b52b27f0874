//! Per-task agent loop.
//!
//! Runs one task against one provider for up to `max_tool_rounds`
//! request/response turns, executing tool invocations between rounds. The
//! runner never mutates task rows; it records spend per round and returns a
//! result the worker applies atomically. Cancellation is honored at the
//! provider call and between tool invocations.

use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::budget::{BudgetManager, SpendRecord};
use crate::config::Config;
use crate::events::EventBus;
use crate::pricing;
use crate::provider::{ContentBlock, GenerateRequest, Provider, ProviderError, ProviderMessage};
use crate::store::{EventKind, Task};
use crate::tools::{validate_params, ToolRegistry};

/// Why an agent run did not produce a result.
#[derive(Debug)]
pub enum AgentError {
    /// The cancellation token fired; the worker transitions the task to
    /// CANCELLED.
    Cancelled,
    /// Provider call failed; `is_transient` drives the retry policy.
    Provider(ProviderError),
    /// Accounting or event persistence failed mid-run.
    Internal(String),
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentError::Cancelled => write!(f, "cancelled"),
            AgentError::Provider(e) => write!(f, "{e}"),
            AgentError::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

/// Result of one agent run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub output_text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_nanos: u64,
    pub model_used: String,
    /// True when the tool loop was stopped early by budget exhaustion; the
    /// task completes with whatever output accumulated.
    pub partial: bool,
}

/// Executes one task via one provider with tool support.
pub struct AgentRunner {
    registry: Arc<ToolRegistry>,
    budget: Arc<BudgetManager>,
    events: Arc<EventBus>,
    config: Arc<Config>,
}

impl AgentRunner {
    pub fn new(
        registry: Arc<ToolRegistry>,
        budget: Arc<BudgetManager>,
        events: Arc<EventBus>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            registry,
            budget,
            events,
            config,
        }
    }

    /// Run the tool loop for a task.
    ///
    /// After every round the runner records the round's spend and re-checks
    /// the global budget; on exhaustion it breaks with a partial result.
    pub async fn run(
        &self,
        task: &Task,
        model_id: &str,
        provider: Arc<dyn Provider>,
        system_prompt: String,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome, AgentError> {
        let internal = |e: crate::error::OrchestrationError| AgentError::Internal(e.to_string());

        let tools = self.registry.get_many(&task.tools);
        let tool_specs = self.registry.specs_for(&task.tools);
        let mut messages = vec![ProviderMessage::user_text(&task.description)];

        let mut total_prompt = 0u64;
        let mut total_completion = 0u64;
        let mut total_cost = 0u64;
        let mut text_parts: Vec<String> = Vec::new();
        let mut budget_exhausted = false;

        for round in 0..self.config.max_tool_rounds {
            if cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            let request = GenerateRequest {
                model: model_id.to_string(),
                system: system_prompt.clone(),
                max_tokens: task.max_tokens,
                messages: messages.clone(),
                tools: tool_specs.clone(),
                timeout: self.config.api_timeout,
            };
            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                result = provider.generate(request) => result.map_err(AgentError::Provider)?,
            };

            let cost = pricing::cost_nanos(model_id, response.input_tokens, response.output_tokens);
            total_prompt += response.input_tokens;
            total_completion += response.output_tokens;
            total_cost += cost;

            self.budget
                .record(SpendRecord {
                    cost_nanos: cost,
                    prompt_tokens: response.input_tokens,
                    completion_tokens: response.output_tokens,
                    provider: provider.id(),
                    model: model_id,
                    purpose: "execution",
                    project_id: Some(task.project_id.as_str()),
                    task_id: Some(task.id.as_str()),
                })
                .await
                .map_err(internal)?;

            // Hard stop. The shared budget may have been exhausted by
            // concurrent tasks even while this one is under its own
            // reservation, so every round re-checks.
            if !self.budget.can_continue().await.map_err(internal)? {
                tracing::warn!(
                    task_id = %task.id,
                    rounds = round + 1,
                    "budget exhausted mid tool loop, returning partial result"
                );
                budget_exhausted = true;
            }

            let mut has_tool_use = false;
            let mut tool_results: Vec<ContentBlock> = Vec::new();

            for block in &response.content {
                match block {
                    ContentBlock::Text { text } => text_parts.push(text.clone()),
                    ContentBlock::ToolUse { id, name, input } => {
                        has_tool_use = true;
                        if cancel.is_cancelled() {
                            return Err(AgentError::Cancelled);
                        }

                        self.events
                            .publish(
                                &task.project_id,
                                Some(task.id.as_str()),
                                EventKind::ToolCall,
                                format!("Calling {name}"),
                                json!({ "tool": name }),
                            )
                            .await
                            .map_err(internal)?;

                        let result = self
                            .invoke_tool(&tools, name, input.clone(), &task.project_id)
                            .await;
                        tool_results.push(ContentBlock::tool_result(id.clone(), result));
                    }
                    ContentBlock::ToolResult { .. } => {}
                }
            }

            if !has_tool_use || budget_exhausted {
                break;
            }

            messages.push(ProviderMessage::assistant(response.content));
            messages.push(ProviderMessage::tool_results(tool_results));
        }

        Ok(AgentOutcome {
            output_text: text_parts.join("\n"),
            prompt_tokens: total_prompt,
            completion_tokens: total_completion,
            cost_nanos: total_cost,
            model_used: model_id.to_string(),
            partial: budget_exhausted,
        })
    }

    /// Execute one tool invocation; every failure becomes an error string
    /// returned to the model.
    async fn invoke_tool(
        &self,
        tools: &[Arc<dyn crate::tools::Tool>],
        name: &str,
        mut input: serde_json::Value,
        project_id: &str,
    ) -> String {
        let Some(tool) = tools.iter().find(|t| t.name() == name) else {
            return format!("Unknown tool: {name}");
        };

        // File tools operate inside the project sandbox; the id comes from
        // the executor, never from the model.
        if matches!(name, "read_file" | "write_file") {
            if let Some(map) = input.as_object_mut() {
                map.insert("project_id".to_string(), json!(project_id));
            }
        }

        if let Err(reason) = validate_params(&tool.input_schema(), &input) {
            return format!("Tool error: {reason}");
        }

        match tool.execute(input).await {
            Ok(result) => result,
            Err(e) => format!("Tool error: {e}"),
        }
    }
}
