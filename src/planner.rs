//! Plan generation.
//!
//! Drives the planning model to produce a structured plan from a project's
//! requirements. The reply may wrap the plan JSON in prose; extraction uses
//! brace counting rather than a greedy regex so it stops at the actual
//! closing brace. Each successful call stores a new DRAFT plan version and
//! supersedes earlier drafts.

use std::sync::Arc;

use serde_json::Value;

use crate::budget::{BudgetManager, SpendRecord};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{OrchestrationError, Result};
use crate::pricing;
use crate::provider::{GenerateRequest, Provider, ProviderMessage};
use crate::store::{new_id, Plan, PlanStatus, ProjectStatus, Store};

// Token estimates for the pre-flight budget check.
const EST_PLANNING_INPUT_TOKENS: u64 = 2000;
const EST_PLANNING_OUTPUT_TOKENS: u64 = 2000;

const PLANNING_SYSTEM: &str = r#"You are a project planner for a task orchestration engine. Analyze the requirements and produce a structured execution plan.

Respond with ONLY a JSON object of this shape:
{
  "summary": "Brief summary of what will be built",
  "tasks": [
    {
      "title": "Short task title",
      "description": "What this task must produce",
      "task_type": "code|research|analysis|asset|integration|documentation",
      "complexity": "simple|medium|complex",
      "depends_on": [],
      "tools_needed": ["read_file", "write_file", "local_llm"]
    }
  ]
}

Rules:
- Break work into small, focused tasks completable in a single model conversation.
- Use "depends_on" with 0-based task indices for ordering dependencies.
- Prefer simple tasks when possible; they route to cheaper models.
- Order tasks so independent work can run in parallel.
- Aim for 3-15 tasks."#;

/// Extract the first balanced JSON object from text.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escape {
            escape = false;
            continue;
        }
        match byte {
            b'\\' => escape = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + offset + 1];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Generate a plan from the project's requirements.
pub async fn generate_plan(
    store: &Store,
    budget: &BudgetManager,
    provider: Arc<dyn Provider>,
    clock: &Arc<dyn Clock>,
    config: &Config,
    project_id: &str,
) -> Result<Plan> {
    let project = store
        .get_project(project_id)
        .await?
        .ok_or_else(|| OrchestrationError::NotFound(format!("project {project_id}")))?;
    if project.status.is_terminal() || project.status == ProjectStatus::Executing {
        return Err(OrchestrationError::Conflict(format!(
            "cannot plan a project in status '{}'",
            project.status
        )));
    }

    let estimated = pricing::cost_nanos(
        &config.planning_model,
        EST_PLANNING_INPUT_TOKENS,
        EST_PLANNING_OUTPUT_TOKENS,
    );
    if !budget.can_spend(estimated).await? {
        return Err(OrchestrationError::BudgetExhausted(
            "planning would exceed the budget".into(),
        ));
    }

    store
        .set_project_status(project_id, ProjectStatus::Planning)
        .await?;

    let request = GenerateRequest {
        model: config.planning_model.clone(),
        system: PLANNING_SYSTEM.to_string(),
        max_tokens: config.default_max_tokens,
        messages: vec![ProviderMessage::user_text(&project.requirements)],
        tools: Vec::new(),
        timeout: config.api_timeout,
    };
    let response = match provider.generate(request).await {
        Ok(response) => response,
        Err(e) => {
            // Don't leave the project stuck in PLANNING.
            store
                .set_project_status(project_id, ProjectStatus::Draft)
                .await?;
            return Err(e.into());
        }
    };

    let cost = pricing::cost_nanos(
        &config.planning_model,
        response.input_tokens,
        response.output_tokens,
    );
    budget
        .record(SpendRecord {
            cost_nanos: cost,
            prompt_tokens: response.input_tokens,
            completion_tokens: response.output_tokens,
            provider: provider.id(),
            model: &config.planning_model,
            purpose: "planning",
            project_id: Some(project_id),
            task_id: None,
        })
        .await?;

    let payload = match extract_json_object(&response.text()) {
        Some(payload) if payload["tasks"].is_array() => payload,
        _ => {
            store
                .set_project_status(project_id, ProjectStatus::Draft)
                .await?;
            return Err(OrchestrationError::PlanParse(
                "planning reply did not contain a plan object with tasks".into(),
            ));
        }
    };

    let version = store.max_plan_version(project_id).await? + 1;
    store.supersede_draft_plans(project_id).await?;

    let plan = Plan {
        id: new_id(),
        project_id: project_id.to_string(),
        version,
        model_used: config.planning_model.clone(),
        prompt_tokens: response.input_tokens,
        completion_tokens: response.output_tokens,
        cost_nanos: cost,
        payload,
        status: PlanStatus::Draft,
        created_at: clock.now(),
    };
    store.insert_plan(&plan).await?;

    // Back to draft: the plan awaits approval.
    store
        .set_project_status(project_id, ProjectStatus::Draft)
        .await?;

    tracing::info!(project_id, version, "plan generated");
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_object() {
        let value = extract_json_object(r#"{"summary": "x", "tasks": []}"#).unwrap();
        assert_eq!(value["summary"], "x");
    }

    #[test]
    fn extracts_object_wrapped_in_prose() {
        let text = "Here is the plan:\n{\"summary\": \"s\", \"tasks\": [{\"title\": \"a\"}]}\nLet me know!";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["tasks"][0]["title"], "a");
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_extraction() {
        let text = r#"{"summary": "uses { and } freely \" escaped", "tasks": []} trailing {"#;
        let value = extract_json_object(text).unwrap();
        assert!(value["summary"].as_str().unwrap().contains('{'));
    }

    #[test]
    fn unbalanced_text_yields_none() {
        assert!(extract_json_object("no json here").is_none());
        assert!(extract_json_object("{\"open\": ").is_none());
    }
}
