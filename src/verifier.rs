//! Output verification.
//!
//! Optional quality gate after a paid task completes: a cheap-model call
//! classifies the output as passed, gaps_found, or human_needed. A reply the
//! verifier cannot parse escalates to human review rather than silently
//! passing.

use std::sync::Arc;

use crate::budget::{BudgetManager, SpendRecord};
use crate::config::Config;
use crate::error::Result;
use crate::pricing;
use crate::provider::{GenerateRequest, Provider, ProviderMessage};
use crate::store::{Task, VerificationStatus};

const VERIFICATION_PROMPT: &str = r#"You are a task output verifier. Given a task description and the output produced, assess whether the output is acceptable.

Check for:
1. Substantiveness: is the output real content, or empty/stub/placeholder?
2. Relevance: does the output address the task description?
3. Completeness: does the output cover the key aspects of what was asked?

Respond with ONLY a JSON object (no markdown):
{"verdict": "passed" | "gaps_found" | "human_needed", "notes": "brief explanation"}

Rules:
- "passed": substantive, relevant, reasonably complete.
- "gaps_found": empty, stub, off-topic, or missing key aspects; the task should retry with feedback.
- "human_needed": fundamental issues requiring human judgment."#;

/// Verify task output quality. Records verification spend against the task.
pub async fn verify_output(
    provider: Arc<dyn Provider>,
    budget: &BudgetManager,
    config: &Config,
    task: &Task,
    output_text: &str,
) -> Result<(VerificationStatus, String)> {
    let user_message = format!(
        "## Task: {}\n\n### Description\n{}\n\n### Output\n{}",
        task.title,
        task.description,
        if output_text.is_empty() {
            "(empty)"
        } else {
            output_text
        }
    );

    let request = GenerateRequest {
        model: config.verification_model.clone(),
        system: VERIFICATION_PROMPT.to_string(),
        max_tokens: config.verification_max_tokens,
        messages: vec![ProviderMessage::user_text(user_message)],
        tools: Vec::new(),
        timeout: config.api_timeout,
    };
    let response = provider.generate(request).await?;

    let cost = pricing::cost_nanos(
        &config.verification_model,
        response.input_tokens,
        response.output_tokens,
    );
    budget
        .record(SpendRecord {
            cost_nanos: cost,
            prompt_tokens: response.input_tokens,
            completion_tokens: response.output_tokens,
            provider: provider.id(),
            model: &config.verification_model,
            purpose: "verification",
            project_id: Some(task.project_id.as_str()),
            task_id: Some(task.id.as_str()),
        })
        .await?;

    let raw = response.text();
    let (verdict, notes) = match crate::planner::extract_json_object(&raw) {
        Some(parsed) => {
            let verdict = parsed["verdict"]
                .as_str()
                .and_then(VerificationStatus::parse)
                .unwrap_or(VerificationStatus::Passed);
            let notes = parsed["notes"].as_str().unwrap_or("").to_string();
            (verdict, notes)
        }
        None => {
            tracing::warn!(task_id = %task.id, "unparseable verification reply, escalating");
            (
                VerificationStatus::HumanNeeded,
                "verification reply was not parseable JSON".to_string(),
            )
        }
    };
    Ok((verdict, notes))
}
