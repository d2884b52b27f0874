//! Per-task worker.
//!
//! Acquires a concurrency permit, transitions the task to RUNNING, runs the
//! agent loop, and applies the outcome: completion, retry with backoff,
//! checkpointed review, failure, or cancellation. Errors never escape to the
//! tick loop: every path ends in a task state transition plus a published
//! event. Backoff sleeps never happen here; the worker records a retry
//! deadline and exits, releasing its permit, and the next eligible tick
//! re-dispatches.

use std::sync::Arc;

use rand::Rng;
use serde_json::json;

use tokio_util::sync::CancellationToken;

use crate::agent::{AgentError, AgentOutcome};
use crate::error::Result;
use crate::pricing::format_usd;
use crate::provider::Provider;
use crate::router;
use crate::store::{new_id, Checkpoint, EventKind, Task, VerificationStatus};
use crate::verifier;

use super::{clear_retry, schedule_retry, ExecutorShared};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a focused task executor.";

pub(crate) struct WorkerCtx {
    pub shared: Arc<ExecutorShared>,
    pub task_id: String,
    pub project_id: String,
    pub task: Task,
    pub est_cost: u64,
    pub cancel: CancellationToken,
}

/// Worker entry point. Always removes itself from the dispatch sets and
/// releases its reservation on the way out.
pub(crate) async fn run(ctx: WorkerCtx) {
    if let Err(e) = execute(&ctx).await {
        tracing::error!(task_id = %ctx.task_id, error = %e, "worker error, failing task");
        let message = format!("{}: {e}", ctx.task.title);
        let _ = ctx.shared.store.fail_task(&ctx.task_id, &e.to_string()).await;
        let _ = ctx
            .shared
            .events
            .publish(
                &ctx.project_id,
                Some(ctx.task_id.as_str()),
                EventKind::TaskFailed,
                message,
                json!({}),
            )
            .await;
    }

    ctx.shared.budget.release(ctx.est_cost, &ctx.project_id).await;
    let mut state = ctx.shared.state.lock().unwrap();
    state.dispatched.remove(&ctx.task_id);
    state.inflight.remove(&ctx.task_id);
}

async fn execute(ctx: &WorkerCtx) -> Result<()> {
    let shared = &ctx.shared;

    // Concurrency gate. Cancellation while waiting rolls the task back
    // without ever starting it.
    let permit = tokio::select! {
        _ = ctx.cancel.cancelled() => return handle_cancelled(ctx).await,
        permit = shared.semaphore.clone().acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return Ok(()),
        },
    };
    let _permit = permit; // released on every exit path

    // QUEUED → RUNNING. A false return means the task was cancelled or
    // edited away between claim and start; nothing more to do.
    if !shared.store.mark_running(&ctx.task_id).await? {
        return Ok(());
    }
    shared
        .events
        .publish(
            &ctx.project_id,
            Some(ctx.task_id.as_str()),
            EventKind::TaskStart,
            &ctx.task.title,
            json!({}),
        )
        .await?;

    let system_prompt = build_system_prompt(ctx).await?;
    let tier = ctx.task.model_tier;
    let model = router::model_id(tier, &shared.config);
    let Some(provider) = shared.providers.get(router::provider_id(tier)).cloned() else {
        shared
            .store
            .fail_task(&ctx.task_id, &format!("no provider for tier '{tier}'"))
            .await?;
        shared
            .events
            .publish(
                &ctx.project_id,
                Some(ctx.task_id.as_str()),
                EventKind::TaskFailed,
                format!("{}: no provider for tier '{tier}'", ctx.task.title),
                json!({}),
            )
            .await?;
        return Ok(());
    };

    let outcome = shared
        .runner
        .run(&ctx.task, &model, provider.clone(), system_prompt, &ctx.cancel)
        .await;

    match outcome {
        Ok(result) => handle_success(ctx, provider, result).await,
        Err(AgentError::Cancelled) => handle_cancelled(ctx).await,
        Err(AgentError::Provider(e)) if e.is_transient() => {
            if ctx.task.retry_count < ctx.task.max_retries {
                handle_transient(ctx, &e.to_string()).await
            } else {
                handle_exhausted(ctx, &format!("Max retries exceeded: {e}")).await
            }
        }
        Err(AgentError::Provider(e)) => handle_permanent(ctx, &e.to_string()).await,
        Err(AgentError::Internal(message)) => handle_permanent(ctx, &message).await,
    }
}

/// System prompt: task prompt, stored context entries, then each COMPLETED
/// dependency's output (newest first, truncated to the context budget).
async fn build_system_prompt(ctx: &WorkerCtx) -> Result<String> {
    let mut parts = vec![if ctx.task.system_prompt.is_empty() {
        DEFAULT_SYSTEM_PROMPT.to_string()
    } else {
        ctx.task.system_prompt.clone()
    }];
    for entry in &ctx.task.context {
        parts.push(format!("\n[{}]\n{}", entry.kind, entry.content));
    }

    let max_chars = ctx.shared.config.context_forward_max_chars;
    for (title, output) in ctx.shared.store.dependency_outputs(&ctx.task_id).await? {
        let truncated: String = output.chars().take(max_chars).collect();
        parts.push(format!("\n[dependency_output: {title}]\n{truncated}"));
    }
    Ok(parts.join("\n"))
}

async fn handle_success(
    ctx: &WorkerCtx,
    provider: Arc<dyn Provider>,
    result: AgentOutcome,
) -> Result<()> {
    let shared = &ctx.shared;
    clear_retry(shared, &ctx.task_id);
    shared
        .store
        .complete_task(
            &ctx.task_id,
            &result.output_text,
            result.prompt_tokens,
            result.completion_tokens,
            result.cost_nanos,
            &result.model_used,
        )
        .await?;

    // Optional quality gate; free-tier and partial results skip it.
    if shared.config.verification_enabled && ctx.task.model_tier.is_paid() && !result.partial {
        if verify_completed(ctx, provider, &result).await? {
            return Ok(());
        }
    }

    let mut extras = json!({ "cost_nanos": result.cost_nanos });
    if result.partial {
        extras["partial"] = json!(true);
    }
    let message = if result.partial {
        format!(
            "{} ({} spent, partial result: budget exhausted)",
            ctx.task.title,
            format_usd(result.cost_nanos)
        )
    } else {
        ctx.task.title.clone()
    };
    shared
        .events
        .publish(
            &ctx.project_id,
            Some(ctx.task_id.as_str()),
            EventKind::TaskComplete,
            message,
            extras,
        )
        .await?;
    Ok(())
}

/// Returns true when verification overrode the completed status.
async fn verify_completed(
    ctx: &WorkerCtx,
    provider: Arc<dyn Provider>,
    result: &AgentOutcome,
) -> Result<bool> {
    let shared = &ctx.shared;
    let verdict = verifier::verify_output(
        provider,
        &shared.budget,
        &shared.config,
        &ctx.task,
        &result.output_text,
    )
    .await;

    let (status, notes) = match verdict {
        Ok(v) => v,
        Err(e) => {
            // Verification failure must not block completion.
            tracing::warn!(task_id = %ctx.task_id, error = %e, "verification failed, skipping");
            shared
                .store
                .set_verification(
                    &ctx.task_id,
                    VerificationStatus::Skipped,
                    &format!("verification error: {e}"),
                )
                .await?;
            return Ok(false);
        }
    };

    shared
        .store
        .set_verification(&ctx.task_id, status, &notes)
        .await?;

    match status {
        VerificationStatus::GapsFound if ctx.task.retry_count < ctx.task.max_retries => {
            shared
                .store
                .requeue_with_feedback(
                    &ctx.task_id,
                    &format!("Previous attempt had gaps: {notes}. Address these issues."),
                )
                .await?;
            shared
                .events
                .publish(
                    &ctx.project_id,
                    Some(ctx.task_id.as_str()),
                    EventKind::TaskRetry,
                    format!("{}: gaps found, retrying with feedback", ctx.task.title),
                    json!({ "verification_notes": notes }),
                )
                .await?;
            Ok(true)
        }
        VerificationStatus::HumanNeeded => {
            shared.store.set_needs_review(&ctx.task_id, &notes).await?;
            shared
                .events
                .publish(
                    &ctx.project_id,
                    Some(ctx.task_id.as_str()),
                    EventKind::TaskNeedsReview,
                    format!("{}: requires human review", ctx.task.title),
                    json!({ "verification_notes": notes }),
                )
                .await?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

async fn handle_transient(ctx: &WorkerCtx, error: &str) -> Result<()> {
    let shared = &ctx.shared;
    let attempt = ctx.task.retry_count;
    let backoff = backoff_delay(
        shared.config.retry_backoff_base,
        shared.config.max_backoff,
        attempt,
    );
    let deadline = shared.clock.now()
        + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::seconds(120));

    shared
        .store
        .set_retry_pending(
            &ctx.task_id,
            &format!("Transient error (retry {}): {error}", attempt + 1),
        )
        .await?;
    schedule_retry(shared, &ctx.task_id, deadline);
    shared
        .events
        .publish(
            &ctx.project_id,
            Some(ctx.task_id.as_str()),
            EventKind::TaskRetry,
            format!(
                "{}: retrying in {}s ({error})",
                ctx.task.title,
                backoff.as_secs()
            ),
            json!({ "retry": attempt + 1 }),
        )
        .await?;
    Ok(())
}

async fn handle_exhausted(ctx: &WorkerCtx, error: &str) -> Result<()> {
    let shared = &ctx.shared;
    clear_retry(shared, &ctx.task_id);

    if !shared.config.checkpoint_on_retry_exhausted {
        return handle_permanent(ctx, error).await;
    }

    let checkpoint = Checkpoint {
        id: new_id(),
        project_id: ctx.project_id.clone(),
        task_id: Some(ctx.task_id.clone()),
        checkpoint_type: "retry_exhausted".to_string(),
        summary: format!(
            "Task '{}' failed after {} attempts",
            ctx.task.title, ctx.task.max_retries
        ),
        attempts: shared.store.attempt_history(&ctx.task_id).await?,
        question: "How should we proceed? Options: retry with guidance, skip this task, or fail it."
            .to_string(),
        response: None,
        resolved_at: None,
        created_at: shared.clock.now(),
    };
    shared.store.insert_checkpoint(&checkpoint).await?;
    shared.store.set_needs_review(&ctx.task_id, error).await?;

    shared
        .events
        .publish(
            &ctx.project_id,
            Some(ctx.task_id.as_str()),
            EventKind::TaskNeedsReview,
            format!("{}: {error}", ctx.task.title),
            json!({ "checkpoint_id": checkpoint.id }),
        )
        .await?;
    shared
        .events
        .publish(
            &ctx.project_id,
            Some(ctx.task_id.as_str()),
            EventKind::Checkpoint,
            format!(
                "Checkpoint: {} needs attention after {} failed attempts",
                ctx.task.title, ctx.task.max_retries
            ),
            json!({ "checkpoint_id": checkpoint.id }),
        )
        .await?;
    Ok(())
}

async fn handle_permanent(ctx: &WorkerCtx, error: &str) -> Result<()> {
    let shared = &ctx.shared;
    clear_retry(shared, &ctx.task_id);
    shared.store.fail_task(&ctx.task_id, error).await?;
    shared
        .events
        .publish(
            &ctx.project_id,
            Some(ctx.task_id.as_str()),
            EventKind::TaskFailed,
            format!("{}: {error}", ctx.task.title),
            json!({}),
        )
        .await?;
    Ok(())
}

async fn handle_cancelled(ctx: &WorkerCtx) -> Result<()> {
    let shared = &ctx.shared;
    clear_retry(shared, &ctx.task_id);
    if shared.store.cancel_task_if_active(&ctx.task_id).await? {
        shared
            .events
            .publish(
                &ctx.project_id,
                Some(ctx.task_id.as_str()),
                EventKind::TaskFailed,
                format!("{}: cancelled", ctx.task.title),
                json!({ "reason": "cancelled" }),
            )
            .await?;
    }
    Ok(())
}

/// Exponential backoff with jitter: `base * 2^attempt + U(0, 2s)`, capped.
fn backoff_delay(
    base: std::time::Duration,
    max: std::time::Duration,
    attempt: u32,
) -> std::time::Duration {
    let exp = base.as_secs_f64() * 2f64.powi(attempt.min(16) as i32);
    let jitter = rand::thread_rng().gen_range(0.0..2.0);
    std::time::Duration::from_secs_f64((exp + jitter).min(max.as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(120);
        let first = backoff_delay(base, max, 0);
        assert!(first >= Duration::from_secs(5) && first < Duration::from_secs(8));

        let third = backoff_delay(base, max, 2);
        assert!(third >= Duration::from_secs(20) && third < Duration::from_secs(23));

        let huge = backoff_delay(base, max, 12);
        assert_eq!(huge, max);
    }
}
