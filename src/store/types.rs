//! Entities and status enumerations.
//!
//! Rows are identified by opaque 12-character hex ids; relationships are id
//! references only (the dependency graph is an adjacency list keyed by task
//! id, never owning back-pointers).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mint a short opaque row id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Project lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Draft,
    Planning,
    /// Plan approved, awaiting execution.
    Ready,
    Executing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Planning => "planning",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "draft" => Self::Draft,
            "planning" => Self::Planning,
            "ready" => Self::Ready,
            "executing" => Self::Executing,
            "paused" => Self::Paused,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Plan lifecycle. At most one APPROVED plan per project at a time; a plan is
/// immutable once it leaves DRAFT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Approved,
    Superseded,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Approved => "approved",
            Self::Superseded => "superseded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "draft" => Self::Draft,
            "approved" => Self::Approved,
            "superseded" => Self::Superseded,
            _ => return None,
        })
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    /// At least one dependency is not COMPLETED.
    Blocked,
    /// Claimed for dispatch, waiting for a worker.
    Queued,
    Running,
    Completed,
    /// Output requires human adjudication (checkpoint open).
    NeedsReview,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::NeedsReview => "needs_review",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "blocked" => Self::Blocked,
            "queued" => Self::Queued,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "needs_review" => Self::NeedsReview,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of work a task is; drives model routing and tool defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Code,
    Research,
    Analysis,
    Asset,
    Integration,
    Documentation,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Research => "research",
            Self::Analysis => "analysis",
            Self::Asset => "asset",
            Self::Integration => "integration",
            Self::Documentation => "documentation",
        }
    }

    /// Parse with a `code` fallback for unrecognized values.
    pub fn parse_lossy(s: &str) -> Self {
        match s {
            "research" => Self::Research,
            "analysis" => Self::Analysis,
            "asset" => Self::Asset,
            "integration" => Self::Integration,
            "documentation" => Self::Documentation,
            _ => Self::Code,
        }
    }
}

/// Declared task complexity from the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl Complexity {
    pub fn parse_lossy(s: &str) -> Self {
        match s {
            "simple" => Self::Simple,
            "complex" => Self::Complex,
            _ => Self::Medium,
        }
    }
}

/// Routing tier a task executes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Haiku,
    Sonnet,
    Opus,
    /// Free local inference.
    Local,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Haiku => "haiku",
            Self::Sonnet => "sonnet",
            Self::Opus => "opus",
            Self::Local => "local",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "haiku" => Self::Haiku,
            "sonnet" => Self::Sonnet,
            "opus" => Self::Opus,
            "local" => Self::Local,
            _ => return None,
        })
    }

    /// Whether usage on this tier is billed.
    pub fn is_paid(&self) -> bool {
        !matches!(self, Self::Local)
    }
}

impl std::fmt::Display for ModelTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of optional output verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Passed,
    GapsFound,
    HumanNeeded,
    Skipped,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "passed",
            Self::GapsFound => "gaps_found",
            Self::HumanNeeded => "human_needed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "passed" => Self::Passed,
            "gaps_found" => Self::GapsFound,
            "human_needed" => Self::HumanNeeded,
            "skipped" => Self::Skipped,
            _ => return None,
        })
    }
}

/// Progress event kinds broadcast on the bus and persisted in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskStart,
    TaskComplete,
    TaskFailed,
    TaskRetry,
    TaskNeedsReview,
    ToolCall,
    BudgetWarning,
    ProjectComplete,
    ProjectFailed,
    Checkpoint,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskStart => "task_start",
            Self::TaskComplete => "task_complete",
            Self::TaskFailed => "task_failed",
            Self::TaskRetry => "task_retry",
            Self::TaskNeedsReview => "task_needs_review",
            Self::ToolCall => "tool_call",
            Self::BudgetWarning => "budget_warning",
            Self::ProjectComplete => "project_complete",
            Self::ProjectFailed => "project_failed",
            Self::Checkpoint => "checkpoint",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "task_start" => Self::TaskStart,
            "task_complete" => Self::TaskComplete,
            "task_failed" => Self::TaskFailed,
            "task_retry" => Self::TaskRetry,
            "task_needs_review" => Self::TaskNeedsReview,
            "tool_call" => Self::ToolCall,
            "budget_warning" => Self::BudgetWarning,
            "project_complete" => Self::ProjectComplete,
            "project_failed" => Self::ProjectFailed,
            "checkpoint" => Self::Checkpoint,
            _ => return None,
        })
    }

    /// Terminal project events end live subscriptions.
    pub fn is_project_terminal(&self) -> bool {
        matches!(self, Self::ProjectComplete | Self::ProjectFailed)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of task context injected into the system prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
}

impl ContextEntry {
    pub fn new(kind: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
        }
    }
}

/// Top-level container for one orchestration run.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub requirements: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One decomposition attempt. Immutable once approved or superseded.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: String,
    pub project_id: String,
    pub version: i64,
    pub model_used: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_nanos: u64,
    pub payload: Value,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
}

/// Unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub plan_id: String,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub priority: i64,
    pub status: TaskStatus,
    pub model_tier: ModelTier,
    pub model_used: Option<String>,
    pub context: Vec<ContextEntry>,
    pub tools: Vec<String>,
    pub system_prompt: String,
    pub output_text: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_nanos: u64,
    pub max_tokens: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Longest dependency chain depth; tasks of the same wave are mutually
    /// independent.
    pub wave: i64,
    pub verification_status: Option<VerificationStatus>,
    pub verification_notes: Option<String>,
    pub error: Option<String>,
    /// Ids of the tasks this task depends on.
    pub depends_on: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One billable API call. Append-only.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub id: i64,
    pub project_id: Option<String>,
    pub task_id: Option<String>,
    pub provider: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_nanos: u64,
    pub purpose: String,
    pub timestamp: DateTime<Utc>,
}

/// Daily or monthly spend aggregate, upserted per recorded call.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetPeriod {
    pub period_key: String,
    pub period_type: String,
    pub cost_nanos: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub api_call_count: u64,
}

/// A progress event row; also broadcast live.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub project_id: String,
    pub task_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub message: String,
    #[serde(flatten)]
    pub extras: Value,
    pub timestamp: DateTime<Utc>,
}

/// Request for human adjudication of a retry-exhausted task.
#[derive(Debug, Clone, Serialize)]
pub struct Checkpoint {
    pub id: String,
    pub project_id: String,
    pub task_id: Option<String>,
    pub checkpoint_type: String,
    pub summary: String,
    pub attempts: Value,
    pub question: String,
    pub response: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate usage statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageSummary {
    pub total_cost_nanos: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub api_call_count: u64,
    pub by_model: std::collections::BTreeMap<String, ModelUsage>,
    pub by_provider: std::collections::BTreeMap<String, ProviderUsage>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModelUsage {
    pub cost_nanos: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub calls: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderUsage {
    pub cost_nanos: u64,
    pub calls: u64,
}
