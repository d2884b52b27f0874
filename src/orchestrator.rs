//! Composition root and operation surface.
//!
//! Constructs each component once at startup and hands callers a single
//! handle exposing the inbound operations: project CRUD, planning, plan
//! approval, execution control, task access, checkpoint resolution, event
//! subscription, and budget status. Outer layers (HTTP, CLI) translate these
//! calls into their own surface; there are no hidden globals and no
//! import-time side effects beyond reading configuration.

use std::collections::HashMap;
use std::sync::Arc;

use crate::budget::{BudgetManager, BudgetStatus};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::decomposer::{self, DecompositionSummary};
use crate::error::{OrchestrationError, Result};
use crate::events::{EventBus, Subscription};
use crate::executor::Executor;
use crate::planner;
use crate::provider::{AnthropicProvider, OllamaProvider, Provider};
use crate::resources::ResourceMonitor;
use crate::store::{
    Checkpoint, EventRecord, ModelTier, Plan, Project, ProjectStatus, Store, Task, TaskStatus,
    UsageSummary,
};
use crate::tools::{LocalLlmTool, ReadFileTool, ToolRegistry, WriteFileTool};

/// Pre-execution edits to a task.
#[derive(Debug, Default, Clone)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub model_tier: Option<ModelTier>,
    pub priority: Option<i64>,
    pub max_retries: Option<u32>,
}

impl TaskUpdate {
    fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.model_tier.is_none()
            && self.priority.is_none()
            && self.max_retries.is_none()
    }
}

/// How a checkpoint is resolved.
#[derive(Debug, Clone)]
pub enum CheckpointAction {
    /// Reset the task for a fresh run, optionally with guidance appended to
    /// its context.
    Retry { guidance: Option<String> },
    /// Cancel the task so the project can continue without it.
    Skip,
    /// Mark the task failed.
    Fail,
}

/// The assembled orchestration core.
pub struct Orchestrator {
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<Store>,
    pub budget: Arc<BudgetManager>,
    pub events: Arc<EventBus>,
    pub resources: Arc<ResourceMonitor>,
    pub registry: Arc<ToolRegistry>,
    pub executor: Executor,
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl Orchestrator {
    /// Production wiring: system clock, on-disk store, HTTP providers,
    /// default tool set.
    pub async fn new(config: Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(Store::open(&config.db_path(), clock.clone()).await?);

        let anthropic: Arc<dyn Provider> = Arc::new(AnthropicProvider::new(
            config.api_base_url.clone(),
            config.api_key.clone(),
        ));
        let ollama: Arc<dyn Provider> = Arc::new(OllamaProvider::new(
            config.ollama_host.clone(),
            config.ollama_embed_model.clone(),
            config.ollama_embed_timeout,
        ));
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        providers.insert("anthropic".to_string(), anthropic);
        providers.insert("ollama".to_string(), ollama.clone());

        let registry = Arc::new(default_registry(&config, ollama));
        Ok(Self::assemble(config, clock, store, providers, registry))
    }

    /// Custom wiring for embedders and tests: caller supplies the clock,
    /// store, providers, and tools.
    pub fn with_parts(
        config: Config,
        clock: Arc<dyn Clock>,
        store: Arc<Store>,
        providers: HashMap<String, Arc<dyn Provider>>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        Self::assemble(config, clock, store, providers, registry)
    }

    fn assemble(
        config: Config,
        clock: Arc<dyn Clock>,
        store: Arc<Store>,
        providers: HashMap<String, Arc<dyn Provider>>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        let config = Arc::new(config);
        let budget = Arc::new(BudgetManager::new(
            store.clone(),
            clock.clone(),
            config.budget.clone(),
        ));
        let events = Arc::new(EventBus::new(
            store.clone(),
            config.event_queue_capacity,
            config.max_subscribers_per_project,
        ));
        let resources = Arc::new(ResourceMonitor::from_config(&config));
        let executor = Executor::new(
            store.clone(),
            budget.clone(),
            events.clone(),
            resources.clone(),
            registry.clone(),
            providers.clone(),
            config.clone(),
            clock.clone(),
        );
        Self {
            config,
            clock,
            store,
            budget,
            events,
            resources,
            registry,
            executor,
            providers,
        }
    }

    /// Start background loops (resource probes, executor ticks).
    pub async fn start(&self) {
        self.resources.start().await;
        self.executor.start().await;
    }

    /// Stop background loops and drain in-flight workers.
    pub async fn shutdown(&self) {
        self.executor.stop().await;
        self.resources.stop().await;
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    pub async fn create_project(&self, name: &str, requirements: &str) -> Result<Project> {
        if name.trim().is_empty() {
            return Err(OrchestrationError::Validation("name is required".into()));
        }
        if requirements.trim().is_empty() {
            return Err(OrchestrationError::Validation(
                "requirements are required".into(),
            ));
        }
        self.store.create_project(name.trim(), requirements).await
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Project> {
        self.store
            .get_project(project_id)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound(format!("project {project_id}")))
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        self.store.list_projects().await
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    /// Generate a plan from the project's requirements via the planning
    /// model. The new plan version lands in DRAFT awaiting approval.
    pub async fn request_plan(&self, project_id: &str) -> Result<Plan> {
        let provider = self
            .providers
            .get("anthropic")
            .cloned()
            .ok_or_else(|| OrchestrationError::Internal("no planning provider wired".into()))?;
        planner::generate_plan(
            &self.store,
            &self.budget,
            provider,
            &self.clock,
            &self.config,
            project_id,
        )
        .await
    }

    pub async fn list_plans(&self, project_id: &str) -> Result<Vec<Plan>> {
        self.get_project(project_id).await?;
        self.store.plans_for_project(project_id).await
    }

    /// Approve a draft plan and decompose it into executable tasks.
    pub async fn approve_plan(
        &self,
        project_id: &str,
        plan_id: &str,
    ) -> Result<DecompositionSummary> {
        self.get_project(project_id).await?;
        decomposer::decompose_plan(&self.store, &self.clock, &self.config, project_id, plan_id)
            .await
    }

    // ------------------------------------------------------------------
    // Execution control
    // ------------------------------------------------------------------

    /// Start executing approved tasks. The executor picks them up on its
    /// next tick.
    pub async fn start_project(&self, project_id: &str) -> Result<Project> {
        let project = self.get_project(project_id).await?;
        if !matches!(
            project.status,
            ProjectStatus::Ready | ProjectStatus::Paused
        ) {
            return Err(OrchestrationError::Conflict(format!(
                "project must be 'ready' or 'paused' to start, got '{}'",
                project.status
            )));
        }
        self.store
            .set_project_status(project_id, ProjectStatus::Executing)
            .await?;
        self.get_project(project_id).await
    }

    /// Pause execution: no new tasks start; in-flight workers continue.
    pub async fn pause_project(&self, project_id: &str) -> Result<Project> {
        let project = self.get_project(project_id).await?;
        if project.status != ProjectStatus::Executing {
            return Err(OrchestrationError::Conflict(format!(
                "project is not executing (status '{}')",
                project.status
            )));
        }
        self.store
            .set_project_status(project_id, ProjectStatus::Paused)
            .await?;
        self.get_project(project_id).await
    }

    /// Cancel the project: unstarted tasks are cancelled immediately and
    /// every in-flight worker is signalled. Workers roll back their
    /// reservations and transition their tasks to CANCELLED on exit.
    pub async fn cancel_project(&self, project_id: &str) -> Result<Project> {
        let project = self.get_project(project_id).await?;
        if project.status.is_terminal() {
            return Err(OrchestrationError::Conflict(format!(
                "project already finished (status '{}')",
                project.status
            )));
        }
        self.store.cancel_unstarted_tasks(project_id).await?;
        self.executor.cancel_project_workers(project_id);
        self.store
            .set_project_status(project_id, ProjectStatus::Cancelled)
            .await?;
        self.get_project(project_id).await
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    pub async fn list_tasks(
        &self,
        project_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>> {
        self.get_project(project_id).await?;
        self.store.list_tasks(project_id, status).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| OrchestrationError::NotFound(format!("task {task_id}")))
    }

    /// Edit a task before execution.
    pub async fn update_task(&self, task_id: &str, update: TaskUpdate) -> Result<Task> {
        let task = self.get_task(task_id).await?;
        if matches!(task.status, TaskStatus::Running | TaskStatus::Completed) {
            return Err(OrchestrationError::Conflict(
                "cannot edit a running or completed task".into(),
            ));
        }
        if update.is_empty() {
            return Err(OrchestrationError::Validation("no fields to update".into()));
        }
        self.store
            .update_task_fields(
                task_id,
                update.title.as_deref(),
                update.description.as_deref(),
                update.model_tier,
                update.priority,
                update.max_retries,
            )
            .await?;
        self.get_task(task_id).await
    }

    /// Reset a failed, reviewed, or cancelled task for a fresh run.
    pub async fn retry_task(&self, task_id: &str) -> Result<Task> {
        let task = self.get_task(task_id).await?;
        if !matches!(
            task.status,
            TaskStatus::Failed | TaskStatus::NeedsReview | TaskStatus::Cancelled
        ) {
            return Err(OrchestrationError::Conflict(format!(
                "task in status '{}' cannot be retried",
                task.status
            )));
        }
        self.store.reset_task_fresh(task_id, None).await?;
        self.get_task(task_id).await
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    pub async fn list_checkpoints(
        &self,
        project_id: &str,
        include_resolved: bool,
    ) -> Result<Vec<Checkpoint>> {
        self.get_project(project_id).await?;
        self.store.list_checkpoints(project_id, include_resolved).await
    }

    /// Resolve a checkpoint with a user action. `Retry` resets the task for
    /// a fresh agent call with the guidance appended to its context.
    pub async fn resolve_checkpoint(
        &self,
        checkpoint_id: &str,
        action: CheckpointAction,
    ) -> Result<Checkpoint> {
        let checkpoint = self
            .store
            .get_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(|| {
                OrchestrationError::NotFound(format!("checkpoint {checkpoint_id}"))
            })?;
        if checkpoint.resolved_at.is_some() {
            return Err(OrchestrationError::Conflict(
                "checkpoint already resolved".into(),
            ));
        }

        let response = match &action {
            CheckpointAction::Retry { guidance } => match guidance {
                Some(guidance) => format!("Action: retry | Guidance: {guidance}"),
                None => "Action: retry".to_string(),
            },
            CheckpointAction::Skip => "Action: skip".to_string(),
            CheckpointAction::Fail => "Action: fail".to_string(),
        };

        if let Some(task_id) = &checkpoint.task_id {
            match &action {
                CheckpointAction::Retry { guidance } => {
                    self.store
                        .reset_task_fresh(task_id, guidance.as_deref())
                        .await?;
                }
                CheckpointAction::Skip => {
                    self.store.cancel_task_if_active(task_id).await?;
                }
                CheckpointAction::Fail => {
                    self.store
                        .fail_task(task_id, "failed by checkpoint resolution")
                        .await?;
                }
            }
        }

        self.store
            .mark_checkpoint_resolved(checkpoint_id, &response)
            .await?;
        self.store
            .get_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(|| OrchestrationError::Internal("checkpoint vanished".into()))
    }

    // ------------------------------------------------------------------
    // Events + budget
    // ------------------------------------------------------------------

    /// Live event stream for a project.
    pub async fn subscribe_events(&self, project_id: &str) -> Result<Subscription> {
        self.get_project(project_id).await?;
        self.events.subscribe(project_id)
    }

    /// Persisted events (production order).
    pub async fn recent_events(
        &self,
        project_id: &str,
        task_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EventRecord>> {
        self.get_project(project_id).await?;
        self.store.recent_events(project_id, task_id, limit).await
    }

    pub async fn budget_status(&self) -> Result<BudgetStatus> {
        self.budget.status().await
    }

    pub async fn usage_summary(&self, project_id: Option<&str>) -> Result<UsageSummary> {
        self.budget.usage_summary(project_id).await
    }
}

/// Default tool set: sandboxed file access plus local-model delegation.
pub fn default_registry(config: &Config, ollama: Arc<dyn Provider>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    let sandbox = config.sandbox_base();
    registry.register(Arc::new(ReadFileTool::new(sandbox.clone())));
    registry.register(Arc::new(WriteFileTool::new(sandbox)));
    registry.register(Arc::new(LocalLlmTool::new(
        ollama,
        config.models.local.clone(),
        config.ollama_generate_timeout,
    )));
    registry
}
