//! Wave-based task executor.
//!
//! A single long-lived driver ticks at a fixed interval. Each tick scans
//! active projects, recomputes blocked status, runs liveness and terminal
//! checks, then selects ready tasks: dependencies complete, not already
//! dispatched, past any retry deadline, required resources online. Selected
//! tasks are claimed atomically in the store, reserve their estimated cost,
//! and launch an independent worker.
//!
//! The in-memory dispatch sets (`dispatched`, `inflight`, `retry_deadline`)
//! are authoritative for run-time decisions but never outlive the process;
//! restart recovery rebuilds from database state.

mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentRunner;
use crate::budget::BudgetManager;
use crate::clock::Clock;
use crate::config::Config;
use crate::error::Result;
use crate::events::EventBus;
use crate::provider::Provider;
use crate::resources::ResourceMonitor;
use crate::router;
use crate::store::{EventKind, Project, ProjectStatus, Store, Task, TaskStatus};
use crate::tools::ToolRegistry;

pub(crate) struct InflightWorker {
    project_id: String,
    token: CancellationToken,
    /// Attached right after spawn; absent for the brief window in between.
    handle: Option<tokio::task::JoinHandle<()>>,
}

#[derive(Default)]
pub(crate) struct DispatchState {
    /// Claimed-but-not-yet-finished task ids; prevents re-selection of a
    /// QUEUED task whose worker has not reached RUNNING yet.
    dispatched: HashSet<String>,
    inflight: HashMap<String, InflightWorker>,
    /// Earliest re-dispatch time per task, set by retry backoff.
    retry_deadline: HashMap<String, DateTime<Utc>>,
    /// Daily period keys a budget_warning was already published for.
    budget_warned: HashSet<String>,
}

pub(crate) struct ExecutorShared {
    pub store: Arc<Store>,
    pub budget: Arc<BudgetManager>,
    pub events: Arc<EventBus>,
    pub resources: Arc<ResourceMonitor>,
    pub registry: Arc<ToolRegistry>,
    pub runner: AgentRunner,
    pub providers: HashMap<String, Arc<dyn Provider>>,
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub semaphore: Arc<Semaphore>,
    pub state: StdMutex<DispatchState>,
    pub shutdown: CancellationToken,
}

/// Drives every approved project from READY to a terminal state while
/// honoring concurrency, budget, dependencies, resource availability, and
/// cancellation.
pub struct Executor {
    shared: Arc<ExecutorShared>,
    loop_handle: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        budget: Arc<BudgetManager>,
        events: Arc<EventBus>,
        resources: Arc<ResourceMonitor>,
        registry: Arc<ToolRegistry>,
        providers: HashMap<String, Arc<dyn Provider>>,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let runner = AgentRunner::new(
            registry.clone(),
            budget.clone(),
            events.clone(),
            config.clone(),
        );
        let shared = Arc::new(ExecutorShared {
            store,
            budget,
            events,
            resources,
            registry,
            runner,
            providers,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            config,
            clock,
            state: StdMutex::new(DispatchState::default()),
            shutdown: CancellationToken::new(),
        });
        Self {
            shared,
            loop_handle: tokio::sync::Mutex::new(None),
        }
    }

    /// Start the tick loop.
    pub async fn start(&self) {
        let mut handle = self.loop_handle.lock().await;
        if handle.is_some() {
            return;
        }
        let shared = self.shared.clone();
        *handle = Some(tokio::spawn(async move {
            tracing::info!("executor started");
            loop {
                if let Err(e) = tick_once(&shared).await {
                    tracing::error!(error = %e, "tick error");
                }
                tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(shared.config.tick_interval) => {}
                }
            }
        }));
    }

    /// Stop the tick loop, signal every in-flight worker, wait a bounded
    /// grace period, and force-drop stragglers. Database state stays
    /// consistent: unfinished workers transition their tasks on the way out.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }

        let handles: Vec<tokio::task::JoinHandle<()>> = {
            let mut state = self.shared.state.lock().unwrap();
            state
                .inflight
                .drain()
                .filter_map(|(_, worker)| {
                    worker.token.cancel();
                    worker.handle
                })
                .collect()
        };
        if handles.is_empty() {
            tracing::info!("executor stopped");
            return;
        }
        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(self.shared.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            tracing::warn!("workers did not drain within the grace period");
        }
        tracing::info!("executor stopped");
    }

    /// One scheduling pass. Public so callers (and tests) can drive the
    /// executor deterministically instead of waiting for the interval.
    pub async fn tick(&self) -> Result<()> {
        tick_once(&self.shared).await
    }

    /// Signal every in-flight worker belonging to a project. Workers release
    /// their reservation, transition the task to CANCELLED, and exit.
    pub fn cancel_project_workers(&self, project_id: &str) {
        let state = self.shared.state.lock().unwrap();
        for worker in state.inflight.values() {
            if worker.project_id == project_id {
                worker.token.cancel();
            }
        }
    }

    /// Number of workers currently in flight.
    pub fn inflight_count(&self) -> usize {
        self.shared.state.lock().unwrap().inflight.len()
    }
}

async fn tick_once(shared: &Arc<ExecutorShared>) -> Result<()> {
    let projects = shared
        .store
        .projects_in_statuses(&[
            ProjectStatus::Ready,
            ProjectStatus::Executing,
            ProjectStatus::Paused,
        ])
        .await?;

    for project in projects {
        // PAUSED projects keep their running workers but are not scanned.
        // READY projects get liveness and terminal checks; dispatch waits
        // for an explicit start.
        if project.status == ProjectStatus::Paused {
            continue;
        }
        if let Err(e) = tick_project(shared, &project).await {
            tracing::error!(project_id = %project.id, error = %e, "project tick error");
        }
    }
    Ok(())
}

async fn tick_project(shared: &Arc<ExecutorShared>, project: &Project) -> Result<()> {
    let pid = &project.id;

    // Recompute derived BLOCKED status in both directions.
    shared.store.mark_blocked_tasks(pid).await?;
    shared.store.unblock_ready_tasks(pid).await?;

    let counts = shared.store.task_status_counts(pid).await?;
    let count = |status: TaskStatus| counts.get(&status).copied().unwrap_or(0);
    let active = count(TaskStatus::Pending) + count(TaskStatus::Queued) + count(TaskStatus::Running);
    let blocked = count(TaskStatus::Blocked);
    let needs_review = count(TaskStatus::NeedsReview);
    let total: i64 = counts.values().sum();

    // Dead project: nothing runnable, nothing awaiting a human, at least one
    // task permanently blocked.
    if total > 0 && active == 0 && needs_review == 0 && blocked > 0 {
        shared
            .store
            .set_project_status(pid, ProjectStatus::Failed)
            .await?;
        shared
            .events
            .publish(
                pid,
                None,
                EventKind::ProjectFailed,
                format!("unsatisfiable dependencies: {blocked} task(s) permanently blocked"),
                json!({ "blocked": blocked }),
            )
            .await?;
        return Ok(());
    }

    // Terminal: every task reached a terminal state.
    if total > 0 && active == 0 && blocked == 0 && needs_review == 0 {
        let failed = count(TaskStatus::Failed);
        if failed > 0 {
            shared
                .store
                .set_project_status(pid, ProjectStatus::Failed)
                .await?;
            shared
                .events
                .publish(
                    pid,
                    None,
                    EventKind::ProjectFailed,
                    format!("project finished with {failed} failed task(s)"),
                    json!({ "failed": failed }),
                )
                .await?;
        } else {
            shared
                .store
                .set_project_status(pid, ProjectStatus::Completed)
                .await?;
            shared
                .events
                .publish(
                    pid,
                    None,
                    EventKind::ProjectComplete,
                    "All tasks finished.",
                    json!({}),
                )
                .await?;
        }
        return Ok(());
    }

    // Selection only runs for EXECUTING projects; a READY project's tasks
    // stay put until start_project.
    if project.status != ProjectStatus::Executing {
        return Ok(());
    }

    // Selection, bounded by remaining concurrency.
    let ready = shared.store.ready_tasks(pid).await?;
    let now = shared.clock.now();
    let mut slots = shared.semaphore.available_permits();

    for task in ready {
        if slots == 0 {
            break;
        }

        {
            let mut state = shared.state.lock().unwrap();
            if state.dispatched.contains(&task.id) {
                continue;
            }
            match state.retry_deadline.get(&task.id) {
                Some(deadline) if *deadline > now => continue,
                Some(_) => {
                    state.retry_deadline.remove(&task.id);
                }
                None => {}
            }
        }

        if !resources_available(shared, &task) {
            continue;
        }

        let est_cost = router::estimate_task_cost(task.model_tier, task.max_tokens, &shared.config);
        if !shared.budget.reserve(est_cost, pid).await? {
            let period_key = shared.budget.daily_key();
            let first_warning = shared
                .state
                .lock()
                .unwrap()
                .budget_warned
                .insert(period_key);
            if first_warning {
                shared
                    .events
                    .publish(
                        pid,
                        None,
                        EventKind::BudgetWarning,
                        "Budget limit reached. Scheduling paused until spend clears.",
                        json!({}),
                    )
                    .await?;
            }
            // Stop scheduling this project for the rest of the tick.
            break;
        }

        // Atomic claim: only the transition PENDING → QUEUED dispatches.
        if !shared.store.claim_for_dispatch(&task.id).await? {
            shared.budget.release(est_cost, pid).await;
            continue;
        }

        // Register the dispatch before spawning so a fast worker's cleanup
        // always finds its own entries.
        let token = shared.shutdown.child_token();
        {
            let mut state = shared.state.lock().unwrap();
            state.dispatched.insert(task.id.clone());
            state.inflight.insert(
                task.id.clone(),
                InflightWorker {
                    project_id: pid.clone(),
                    token: token.clone(),
                    handle: None,
                },
            );
        }
        let ctx = worker::WorkerCtx {
            shared: shared.clone(),
            task_id: task.id.clone(),
            project_id: pid.clone(),
            task,
            est_cost,
            cancel: token,
        };
        let task_id = ctx.task_id.clone();
        let handle = tokio::spawn(worker::run(ctx));
        {
            let mut state = shared.state.lock().unwrap();
            if let Some(worker) = state.inflight.get_mut(&task_id) {
                worker.handle = Some(handle);
            }
        }
        slots -= 1;
    }

    Ok(())
}

/// Verify the model tier's provider and every tool-required resource are
/// online. An offline resource skips the task this tick; it returns to the
/// pool on the next one.
fn resources_available(shared: &ExecutorShared, task: &Task) -> bool {
    if !shared.resources.is_available(router::resource_id(task.model_tier)) {
        return false;
    }
    for name in &task.tools {
        if let Some(tool) = shared.registry.get(name) {
            if let Some(resource) = tool.required_resource() {
                if !shared.resources.is_available(resource) {
                    return false;
                }
            }
        }
    }
    true
}

pub(crate) fn schedule_retry(shared: &ExecutorShared, task_id: &str, deadline: DateTime<Utc>) {
    shared
        .state
        .lock()
        .unwrap()
        .retry_deadline
        .insert(task_id.to_string(), deadline);
}

pub(crate) fn clear_retry(shared: &ExecutorShared, task_id: &str) {
    shared.state.lock().unwrap().retry_deadline.remove(task_id);
}
