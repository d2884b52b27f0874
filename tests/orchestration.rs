//! End-to-end scheduling scenarios against a scripted provider.
//!
//! Ticks are driven manually (no interval sleeps) and time is a manual
//! clock, so every scenario is deterministic up to worker interleaving.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use taskwave::budget::{BudgetManager, SpendRecord};
use taskwave::clock::{Clock, ManualClock};
use taskwave::config::Config;
use taskwave::orchestrator::{CheckpointAction, Orchestrator};
use taskwave::pricing::nanos_from_usd;
use taskwave::provider::{
    ContentBlock, GenerateRequest, GenerateResponse, Provider, ProviderError,
};
use taskwave::store::{new_id, EventKind, Plan, PlanStatus, Store, TaskStatus};
use taskwave::tools::ToolRegistry;
use taskwave::{OrchestrationError, ProjectStatus};

// ---------------------------------------------------------------------------
// Scripted provider
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum MockReply {
    /// Return this text with the given token usage.
    Text {
        text: String,
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Fail with a transient 503.
    Transient,
    /// Never respond (until the caller is cancelled).
    Hang,
    /// Wait for a gate permit, then return this text.
    Gated {
        text: String,
        input_tokens: u64,
        output_tokens: u64,
    },
    /// Wait for a gate permit, then return text plus a tool invocation,
    /// which keeps the tool loop going unless something stops it early.
    GatedToolUse {
        input_tokens: u64,
        output_tokens: u64,
    },
}

fn reply_text(text: &str, input_tokens: u64, output_tokens: u64) -> MockReply {
    MockReply::Text {
        text: text.to_string(),
        input_tokens,
        output_tokens,
    }
}

/// Provider that matches the task description against registered markers and
/// replays the scripted replies in order, repeating the last one.
struct MockProvider {
    id: String,
    scripts: Mutex<HashMap<String, (usize, Vec<MockReply>)>>,
    default: MockReply,
    gate: tokio::sync::Semaphore,
}

impl MockProvider {
    fn new(id: &str, default: MockReply) -> Self {
        Self {
            id: id.to_string(),
            scripts: Mutex::new(HashMap::new()),
            default,
            gate: tokio::sync::Semaphore::new(0),
        }
    }

    /// Let `n` gated replies through.
    fn open_gate(&self, n: usize) {
        self.gate.add_permits(n);
    }

    fn script(&self, marker: &str, replies: Vec<MockReply>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(marker.to_string(), (0, replies));
    }

    fn next_reply(&self, description: &str) -> MockReply {
        let mut scripts = self.scripts.lock().unwrap();
        for (marker, (cursor, replies)) in scripts.iter_mut() {
            if description.contains(marker.as_str()) {
                let reply = replies[(*cursor).min(replies.len() - 1)].clone();
                *cursor += 1;
                return reply;
            }
        }
        self.default.clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(
        &self,
        request: GenerateRequest,
    ) -> Result<GenerateResponse, ProviderError> {
        let description = request
            .messages
            .first()
            .and_then(|m| {
                m.content.iter().find_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.clone()),
                    _ => None,
                })
            })
            .unwrap_or_default();

        match self.next_reply(&description) {
            MockReply::Text {
                text,
                input_tokens,
                output_tokens,
            } => Ok(GenerateResponse {
                content: vec![ContentBlock::text(text)],
                input_tokens,
                output_tokens,
                stop_reason: Some("end_turn".to_string()),
                model: request.model,
            }),
            MockReply::Transient => Err(ProviderError::server_error(503, "mock overload")),
            MockReply::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
            MockReply::Gated {
                text,
                input_tokens,
                output_tokens,
            } => {
                self.gate.acquire().await.expect("gate closed").forget();
                Ok(GenerateResponse {
                    content: vec![ContentBlock::text(text)],
                    input_tokens,
                    output_tokens,
                    stop_reason: Some("end_turn".to_string()),
                    model: request.model,
                })
            }
            MockReply::GatedToolUse {
                input_tokens,
                output_tokens,
            } => {
                self.gate.acquire().await.expect("gate closed").forget();
                Ok(GenerateResponse {
                    content: vec![
                        ContentBlock::text("working"),
                        ContentBlock::ToolUse {
                            id: "tu_1".to_string(),
                            name: "scratch".to_string(),
                            input: json!({}),
                        },
                    ],
                    input_tokens,
                    output_tokens,
                    stop_reason: Some("tool_use".to_string()),
                    model: request.model,
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    orchestrator: Orchestrator,
    clock: Arc<ManualClock>,
    anthropic: Arc<MockProvider>,
}

fn base_config() -> Config {
    let mut config = Config::default();
    config.api_key = "sk-test".to_string();
    config.max_task_retries = 3;
    config
}

async fn harness(config: Config) -> Harness {
    let clock = Arc::new(ManualClock::new(
        "2026-06-01T08:00:00Z".parse::<DateTime<Utc>>().unwrap(),
    ));
    let store = Arc::new(
        Store::open_in_memory(clock.clone() as Arc<dyn Clock>)
            .await
            .unwrap(),
    );

    let anthropic = Arc::new(MockProvider::new("anthropic", reply_text("5", 10, 1)));
    let ollama = Arc::new(MockProvider::new("ollama", reply_text("local ok", 5, 2)));
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
    providers.insert("anthropic".to_string(), anthropic.clone());
    providers.insert("ollama".to_string(), ollama);

    let orchestrator = Orchestrator::with_parts(
        config,
        clock.clone(),
        store,
        providers,
        Arc::new(ToolRegistry::new()),
    );
    // One probe pass: the API key is configured, local inference is offline.
    orchestrator.resources.check_all().await;

    Harness {
        orchestrator,
        clock,
        anthropic,
    }
}

fn task_def(title: &str, description: &str, deps: Value) -> Value {
    json!({
        "title": title,
        "description": description,
        "task_type": "research",
        "complexity": "medium",
        "depends_on": deps,
        "tools_needed": []
    })
}

/// Seed an approved plan (project ends up READY); returns the project id.
async fn seed_tasks(h: &Harness, tasks: Vec<Value>) -> String {
    let project = h
        .orchestrator
        .create_project("demo", "do the work")
        .await
        .unwrap();
    let plan = Plan {
        id: new_id(),
        project_id: project.id.clone(),
        version: 1,
        model_used: "claude-sonnet-4-6".to_string(),
        prompt_tokens: 0,
        completion_tokens: 0,
        cost_nanos: 0,
        payload: json!({ "summary": "scripted", "tasks": tasks }),
        status: PlanStatus::Draft,
        created_at: h.clock.now(),
    };
    h.orchestrator.store.insert_plan(&plan).await.unwrap();
    h.orchestrator
        .approve_plan(&project.id, &plan.id)
        .await
        .unwrap();

    let ready = h.orchestrator.get_project(&project.id).await.unwrap();
    assert_eq!(ready.status, ProjectStatus::Ready);
    project.id
}

/// Seed an approved plan and start execution; returns the project id.
async fn start_with_tasks(h: &Harness, tasks: Vec<Value>) -> String {
    let pid = seed_tasks(h, tasks).await;
    h.orchestrator.start_project(&pid).await.unwrap();
    pid
}

async fn project_status(h: &Harness, pid: &str) -> ProjectStatus {
    h.orchestrator.get_project(pid).await.unwrap().status
}

async fn task_statuses(h: &Harness, pid: &str) -> HashMap<String, TaskStatus> {
    h.orchestrator
        .list_tasks(pid, None)
        .await
        .unwrap()
        .into_iter()
        .map(|t| (t.title, t.status))
        .collect()
}

async fn count_events(h: &Harness, pid: &str, kind: EventKind) -> usize {
    h.orchestrator
        .recent_events(pid, None, 500)
        .await
        .unwrap()
        .iter()
        .filter(|e| e.kind == kind)
        .count()
}

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Tick until the project reaches the wanted status.
async fn tick_until_project(h: &Harness, pid: &str, wanted: ProjectStatus) {
    let deadline = std::time::Instant::now() + CONVERGE_TIMEOUT;
    loop {
        h.orchestrator.executor.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let status = project_status(h, pid).await;
        if status == wanted {
            return;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "project stuck in {status:?}, wanted {wanted:?}"
        );
    }
}

/// Tick until one task reaches the wanted status.
async fn tick_until_task(h: &Harness, pid: &str, title: &str, wanted: TaskStatus) {
    let deadline = std::time::Instant::now() + CONVERGE_TIMEOUT;
    loop {
        h.orchestrator.executor.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        if task_statuses(h, pid).await.get(title) == Some(&wanted) {
            return;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "task '{title}' never reached {wanted:?}"
        );
    }
}

/// Tick until at least `at_least` events of a kind were published.
async fn tick_until_events(h: &Harness, pid: &str, kind: EventKind, at_least: usize) {
    let deadline = std::time::Instant::now() + CONVERGE_TIMEOUT;
    loop {
        h.orchestrator.executor.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        if count_events(h, pid, kind).await >= at_least {
            return;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "never saw {at_least} {kind:?} event(s)"
        );
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_single_task_happy_path() {
    let h = harness(base_config()).await;
    let pid = start_with_tasks(&h, vec![task_def("sum", "compute 2+3", json!([]))]).await;

    tick_until_project(&h, &pid, ProjectStatus::Completed).await;

    let tasks = h.orchestrator.list_tasks(&pid, None).await.unwrap();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.output_text.as_deref(), Some("5"));
    assert_eq!(task.prompt_tokens, 10);
    assert_eq!(task.completion_tokens, 1);
    // Haiku tier pricing: 10 * $1/1M + 1 * $5/1M.
    assert_eq!(task.cost_nanos, 15_000);

    // Exactly one usage record, matching router pricing.
    let usage = h.orchestrator.store.usage_for_task(&task.id).await.unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].cost_nanos, 15_000);
    assert_eq!(usage[0].provider, "anthropic");

    let status = h.orchestrator.budget_status().await.unwrap();
    assert_eq!(status.daily_spent_nanos, 15_000);

    // Events in production order.
    let kinds: Vec<EventKind> = h
        .orchestrator
        .recent_events(&pid, None, 50)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::TaskStart,
            EventKind::TaskComplete,
            EventKind::ProjectComplete
        ]
    );
}

#[tokio::test]
async fn s2_dependency_blocking_and_cancellation() {
    let h = harness(base_config()).await;
    h.anthropic.script("hold-alpha", vec![MockReply::Hang]);

    let pid = start_with_tasks(
        &h,
        vec![
            task_def("alpha", "hold-alpha: long work", json!([])),
            task_def("beta", "summarize alpha", json!([0])),
        ],
    )
    .await;

    // Alpha reaches RUNNING; beta stays BLOCKED behind it.
    tick_until_task(&h, &pid, "alpha", TaskStatus::Running).await;
    let statuses = task_statuses(&h, &pid).await;
    assert_eq!(statuses["beta"], TaskStatus::Blocked);

    h.orchestrator.cancel_project(&pid).await.unwrap();

    // The in-flight worker observes the signal and exits.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while h.orchestrator.executor.inflight_count() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(std::time::Instant::now() < deadline, "worker did not exit");
    }

    let statuses = task_statuses(&h, &pid).await;
    assert_eq!(statuses["alpha"], TaskStatus::Cancelled);
    assert_eq!(statuses["beta"], TaskStatus::Cancelled);
    assert_eq!(project_status(&h, &pid).await, ProjectStatus::Cancelled);

    // Reservations net to zero: the whole daily budget is reservable again.
    let other = h.orchestrator.create_project("other", "x").await.unwrap();
    assert!(h
        .orchestrator
        .budget
        .reserve(nanos_from_usd(5.0), &other.id)
        .await
        .unwrap());

    // No further task_start events after cancellation (bounded grace: two
    // extra ticks).
    let starts_before = count_events(&h, &pid, EventKind::TaskStart).await;
    h.orchestrator.executor.tick().await.unwrap();
    h.orchestrator.executor.tick().await.unwrap();
    assert_eq!(
        count_events(&h, &pid, EventKind::TaskStart).await,
        starts_before
    );
}

#[tokio::test]
async fn s3_budget_exhaustion_under_concurrency() {
    let mut config = base_config();
    config.budget.daily_nanos = nanos_from_usd(1.0);
    config.budget.monthly_nanos = nanos_from_usd(100.0);
    config.budget.per_project_nanos = nanos_from_usd(100.0);
    config.max_concurrent_tasks = 12;
    // Haiku estimate: 1500 * $1/1M input + 19_700 * $5/1M output = $0.10.
    config.default_max_tokens = 19_700;

    let h = harness(config).await;
    // Every task suspends inside the provider until the gate opens, so the
    // first tick's reservations cannot be released early by fast workers.
    h.anthropic.script(
        "compute item",
        vec![MockReply::Gated {
            text: "done".to_string(),
            input_tokens: 10,
            output_tokens: 1,
        }],
    );
    let tasks: Vec<Value> = (0..20)
        .map(|i| task_def(&format!("task-{i:02}"), &format!("compute item {i}"), json!([])))
        .collect();
    let pid = start_with_tasks(&h, tasks).await;

    // One tick: exactly 10 reservations of $0.10 fit under $1.00.
    h.orchestrator.executor.tick().await.unwrap();
    let dispatched = h
        .orchestrator
        .list_tasks(&pid, None)
        .await
        .unwrap()
        .iter()
        .filter(|t| t.status != TaskStatus::Pending)
        .count();
    assert_eq!(dispatched, 10);
    assert_eq!(count_events(&h, &pid, EventKind::BudgetWarning).await, 1);

    // Open the gate: actual costs are tiny, so completions release their
    // reservations and the remaining tasks fit in later ticks.
    h.anthropic.open_gate(40);
    tick_until_project(&h, &pid, ProjectStatus::Completed).await;
    let statuses = task_statuses(&h, &pid).await;
    assert!(statuses.values().all(|s| *s == TaskStatus::Completed));

    // Still only one budget_warning for the period.
    assert_eq!(count_events(&h, &pid, EventKind::BudgetWarning).await, 1);

    // 20 tasks, one round each.
    let summary = h.orchestrator.usage_summary(Some(pid.as_str())).await.unwrap();
    assert_eq!(summary.api_call_count, 20);
}

#[tokio::test]
async fn b2_offline_resource_defers_dispatch() {
    // Reserve a port with a throwaway listener, then release it so the
    // first probe sees the resource offline.
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let mut config = base_config();
    config.ollama_host = format!("http://127.0.0.1:{port}");
    config.health_probe_timeout = Duration::from_millis(300);
    let h = harness(config).await;

    // A simple research task routes to the free local tier.
    let pid = start_with_tasks(
        &h,
        vec![json!({
            "title": "lookup",
            "description": "find the answer locally",
            "task_type": "research",
            "complexity": "simple",
            "depends_on": [],
            "tools_needed": []
        })],
    )
    .await;

    h.orchestrator.resources.check_all().await;
    h.orchestrator.executor.tick().await.unwrap();
    let statuses = task_statuses(&h, &pid).await;
    assert_eq!(statuses["lookup"], TaskStatus::Pending);

    // Resource comes online; the first tick after the probe dispatches it.
    let _listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("rebind probe port");
    h.orchestrator.resources.check_all().await;
    tick_until_project(&h, &pid, ProjectStatus::Completed).await;

    let task = &h.orchestrator.list_tasks(&pid, None).await.unwrap()[0];
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.output_text.as_deref(), Some("local ok"));
    assert_eq!(task.cost_nanos, 0);
}

#[tokio::test]
async fn b3_transient_failure_retries_after_backoff() {
    let h = harness(base_config()).await;
    h.anthropic
        .script("flaky", vec![MockReply::Transient, reply_text("recovered", 10, 2)]);

    let pid = start_with_tasks(&h, vec![task_def("flaky-task", "flaky: fetch", json!([]))]).await;

    // First dispatch fails; the task is PENDING again with a retry deadline.
    tick_until_events(&h, &pid, EventKind::TaskRetry, 1).await;
    let task = &h.orchestrator.list_tasks(&pid, None).await.unwrap()[0];
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);

    // Backoff is respected: ticks before the deadline do not re-dispatch
    // (the manual clock has not moved).
    h.orchestrator.executor.tick().await.unwrap();
    h.orchestrator.executor.tick().await.unwrap();
    assert_eq!(count_events(&h, &pid, EventKind::TaskStart).await, 1);

    // Past the deadline, the next eligible tick re-dispatches and succeeds.
    h.clock.advance(Duration::from_secs(30));
    tick_until_project(&h, &pid, ProjectStatus::Completed).await;
    let task = &h.orchestrator.list_tasks(&pid, None).await.unwrap()[0];
    assert_eq!(task.output_text.as_deref(), Some("recovered"));
    assert_eq!(count_events(&h, &pid, EventKind::TaskStart).await, 2);
}

#[tokio::test]
async fn retry_exhaustion_checkpoints_and_resolution_reruns() {
    let mut config = base_config();
    config.max_task_retries = 1;
    let h = harness(config).await;
    h.anthropic.script(
        "doomed",
        vec![
            MockReply::Transient,
            MockReply::Transient,
            reply_text("finally", 10, 1),
        ],
    );

    let pid = start_with_tasks(&h, vec![task_def("doomed", "doomed: attempt", json!([]))]).await;

    // Attempt 1 fails transiently, attempt 2 exhausts retries.
    tick_until_events(&h, &pid, EventKind::TaskRetry, 1).await;
    h.clock.advance(Duration::from_secs(30));
    tick_until_task(&h, &pid, "doomed", TaskStatus::NeedsReview).await;

    let checkpoints = h.orchestrator.list_checkpoints(&pid, false).await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    let checkpoint = &checkpoints[0];
    assert_eq!(checkpoint.checkpoint_type, "retry_exhausted");
    assert!(checkpoint
        .attempts
        .as_array()
        .map(|a| !a.is_empty())
        .unwrap_or(false));
    assert_eq!(count_events(&h, &pid, EventKind::Checkpoint).await, 1);

    // Liveness leaves the project alone while a review is open.
    h.orchestrator.executor.tick().await.unwrap();
    assert_eq!(project_status(&h, &pid).await, ProjectStatus::Executing);

    // Resolving with retry reruns the task fresh and completes the project.
    let resolved = h
        .orchestrator
        .resolve_checkpoint(
            &checkpoint.id,
            CheckpointAction::Retry {
                guidance: Some("try a different endpoint".to_string()),
            },
        )
        .await
        .unwrap();
    assert!(resolved.resolved_at.is_some());

    let task = &h.orchestrator.list_tasks(&pid, None).await.unwrap()[0];
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);
    assert!(task.context.iter().any(|c| c.kind == "checkpoint_guidance"));

    tick_until_project(&h, &pid, ProjectStatus::Completed).await;

    // Resolving twice is a conflict.
    let err = h
        .orchestrator
        .resolve_checkpoint(&checkpoint.id, CheckpointAction::Skip)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestrationError::Conflict(_)));
}

#[tokio::test]
async fn dead_project_detection_fails_unsatisfiable_graphs() {
    let mut config = base_config();
    config.max_task_retries = 0;
    config.checkpoint_on_retry_exhausted = false;
    let h = harness(config).await;
    h.anthropic.script("doomed", vec![MockReply::Transient]);

    let pid = start_with_tasks(
        &h,
        vec![
            task_def("doomed", "doomed: flake out", json!([])),
            task_def("downstream", "needs the doomed task", json!([0])),
        ],
    )
    .await;

    tick_until_project(&h, &pid, ProjectStatus::Failed).await;

    let statuses = task_statuses(&h, &pid).await;
    assert_eq!(statuses["doomed"], TaskStatus::Failed);
    assert_eq!(statuses["downstream"], TaskStatus::Blocked);
    assert!(count_events(&h, &pid, EventKind::ProjectFailed).await >= 1);
}

#[tokio::test]
async fn budget_hard_stop_mid_tool_loop_returns_partial() {
    let mut config = base_config();
    config.budget.daily_nanos = nanos_from_usd(1.0);
    let h = harness(config).await;
    // Every round asks for another tool call; without the per-round budget
    // check the loop would keep going.
    h.anthropic.script(
        "cheap-loop",
        vec![MockReply::GatedToolUse {
            input_tokens: 10,
            output_tokens: 1,
        }],
    );

    let pid = start_with_tasks(&h, vec![task_def("looper", "cheap-loop: iterate", json!([]))]).await;
    h.orchestrator.executor.tick().await.unwrap();

    // The task is in flight (its own spend is far under its reservation)
    // while the rest of the day's budget gets consumed elsewhere.
    h.orchestrator
        .budget
        .record(SpendRecord {
            cost_nanos: nanos_from_usd(0.999),
            prompt_tokens: 200_000,
            completion_tokens: 50_000,
            provider: "anthropic",
            model: "claude-sonnet-4-6",
            purpose: "planning",
            project_id: None,
            task_id: None,
        })
        .await
        .unwrap();

    // One round is all the hard stop allows.
    h.anthropic.open_gate(1);
    tick_until_project(&h, &pid, ProjectStatus::Completed).await;

    let task = &h.orchestrator.list_tasks(&pid, None).await.unwrap()[0];
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.output_text.as_deref(), Some("working"));

    // Exactly one round ran despite the pending tool call.
    let usage = h.orchestrator.store.usage_for_task(&task.id).await.unwrap();
    assert_eq!(usage.len(), 1);

    // The completion carries the partial-result marker.
    let events = h.orchestrator.recent_events(&pid, None, 50).await.unwrap();
    let complete = events
        .iter()
        .find(|e| e.kind == EventKind::TaskComplete)
        .expect("task_complete event");
    assert_eq!(complete.extras["partial"], json!(true));
}

#[tokio::test]
async fn ready_projects_are_scanned_for_liveness() {
    let h = harness(base_config()).await;
    let pid = seed_tasks(
        &h,
        vec![
            task_def("root", "base work", json!([])),
            task_def("leaf", "needs root", json!([0])),
        ],
    )
    .await;

    // The root task dies before execution ever starts; the leaf can never
    // unblock, so the DAG is unsatisfiable while the project is still READY.
    let root_id = h
        .orchestrator
        .list_tasks(&pid, None)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.title == "root")
        .unwrap()
        .id;
    h.orchestrator.store.fail_task(&root_id, "abandoned").await.unwrap();

    h.orchestrator.executor.tick().await.unwrap();
    assert_eq!(project_status(&h, &pid).await, ProjectStatus::Failed);
    assert!(count_events(&h, &pid, EventKind::ProjectFailed).await >= 1);
    // Nothing was ever dispatched.
    assert_eq!(count_events(&h, &pid, EventKind::TaskStart).await, 0);
}

#[tokio::test]
async fn budget_manager_is_exact_under_contention() {
    // P4 directly on the manager: N concurrent reserve(c) grants at most
    // floor((limit - committed) / c).
    let clock = Arc::new(ManualClock::new(
        "2026-06-01T08:00:00Z".parse::<DateTime<Utc>>().unwrap(),
    ));
    let store = Arc::new(
        Store::open_in_memory(clock.clone() as Arc<dyn Clock>)
            .await
            .unwrap(),
    );
    let mut limits = Config::default().budget;
    limits.daily_nanos = nanos_from_usd(1.0);
    limits.monthly_nanos = nanos_from_usd(100.0);
    limits.per_project_nanos = nanos_from_usd(100.0);
    let budget = Arc::new(BudgetManager::new(store, clock, limits));

    let mut handles = Vec::new();
    for _ in 0..40 {
        let budget = budget.clone();
        handles.push(tokio::spawn(async move {
            budget.reserve(nanos_from_usd(0.10), "p1").await.unwrap()
        }));
    }
    let granted = futures::future::join_all(handles)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();
    assert_eq!(granted, 10);
}
