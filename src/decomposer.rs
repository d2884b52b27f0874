//! Plan decomposition: approved plan JSON → task rows + dependency edges.
//!
//! `depends_on` entries arrive as heterogeneous JSON (integers, numeric
//! strings, garbage). They parse into [`DepRef`]; anything that does not
//! resolve to a valid in-range index is dropped with a logged warning.
//! A cycle surviving that filter is a hard failure.
//!
//! Each task gets a `wave`: the length of the longest dependency chain
//! ending at it, computed in topological order via Kahn's algorithm. Tasks
//! of the same wave are mutually independent.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{OrchestrationError, Result};
use crate::router;
use crate::store::{
    new_id, rows, Complexity, ContextEntry, PlanStatus, ProjectStatus, Store, Task, TaskStatus,
    TaskType,
};

/// One parsed `depends_on` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepRef {
    /// A task index into the plan's task list.
    Index(u32),
    /// A non-numeric name; the plan contract is index-based, so these are
    /// dropped.
    Named(String),
    /// Anything else, kept with the reason for the log line.
    Invalid { raw: String, reason: String },
}

/// Parse one raw dependency value. Numeric strings count as indices.
pub fn parse_dep(value: &Value) -> DepRef {
    match value {
        Value::Number(n) => match n.as_u64() {
            Some(idx) if idx <= u32::MAX as u64 => DepRef::Index(idx as u32),
            _ => DepRef::Invalid {
                raw: n.to_string(),
                reason: "negative or oversized index".to_string(),
            },
        },
        Value::String(s) => {
            let trimmed = s.trim();
            match trimmed.parse::<u32>() {
                Ok(idx) => DepRef::Index(idx),
                Err(_) => DepRef::Named(trimmed.to_string()),
            }
        }
        other => DepRef::Invalid {
            raw: other.to_string(),
            reason: "not an index".to_string(),
        },
    }
}

/// Resolve raw dependency lists into in-range, non-self index edges.
/// Out-of-range, self-referential, named, and invalid entries are dropped
/// with a warning.
fn resolve_deps(raw_deps: &[Vec<Value>], task_count: usize) -> Vec<Vec<usize>> {
    let mut resolved = Vec::with_capacity(raw_deps.len());
    for (task_idx, deps) in raw_deps.iter().enumerate() {
        let mut edges = Vec::new();
        for value in deps {
            match parse_dep(value) {
                DepRef::Index(idx) => {
                    let idx = idx as usize;
                    if idx >= task_count {
                        tracing::warn!(
                            task = task_idx,
                            dep = idx,
                            "dropping out-of-range dependency"
                        );
                    } else if idx == task_idx {
                        tracing::warn!(task = task_idx, "dropping self-referential dependency");
                    } else if !edges.contains(&idx) {
                        edges.push(idx);
                    }
                }
                DepRef::Named(name) => {
                    tracing::warn!(task = task_idx, dep = %name, "dropping named dependency");
                }
                DepRef::Invalid { raw, reason } => {
                    tracing::warn!(task = task_idx, dep = %raw, %reason, "dropping invalid dependency");
                }
            }
        }
        resolved.push(edges);
    }
    resolved
}

/// Assign each task its wave via Kahn's algorithm. Returns the indices left
/// unprocessed when the graph has a cycle.
pub fn compute_waves(deps: &[Vec<usize>]) -> std::result::Result<Vec<i64>, Vec<usize>> {
    let n = deps.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (task, edges) in deps.iter().enumerate() {
        in_degree[task] = edges.len();
        for &dep in edges {
            dependents[dep].push(task);
        }
    }

    let mut waves = vec![0i64; n];
    let mut queue: VecDeque<usize> =
        (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut processed = 0usize;

    while let Some(task) = queue.pop_front() {
        processed += 1;
        for &dependent in &dependents[task] {
            if waves[task] + 1 > waves[dependent] {
                waves[dependent] = waves[task] + 1;
            }
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if processed < n {
        let cyclic: Vec<usize> = (0..n).filter(|&i| in_degree[i] > 0).collect();
        return Err(cyclic);
    }
    Ok(waves)
}

/// Result of a successful decomposition.
#[derive(Debug, Clone, Serialize)]
pub struct DecompositionSummary {
    pub tasks_created: usize,
    pub task_ids: Vec<String>,
    pub estimated_cost_nanos: u64,
    pub summary: String,
}

struct ParsedTask {
    title: String,
    description: String,
    task_type: TaskType,
    complexity: Complexity,
    tools: Vec<String>,
}

fn parse_task(index: usize, raw: &Value) -> (ParsedTask, Vec<Value>) {
    let title = raw["title"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| format!("Task {}", index + 1));
    let description = raw["description"].as_str().unwrap_or("").to_string();
    let task_type = TaskType::parse_lossy(raw["task_type"].as_str().unwrap_or("code"));
    let complexity = Complexity::parse_lossy(raw["complexity"].as_str().unwrap_or("medium"));
    let tools = match raw["tools_needed"].as_array() {
        Some(names) => names
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        None => router::recommend_tools(task_type),
    };
    let deps = raw["depends_on"].as_array().cloned().unwrap_or_default();
    (
        ParsedTask {
            title,
            description,
            task_type,
            complexity,
            tools,
        },
        deps,
    )
}

/// Convert an approved plan into executable tasks with dependencies.
///
/// Runs once per plan: a plan that has already left DRAFT is rejected, so
/// repeating the call can never duplicate tasks. All row writes happen in
/// one transaction; the project moves to READY on commit.
pub async fn decompose_plan(
    store: &Store,
    clock: &Arc<dyn Clock>,
    config: &Config,
    project_id: &str,
    plan_id: &str,
) -> Result<DecompositionSummary> {
    let plan = store
        .get_plan(plan_id)
        .await?
        .ok_or_else(|| OrchestrationError::NotFound(format!("plan {plan_id}")))?;
    if plan.project_id != project_id {
        return Err(OrchestrationError::NotFound(format!(
            "plan {plan_id} in project {project_id}"
        )));
    }
    if plan.status != PlanStatus::Draft {
        return Err(OrchestrationError::Conflict(format!(
            "plan is already {}",
            plan.status
        )));
    }
    store
        .get_project(project_id)
        .await?
        .ok_or_else(|| OrchestrationError::NotFound(format!("project {project_id}")))?;

    let summary = plan.payload["summary"].as_str().unwrap_or("").to_string();
    let raw_tasks = plan.payload["tasks"].as_array().cloned().unwrap_or_default();
    if raw_tasks.is_empty() {
        return Err(OrchestrationError::Validation("plan has no tasks".into()));
    }

    let mut parsed = Vec::with_capacity(raw_tasks.len());
    let mut raw_deps = Vec::with_capacity(raw_tasks.len());
    for (i, raw) in raw_tasks.iter().enumerate() {
        let (task, deps) = parse_task(i, raw);
        parsed.push(task);
        raw_deps.push(deps);
    }

    let deps = resolve_deps(&raw_deps, parsed.len());
    let waves = compute_waves(&deps).map_err(|cyclic| {
        let titles: Vec<&str> = cyclic.iter().map(|&i| parsed[i].title.as_str()).collect();
        OrchestrationError::CycleDetected(format!(
            "tasks form a dependency cycle: {}",
            titles.join(", ")
        ))
    })?;

    let now = clock.now();
    let task_count = parsed.len();
    let mut tasks = Vec::with_capacity(task_count);
    let mut estimated_cost_nanos = 0u64;
    for (i, p) in parsed.iter().enumerate() {
        let tier = router::recommend_tier(p.task_type, p.complexity);
        estimated_cost_nanos += router::estimate_task_cost(tier, config.default_max_tokens, config);
        tasks.push(Task {
            id: new_id(),
            project_id: project_id.to_string(),
            plan_id: plan_id.to_string(),
            title: p.title.clone(),
            description: p.description.clone(),
            task_type: p.task_type,
            // Earlier plan position wins ties within a wave.
            priority: ((task_count - i) * 10) as i64,
            status: TaskStatus::Pending,
            model_tier: tier,
            model_used: None,
            context: vec![ContextEntry::new("project_summary", summary.clone())],
            tools: p.tools.clone(),
            system_prompt: String::new(),
            output_text: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_nanos: 0,
            max_tokens: config.default_max_tokens,
            retry_count: 0,
            max_retries: config.max_task_retries,
            wave: waves[i],
            verification_status: None,
            verification_notes: None,
            error: None,
            depends_on: Vec::new(),
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        });
    }

    let task_ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
    let now_string = now.to_rfc3339();
    store
        .transaction(|conn| {
            for task in &tasks {
                rows::insert_task(conn, task)?;
            }
            for (i, edges) in deps.iter().enumerate() {
                for &dep in edges {
                    rows::insert_dep(conn, &task_ids[i], &task_ids[dep])?;
                }
            }
            // Keep the single-approved-plan invariant.
            conn.execute(
                "UPDATE plans SET status = 'superseded' \
                 WHERE project_id = ?1 AND status = 'approved'",
                rusqlite::params![project_id],
            )?;
            conn.execute(
                "UPDATE plans SET status = 'approved' WHERE id = ?1",
                rusqlite::params![plan_id],
            )?;
            conn.execute(
                "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![ProjectStatus::Ready.as_str(), now_string, project_id],
            )?;
            Ok(())
        })
        .await?;

    store.mark_blocked_tasks(project_id).await?;

    tracing::info!(
        project_id,
        plan_id,
        tasks = task_ids.len(),
        "plan decomposed"
    );
    Ok(DecompositionSummary {
        tasks_created: task_ids.len(),
        task_ids,
        estimated_cost_nanos,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn dep_parsing_accepts_ints_and_numeric_strings() {
        assert_eq!(parse_dep(&json!(2)), DepRef::Index(2));
        assert_eq!(parse_dep(&json!("2")), DepRef::Index(2));
        assert_eq!(parse_dep(&json!(" 3 ")), DepRef::Index(3));
        assert_eq!(
            parse_dep(&json!("setup task")),
            DepRef::Named("setup task".to_string())
        );
        assert!(matches!(parse_dep(&json!(-1)), DepRef::Invalid { .. }));
        assert!(matches!(parse_dep(&json!({"id": 1})), DepRef::Invalid { .. }));
    }

    #[test]
    fn resolve_drops_out_of_range_and_self_refs() {
        let raw = vec![
            vec![],
            vec![json!(0), json!(1), json!(99), json!("nope")],
        ];
        let resolved = resolve_deps(&raw, 2);
        assert_eq!(resolved, vec![vec![], vec![0]]);
    }

    #[test]
    fn waves_follow_longest_chain() {
        // 0 -> 1 -> 3, 0 -> 2, 3 also depends on 2.
        let deps = vec![vec![], vec![0], vec![0], vec![1, 2]];
        let waves = compute_waves(&deps).unwrap();
        assert_eq!(waves, vec![0, 1, 1, 2]);
    }

    #[test]
    fn independent_tasks_share_wave_zero() {
        let deps = vec![vec![], vec![], vec![]];
        assert_eq!(compute_waves(&deps).unwrap(), vec![0, 0, 0]);
    }

    #[test]
    fn cycles_are_detected() {
        let deps = vec![vec![1], vec![0]];
        let cyclic = compute_waves(&deps).unwrap_err();
        assert_eq!(cyclic, vec![0, 1]);
    }

    fn plan_payload() -> Value {
        json!({
            "summary": "build a toy site",
            "tasks": [
                {"title": "outline", "description": "outline it", "task_type": "research",
                 "complexity": "simple", "depends_on": [], "tools_needed": []},
                {"title": "draft", "description": "write it", "task_type": "documentation",
                 "complexity": "medium", "depends_on": ["0", 7, "outline"], "tools_needed": []},
                {"title": "review", "description": "review it", "task_type": "analysis",
                 "complexity": "medium", "depends_on": [1], "tools_needed": []}
            ]
        })
    }

    async fn seeded_store() -> (Store, String, String) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Store::open_in_memory(clock).await.unwrap();
        let project = store.create_project("site", "make a site").await.unwrap();
        let plan = crate::store::Plan {
            id: new_id(),
            project_id: project.id.clone(),
            version: 1,
            model_used: "claude-sonnet-4-6".to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_nanos: 0,
            payload: plan_payload(),
            status: PlanStatus::Draft,
            created_at: Utc::now(),
        };
        store.insert_plan(&plan).await.unwrap();
        (store, project.id, plan.id)
    }

    #[tokio::test]
    async fn decompose_materializes_tasks_and_waves() {
        let (store, project_id, plan_id) = seeded_store().await;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let config = Config::default();

        let summary = decompose_plan(&store, &clock, &config, &project_id, &plan_id)
            .await
            .unwrap();
        assert_eq!(summary.tasks_created, 3);

        let tasks = store.list_tasks(&project_id, None).await.unwrap();
        assert_eq!(tasks.len(), 3);
        let by_title: std::collections::HashMap<&str, &Task> =
            tasks.iter().map(|t| (t.title.as_str(), t)).collect();
        assert_eq!(by_title["outline"].wave, 0);
        assert_eq!(by_title["draft"].wave, 1);
        assert_eq!(by_title["review"].wave, 2);
        // The bogus entries ("7", "outline") were dropped; only index 0 remains.
        assert_eq!(by_title["draft"].depends_on, vec![by_title["outline"].id.clone()]);
        assert_eq!(by_title["draft"].status, TaskStatus::Blocked);
        assert_eq!(by_title["outline"].status, TaskStatus::Pending);

        let project = store.get_project(&project_id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Ready);
        let plan = store.get_plan(&plan_id).await.unwrap().unwrap();
        assert_eq!(plan.status, PlanStatus::Approved);
    }

    #[tokio::test]
    async fn decompose_twice_never_duplicates_tasks() {
        let (store, project_id, plan_id) = seeded_store().await;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let config = Config::default();

        decompose_plan(&store, &clock, &config, &project_id, &plan_id)
            .await
            .unwrap();
        let err = decompose_plan(&store, &clock, &config, &project_id, &plan_id)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Conflict(_)));
        assert_eq!(store.list_tasks(&project_id, None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn cyclic_plan_is_rejected() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Store::open_in_memory(clock.clone()).await.unwrap();
        let project = store.create_project("p", "r").await.unwrap();
        let plan = crate::store::Plan {
            id: new_id(),
            project_id: project.id.clone(),
            version: 1,
            model_used: "m".to_string(),
            prompt_tokens: 0,
            completion_tokens: 0,
            cost_nanos: 0,
            payload: json!({
                "summary": "s",
                "tasks": [
                    {"title": "a", "depends_on": [1]},
                    {"title": "b", "depends_on": [0]}
                ]
            }),
            status: PlanStatus::Draft,
            created_at: Utc::now(),
        };
        store.insert_plan(&plan).await.unwrap();

        let config = Config::default();
        let err = decompose_plan(&store, &clock, &config, &project.id, &plan.id)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::CycleDetected(_)));
        assert!(store.list_tasks(&project.id, None).await.unwrap().is_empty());
    }
}
