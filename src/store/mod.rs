//! SQLite-backed durable state with WAL mode.
//!
//! One process owns the database. A single `rusqlite::Connection` lives
//! behind a `tokio::sync::Mutex`: the driver is not thread-safe per
//! connection, and the mutex doubles as the single-writer serialization the
//! data model relies on. Readers see transactions as all-or-nothing.
//!
//! Multi-statement writes (budget recording, worker completion, plan
//! materialization) run through [`Store::transaction`], which takes an
//! immediate write lock on entry, commits on clean exit, and rolls back on
//! error exit. Row-level helpers in [`rows`] operate on `&Connection` so the
//! same code participates in an outer transaction or stands alone.

pub mod types;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::error::{OrchestrationError, Result};

pub use types::*;

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    requirements TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'draft',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS plans (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    version INTEGER NOT NULL DEFAULT 1,
    model_used TEXT NOT NULL,
    prompt_tokens INTEGER NOT NULL DEFAULT 0,
    completion_tokens INTEGER NOT NULL DEFAULT 0,
    cost_nanos INTEGER NOT NULL DEFAULT 0,
    plan_json TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'draft',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    plan_id TEXT NOT NULL REFERENCES plans(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    task_type TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    model_tier TEXT NOT NULL DEFAULT 'haiku',
    model_used TEXT,
    context_json TEXT NOT NULL DEFAULT '[]',
    tools_json TEXT NOT NULL DEFAULT '[]',
    system_prompt TEXT NOT NULL DEFAULT '',
    output_text TEXT,
    prompt_tokens INTEGER NOT NULL DEFAULT 0,
    completion_tokens INTEGER NOT NULL DEFAULT 0,
    cost_nanos INTEGER NOT NULL DEFAULT 0,
    max_tokens INTEGER NOT NULL DEFAULT 4096,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    wave INTEGER NOT NULL DEFAULT 0,
    verification_status TEXT,
    verification_notes TEXT,
    error TEXT,
    started_at TEXT,
    completed_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_deps (
    task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    depends_on TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    PRIMARY KEY (task_id, depends_on)
);

CREATE TABLE IF NOT EXISTS usage_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT REFERENCES projects(id),
    task_id TEXT REFERENCES tasks(id),
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    prompt_tokens INTEGER NOT NULL,
    completion_tokens INTEGER NOT NULL,
    cost_nanos INTEGER NOT NULL,
    purpose TEXT NOT NULL DEFAULT '',
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS budget_periods (
    period_key TEXT PRIMARY KEY,
    period_type TEXT NOT NULL,
    cost_nanos INTEGER NOT NULL DEFAULT 0,
    prompt_tokens INTEGER NOT NULL DEFAULT 0,
    completion_tokens INTEGER NOT NULL DEFAULT 0,
    api_call_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS task_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id TEXT NOT NULL,
    task_id TEXT,
    event_type TEXT NOT NULL,
    message TEXT,
    data_json TEXT,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    task_id TEXT REFERENCES tasks(id) ON DELETE CASCADE,
    checkpoint_type TEXT NOT NULL,
    summary TEXT NOT NULL,
    attempts_json TEXT NOT NULL DEFAULT '[]',
    question TEXT NOT NULL,
    response TEXT,
    resolved_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_plans_project ON plans(project_id);
CREATE INDEX IF NOT EXISTS idx_tasks_project ON tasks(project_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_project_wave ON tasks(project_id, wave);
CREATE INDEX IF NOT EXISTS idx_deps_depends ON task_deps(depends_on);
CREATE INDEX IF NOT EXISTS idx_usage_project ON usage_log(project_id);
CREATE INDEX IF NOT EXISTS idx_usage_timestamp ON usage_log(timestamp);
CREATE INDEX IF NOT EXISTS idx_budget_type ON budget_periods(period_type);
CREATE INDEX IF NOT EXISTS idx_events_project ON task_events(project_id);
CREATE INDEX IF NOT EXISTS idx_events_task ON task_events(task_id);
CREATE INDEX IF NOT EXISTS idx_checkpoints_project ON checkpoints(project_id);
"#;

/// Durable state for projects, plans, tasks, usage, events, and checkpoints.
pub struct Store {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl Store {
    /// Open (or create) the database file, apply the schema, and recover any
    /// state interrupted by a previous shutdown.
    pub async fn open(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| OrchestrationError::Internal(format!("create data dir: {e}")))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn, clock)
    }

    /// In-memory database for tests.
    pub async fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, clock)
    }

    fn init(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        let now = clock.now_string();
        let recovered = conn.execute(
            "UPDATE tasks SET status = 'failed', error = 'interrupted by restart', updated_at = ?1 \
             WHERE status IN ('running', 'queued')",
            params![now],
        )?;
        if recovered > 0 {
            tracing::info!(count = recovered, "recovered interrupted task(s)");
        }
        conn.execute(
            "UPDATE projects SET status = 'paused', updated_at = ?1 WHERE status = 'executing'",
            params![now],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            clock,
        })
    }

    fn now(&self) -> String {
        self.clock.now_string()
    }

    /// Run `f` inside a write transaction (BEGIN IMMEDIATE). Commits when `f`
    /// returns Ok, rolls back otherwise. Writes issued through the provided
    /// connection participate in this transaction.
    pub async fn transaction<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    pub async fn create_project(&self, name: &str, requirements: &str) -> Result<Project> {
        let id = new_id();
        let now = self.now();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO projects (id, name, requirements, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, 'draft', ?4, ?4)",
            params![id, name, requirements, now],
        )?;
        rows::get_project(&conn, &id)?
            .ok_or_else(|| OrchestrationError::Internal("project vanished after insert".into()))
    }

    pub async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let conn = self.conn.lock().await;
        Ok(rows::get_project(&conn, id)?)
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT * FROM projects ORDER BY created_at DESC")?;
        let out = stmt
            .query_map([], rows::project_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(out)
    }

    /// Projects in any of the given statuses, oldest first.
    pub async fn projects_in_statuses(&self, statuses: &[ProjectStatus]) -> Result<Vec<Project>> {
        let clause = statuses
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM projects WHERE status IN ({clause}) ORDER BY created_at ASC"
        ))?;
        let out = stmt
            .query_map([], rows::project_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(out)
    }

    pub async fn set_project_status(&self, id: &str, status: ProjectStatus) -> Result<()> {
        let now = self.now();
        let conn = self.conn.lock().await;
        if status.is_terminal() {
            conn.execute(
                "UPDATE projects SET status = ?1, completed_at = ?2, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )?;
        } else {
            conn.execute(
                "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now, id],
            )?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Plans
    // ------------------------------------------------------------------

    pub async fn insert_plan(&self, plan: &Plan) -> Result<()> {
        let conn = self.conn.lock().await;
        rows::insert_plan(&conn, plan)?;
        Ok(())
    }

    pub async fn get_plan(&self, id: &str) -> Result<Option<Plan>> {
        let conn = self.conn.lock().await;
        Ok(rows::get_plan(&conn, id)?)
    }

    pub async fn plans_for_project(&self, project_id: &str) -> Result<Vec<Plan>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM plans WHERE project_id = ?1 ORDER BY version DESC")?;
        let out = stmt
            .query_map(params![project_id], rows::plan_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(out)
    }

    pub async fn max_plan_version(&self, project_id: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        let v: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM plans WHERE project_id = ?1",
            params![project_id],
            |r| r.get(0),
        )?;
        Ok(v)
    }

    /// Mark all draft plans of a project superseded (a newer draft arrived).
    pub async fn supersede_draft_plans(&self, project_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE plans SET status = 'superseded' WHERE project_id = ?1 AND status = 'draft'",
            params![project_id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let conn = self.conn.lock().await;
        let task = conn
            .query_row(
                "SELECT * FROM tasks WHERE id = ?1",
                params![id],
                rows::task_from_row,
            )
            .optional()?;
        match task {
            Some(mut task) => {
                task.depends_on = rows::task_deps(&conn, &task.id)?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    pub async fn list_tasks(
        &self,
        project_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut tasks = match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM tasks WHERE project_id = ?1 AND status = ?2 \
                     ORDER BY wave ASC, priority DESC, created_at ASC",
                )?;
                let result = stmt
                    .query_map(params![project_id, status.as_str()], rows::task_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                result
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM tasks WHERE project_id = ?1 \
                     ORDER BY wave ASC, priority DESC, created_at ASC",
                )?;
                let result = stmt
                    .query_map(params![project_id], rows::task_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                result
            }
        };
        let deps = rows::project_deps(&conn, project_id)?;
        for task in &mut tasks {
            if let Some(d) = deps.get(&task.id) {
                task.depends_on = d.clone();
            }
        }
        Ok(tasks)
    }

    /// PENDING tasks whose dependencies are all COMPLETED, ordered by wave
    /// ascending, priority descending, creation time ascending.
    pub async fn ready_tasks(&self, project_id: &str) -> Result<Vec<Task>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT t.* FROM tasks t \
             LEFT JOIN task_deps d ON d.task_id = t.id \
             LEFT JOIN tasks dep ON dep.id = d.depends_on AND dep.status != 'completed' \
             WHERE t.project_id = ?1 AND t.status = 'pending' \
             GROUP BY t.id HAVING COUNT(dep.id) = 0 \
             ORDER BY t.wave ASC, t.priority DESC, t.created_at ASC",
        )?;
        let mut tasks = stmt
            .query_map(params![project_id], rows::task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let deps = rows::project_deps(&conn, project_id)?;
        for task in &mut tasks {
            if let Some(d) = deps.get(&task.id) {
                task.depends_on = d.clone();
            }
        }
        Ok(tasks)
    }

    /// Mark PENDING tasks with incomplete dependencies as BLOCKED.
    pub async fn mark_blocked_tasks(&self, project_id: &str) -> Result<usize> {
        let now = self.now();
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE tasks SET status = 'blocked', updated_at = ?2 \
             WHERE project_id = ?1 AND status = 'pending' AND id IN ( \
               SELECT d.task_id FROM task_deps d \
               JOIN tasks dep ON dep.id = d.depends_on WHERE dep.status != 'completed')",
            params![project_id, now],
        )?;
        Ok(n)
    }

    /// Move BLOCKED tasks whose dependencies are now all COMPLETED back to
    /// PENDING.
    pub async fn unblock_ready_tasks(&self, project_id: &str) -> Result<usize> {
        let now = self.now();
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE tasks SET status = 'pending', updated_at = ?2 \
             WHERE project_id = ?1 AND status = 'blocked' AND id NOT IN ( \
               SELECT d.task_id FROM task_deps d \
               JOIN tasks dep ON dep.id = d.depends_on WHERE dep.status != 'completed')",
            params![project_id, now],
        )?;
        Ok(n)
    }

    /// Atomic dispatch claim: PENDING → QUEUED. Returns false when another
    /// tick already claimed the task (or its status changed underneath us).
    pub async fn claim_for_dispatch(&self, task_id: &str) -> Result<bool> {
        let now = self.now();
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE tasks SET status = 'queued', updated_at = ?2 \
             WHERE id = ?1 AND status = 'pending'",
            params![task_id, now],
        )?;
        Ok(n == 1)
    }

    /// QUEUED → RUNNING with `started_at`. Returns false if the task is no
    /// longer queued (e.g. cancelled between claim and worker start).
    pub async fn mark_running(&self, task_id: &str) -> Result<bool> {
        let now = self.now();
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE tasks SET status = 'running', started_at = ?2, updated_at = ?2 \
             WHERE id = ?1 AND status = 'queued'",
            params![task_id, now],
        )?;
        Ok(n == 1)
    }

    /// Finalize a successful run.
    pub async fn complete_task(
        &self,
        task_id: &str,
        output_text: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost_nanos: u64,
        model_used: &str,
    ) -> Result<()> {
        let now = self.now();
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET status = 'completed', output_text = ?2, prompt_tokens = ?3, \
             completion_tokens = ?4, cost_nanos = ?5, model_used = ?6, completed_at = ?7, \
             updated_at = ?7 WHERE id = ?1",
            params![
                task_id,
                output_text,
                prompt_tokens as i64,
                completion_tokens as i64,
                cost_nanos as i64,
                model_used,
                now
            ],
        )?;
        Ok(())
    }

    pub async fn fail_task(&self, task_id: &str, error: &str) -> Result<()> {
        let now = self.now();
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET status = 'failed', error = ?2, updated_at = ?3 WHERE id = ?1",
            params![task_id, error, now],
        )?;
        Ok(())
    }

    pub async fn set_needs_review(&self, task_id: &str, error: &str) -> Result<()> {
        let now = self.now();
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET status = 'needs_review', error = ?2, updated_at = ?3 WHERE id = ?1",
            params![task_id, error, now],
        )?;
        Ok(())
    }

    /// Transient failure: back to PENDING with an incremented retry counter.
    pub async fn set_retry_pending(&self, task_id: &str, error: &str) -> Result<()> {
        let now = self.now();
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET status = 'pending', retry_count = retry_count + 1, error = ?2, \
             updated_at = ?3 WHERE id = ?1",
            params![task_id, error, now],
        )?;
        Ok(())
    }

    /// Full reset for a human-approved re-run: clears output, error and the
    /// retry counter, optionally appending guidance to the task context.
    pub async fn reset_task_fresh(&self, task_id: &str, guidance: Option<&str>) -> Result<()> {
        let now = self.now();
        self.transaction(|conn| {
            if let Some(guidance) = guidance {
                rows::append_context(conn, task_id, "checkpoint_guidance", guidance, &now)?;
            }
            conn.execute(
                "UPDATE tasks SET status = 'pending', error = NULL, retry_count = 0, \
                 output_text = NULL, completed_at = NULL, updated_at = ?2 WHERE id = ?1",
                params![task_id, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn append_task_context(&self, task_id: &str, kind: &str, content: &str) -> Result<()> {
        let now = self.now();
        self.transaction(|conn| rows::append_context(conn, task_id, kind, content, &now))
            .await
    }

    /// Re-queue a completed-with-gaps task with verifier feedback.
    pub async fn requeue_with_feedback(&self, task_id: &str, feedback: &str) -> Result<()> {
        let now = self.now();
        self.transaction(|conn| {
            rows::append_context(conn, task_id, "verification_feedback", feedback, &now)?;
            conn.execute(
                "UPDATE tasks SET status = 'pending', retry_count = retry_count + 1, \
                 completed_at = NULL, updated_at = ?2 WHERE id = ?1",
                params![task_id, now],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_verification(
        &self,
        task_id: &str,
        status: VerificationStatus,
        notes: &str,
    ) -> Result<()> {
        let now = self.now();
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE tasks SET verification_status = ?2, verification_notes = ?3, updated_at = ?4 \
             WHERE id = ?1",
            params![task_id, status.as_str(), notes, now],
        )?;
        Ok(())
    }

    /// Cancel every task of a project that has not started running.
    pub async fn cancel_unstarted_tasks(&self, project_id: &str) -> Result<usize> {
        let now = self.now();
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE tasks SET status = 'cancelled', updated_at = ?2 \
             WHERE project_id = ?1 AND status IN ('pending', 'blocked', 'queued')",
            params![project_id, now],
        )?;
        Ok(n)
    }

    /// RUNNING/QUEUED → CANCELLED, if the task has not already reached a
    /// terminal state. Returns whether a transition happened.
    pub async fn cancel_task_if_active(&self, task_id: &str) -> Result<bool> {
        let now = self.now();
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE tasks SET status = 'cancelled', updated_at = ?2 \
             WHERE id = ?1 AND status IN ('running', 'queued', 'pending', 'blocked')",
            params![task_id, now],
        )?;
        Ok(n == 1)
    }

    /// Apply pre-execution edits. Fields left as None are untouched.
    pub async fn update_task_fields(
        &self,
        task_id: &str,
        title: Option<&str>,
        description: Option<&str>,
        model_tier: Option<ModelTier>,
        priority: Option<i64>,
        max_retries: Option<u32>,
    ) -> Result<()> {
        let mut sets = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(v) = title {
            sets.push("title");
            values.push(v.to_string().into());
        }
        if let Some(v) = description {
            sets.push("description");
            values.push(v.to_string().into());
        }
        if let Some(v) = model_tier {
            sets.push("model_tier");
            values.push(v.as_str().to_string().into());
        }
        if let Some(v) = priority {
            sets.push("priority");
            values.push(v.into());
        }
        if let Some(v) = max_retries {
            sets.push("max_retries");
            values.push((v as i64).into());
        }
        if sets.is_empty() {
            return Err(OrchestrationError::Validation("no fields to update".into()));
        }
        let assignments = sets
            .iter()
            .enumerate()
            .map(|(i, col)| format!("{col} = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        values.push(self.now().into());
        values.push(task_id.to_string().into());
        let sql = format!(
            "UPDATE tasks SET {assignments}, updated_at = ?{} WHERE id = ?{}",
            sets.len() + 1,
            sets.len() + 2
        );
        let conn = self.conn.lock().await;
        conn.execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(())
    }

    /// Per-status task counts for one project.
    pub async fn task_status_counts(&self, project_id: &str) -> Result<HashMap<TaskStatus, i64>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM tasks WHERE project_id = ?1 GROUP BY status")?;
        let mut out = HashMap::new();
        let mapped = stmt.query_map(params![project_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;
        for row in mapped {
            let (status, count) = row?;
            if let Some(status) = TaskStatus::parse(&status) {
                out.insert(status, count);
            }
        }
        Ok(out)
    }

    /// COMPLETED dependency outputs for a task, newest completion first.
    pub async fn dependency_outputs(&self, task_id: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT dep.title, COALESCE(dep.output_text, '') FROM task_deps d \
             JOIN tasks dep ON dep.id = d.depends_on \
             WHERE d.task_id = ?1 AND dep.status = 'completed' \
             ORDER BY dep.completed_at DESC",
        )?;
        let out = stmt
            .query_map(params![task_id], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Usage + budget periods
    // ------------------------------------------------------------------

    /// Committed spend for a budget period key (0 when absent).
    pub async fn period_spend(&self, period_key: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let nanos: Option<i64> = conn
            .query_row(
                "SELECT cost_nanos FROM budget_periods WHERE period_key = ?1",
                params![period_key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(nanos.unwrap_or(0).max(0) as u64)
    }

    /// Total committed spend for a project.
    pub async fn project_spend(&self, project_id: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let nanos: i64 = conn.query_row(
            "SELECT COALESCE(SUM(cost_nanos), 0) FROM usage_log WHERE project_id = ?1",
            params![project_id],
            |r| r.get(0),
        )?;
        Ok(nanos.max(0) as u64)
    }

    /// Aggregate usage, optionally scoped to one project.
    pub async fn usage_summary(&self, project_id: Option<&str>) -> Result<UsageSummary> {
        let conn = self.conn.lock().await;
        let (clause, args): (&str, Vec<String>) = match project_id {
            Some(id) => ("WHERE project_id = ?1", vec![id.to_string()]),
            None => ("", Vec::new()),
        };

        let mut summary = UsageSummary::default();
        let totals_sql = format!(
            "SELECT COALESCE(SUM(cost_nanos), 0), COALESCE(SUM(prompt_tokens), 0), \
             COALESCE(SUM(completion_tokens), 0), COUNT(*) FROM usage_log {clause}"
        );
        let (cost, pt, ct, calls): (i64, i64, i64, i64) = conn.query_row(
            &totals_sql,
            rusqlite::params_from_iter(args.iter()),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )?;
        summary.total_cost_nanos = cost.max(0) as u64;
        summary.total_prompt_tokens = pt.max(0) as u64;
        summary.total_completion_tokens = ct.max(0) as u64;
        summary.api_call_count = calls.max(0) as u64;

        let by_model_sql = format!(
            "SELECT model, SUM(cost_nanos), SUM(prompt_tokens), SUM(completion_tokens), COUNT(*) \
             FROM usage_log {clause} GROUP BY model"
        );
        let mut stmt = conn.prepare(&by_model_sql)?;
        let mapped = stmt.query_map(rusqlite::params_from_iter(args.iter()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)?,
            ))
        })?;
        for row in mapped {
            let (model, cost, pt, ct, calls) = row?;
            summary.by_model.insert(
                model,
                ModelUsage {
                    cost_nanos: cost.max(0) as u64,
                    prompt_tokens: pt.max(0) as u64,
                    completion_tokens: ct.max(0) as u64,
                    calls: calls.max(0) as u64,
                },
            );
        }

        let by_provider_sql = format!(
            "SELECT provider, SUM(cost_nanos), COUNT(*) FROM usage_log {clause} GROUP BY provider"
        );
        let mut stmt = conn.prepare(&by_provider_sql)?;
        let mapped = stmt.query_map(rusqlite::params_from_iter(args.iter()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
            ))
        })?;
        for row in mapped {
            let (provider, cost, calls) = row?;
            summary.by_provider.insert(
                provider,
                ProviderUsage {
                    cost_nanos: cost.max(0) as u64,
                    calls: calls.max(0) as u64,
                },
            );
        }
        Ok(summary)
    }

    /// Usage rows for one task (oldest first).
    pub async fn usage_for_task(&self, task_id: &str) -> Result<Vec<UsageRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM usage_log WHERE task_id = ?1 ORDER BY id ASC")?;
        let out = stmt
            .query_map(params![task_id], rows::usage_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Persist a progress event and return the stored row.
    pub async fn insert_event(
        &self,
        project_id: &str,
        task_id: Option<&str>,
        kind: EventKind,
        message: &str,
        extras: &Value,
    ) -> Result<EventRecord> {
        let now = self.clock.now();
        let conn = self.conn.lock().await;
        let id = rows::insert_event(
            &conn,
            project_id,
            task_id,
            kind,
            message,
            extras,
            &now.to_rfc3339(),
        )?;
        Ok(EventRecord {
            id,
            project_id: project_id.to_string(),
            task_id: task_id.map(str::to_string),
            kind,
            message: message.to_string(),
            extras: extras.clone(),
            timestamp: now,
        })
    }

    /// Persisted events for a project (production order), optionally scoped
    /// to a task, newest `limit` entries.
    pub async fn recent_events(
        &self,
        project_id: &str,
        task_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock().await;
        let mut out = match task_id {
            Some(task_id) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM task_events WHERE project_id = ?1 AND task_id = ?2 \
                     ORDER BY id DESC LIMIT ?3",
                )?;
                let result = stmt
                    .query_map(params![project_id, task_id, limit as i64], rows::event_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                result
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM task_events WHERE project_id = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let result = stmt
                    .query_map(params![project_id, limit as i64], rows::event_from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                result
            }
        };
        out.reverse();
        Ok(out)
    }

    /// Retry/failure history for a task, used to assemble checkpoint context.
    pub async fn attempt_history(&self, task_id: &str) -> Result<Value> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT message, timestamp FROM task_events \
             WHERE task_id = ?1 AND event_type IN ('task_retry', 'task_failed') ORDER BY id ASC",
        )?;
        let attempts = stmt
            .query_map(params![task_id], |r| {
                Ok(serde_json::json!({
                    "message": r.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    "timestamp": r.get::<_, String>(1)?,
                }))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(Value::Array(attempts))
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    pub async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO checkpoints (id, project_id, task_id, checkpoint_type, summary, \
             attempts_json, question, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                checkpoint.id,
                checkpoint.project_id,
                checkpoint.task_id,
                checkpoint.checkpoint_type,
                checkpoint.summary,
                checkpoint.attempts.to_string(),
                checkpoint.question,
                checkpoint.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.conn.lock().await;
        let out = conn
            .query_row(
                "SELECT * FROM checkpoints WHERE id = ?1",
                params![id],
                rows::checkpoint_from_row,
            )
            .optional()?;
        Ok(out)
    }

    pub async fn list_checkpoints(
        &self,
        project_id: &str,
        include_resolved: bool,
    ) -> Result<Vec<Checkpoint>> {
        let conn = self.conn.lock().await;
        let sql = if include_resolved {
            "SELECT * FROM checkpoints WHERE project_id = ?1 ORDER BY created_at DESC"
        } else {
            "SELECT * FROM checkpoints WHERE project_id = ?1 AND resolved_at IS NULL \
             ORDER BY created_at DESC"
        };
        let mut stmt = conn.prepare(sql)?;
        let out = stmt
            .query_map(params![project_id], rows::checkpoint_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(out)
    }

    pub async fn mark_checkpoint_resolved(&self, id: &str, response: &str) -> Result<()> {
        let now = self.now();
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE checkpoints SET response = ?2, resolved_at = ?3 WHERE id = ?1",
            params![id, response, now],
        )?;
        Ok(())
    }
}

/// Row-level helpers shared between standalone calls and transactions.
pub(crate) mod rows {
    use super::*;

    fn ts(raw: String) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&raw)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })
    }

    fn ts_opt(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
        raw.map(ts).transpose()
    }

    fn status_err(what: &str, raw: &str) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown {what}: {raw}").into(),
        )
    }

    pub(crate) fn project_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Project> {
        let status: String = row.get("status")?;
        Ok(Project {
            id: row.get("id")?,
            name: row.get("name")?,
            requirements: row.get("requirements")?,
            status: ProjectStatus::parse(&status)
                .ok_or_else(|| status_err("project status", &status))?,
            created_at: ts(row.get("created_at")?)?,
            updated_at: ts(row.get("updated_at")?)?,
            completed_at: ts_opt(row.get("completed_at")?)?,
        })
    }

    pub(crate) fn get_project(conn: &Connection, id: &str) -> rusqlite::Result<Option<Project>> {
        conn.query_row(
            "SELECT * FROM projects WHERE id = ?1",
            params![id],
            project_from_row,
        )
        .optional()
    }

    pub(crate) fn plan_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Plan> {
        let status: String = row.get("status")?;
        let payload: String = row.get("plan_json")?;
        Ok(Plan {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            version: row.get("version")?,
            model_used: row.get("model_used")?,
            prompt_tokens: row.get::<_, i64>("prompt_tokens")?.max(0) as u64,
            completion_tokens: row.get::<_, i64>("completion_tokens")?.max(0) as u64,
            cost_nanos: row.get::<_, i64>("cost_nanos")?.max(0) as u64,
            payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            status: PlanStatus::parse(&status).ok_or_else(|| status_err("plan status", &status))?,
            created_at: ts(row.get("created_at")?)?,
        })
    }

    pub(crate) fn get_plan(conn: &Connection, id: &str) -> rusqlite::Result<Option<Plan>> {
        conn.query_row("SELECT * FROM plans WHERE id = ?1", params![id], plan_from_row)
            .optional()
    }

    pub(crate) fn insert_plan(conn: &Connection, plan: &Plan) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO plans (id, project_id, version, model_used, prompt_tokens, \
             completion_tokens, cost_nanos, plan_json, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                plan.id,
                plan.project_id,
                plan.version,
                plan.model_used,
                plan.prompt_tokens as i64,
                plan.completion_tokens as i64,
                plan.cost_nanos as i64,
                plan.payload.to_string(),
                plan.status.as_str(),
                plan.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub(crate) fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
        let status: String = row.get("status")?;
        let task_type: String = row.get("task_type")?;
        let tier: String = row.get("model_tier")?;
        let context: String = row.get("context_json")?;
        let tools: String = row.get("tools_json")?;
        let verification: Option<String> = row.get("verification_status")?;
        Ok(Task {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            plan_id: row.get("plan_id")?,
            title: row.get("title")?,
            description: row.get("description")?,
            task_type: TaskType::parse_lossy(&task_type),
            priority: row.get("priority")?,
            status: TaskStatus::parse(&status).ok_or_else(|| status_err("task status", &status))?,
            model_tier: ModelTier::parse(&tier).ok_or_else(|| status_err("model tier", &tier))?,
            model_used: row.get("model_used")?,
            context: serde_json::from_str(&context).unwrap_or_default(),
            tools: serde_json::from_str(&tools).unwrap_or_default(),
            system_prompt: row.get("system_prompt")?,
            output_text: row.get("output_text")?,
            prompt_tokens: row.get::<_, i64>("prompt_tokens")?.max(0) as u64,
            completion_tokens: row.get::<_, i64>("completion_tokens")?.max(0) as u64,
            cost_nanos: row.get::<_, i64>("cost_nanos")?.max(0) as u64,
            max_tokens: row.get::<_, i64>("max_tokens")?.max(0) as u32,
            retry_count: row.get::<_, i64>("retry_count")?.max(0) as u32,
            max_retries: row.get::<_, i64>("max_retries")?.max(0) as u32,
            wave: row.get("wave")?,
            verification_status: verification.as_deref().and_then(VerificationStatus::parse),
            verification_notes: row.get("verification_notes")?,
            error: row.get("error")?,
            depends_on: Vec::new(),
            started_at: ts_opt(row.get("started_at")?)?,
            completed_at: ts_opt(row.get("completed_at")?)?,
            created_at: ts(row.get("created_at")?)?,
            updated_at: ts(row.get("updated_at")?)?,
        })
    }

    pub(crate) fn insert_task(conn: &Connection, task: &Task) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO tasks (id, project_id, plan_id, title, description, task_type, \
             priority, status, model_tier, context_json, tools_json, system_prompt, max_tokens, \
             retry_count, max_retries, wave, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                task.id,
                task.project_id,
                task.plan_id,
                task.title,
                task.description,
                task.task_type.as_str(),
                task.priority,
                task.status.as_str(),
                task.model_tier.as_str(),
                serde_json::to_string(&task.context).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&task.tools).unwrap_or_else(|_| "[]".into()),
                task.system_prompt,
                task.max_tokens as i64,
                task.retry_count as i64,
                task.max_retries as i64,
                task.wave,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub(crate) fn insert_dep(
        conn: &Connection,
        task_id: &str,
        depends_on: &str,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO task_deps (task_id, depends_on) VALUES (?1, ?2)",
            params![task_id, depends_on],
        )?;
        Ok(())
    }

    pub(crate) fn task_deps(conn: &Connection, task_id: &str) -> rusqlite::Result<Vec<String>> {
        let mut stmt = conn.prepare("SELECT depends_on FROM task_deps WHERE task_id = ?1")?;
        let result = stmt.query_map(params![task_id], |r| r.get(0))?.collect();
        result
    }

    pub(crate) fn project_deps(
        conn: &Connection,
        project_id: &str,
    ) -> rusqlite::Result<HashMap<String, Vec<String>>> {
        let mut stmt = conn.prepare(
            "SELECT d.task_id, d.depends_on FROM task_deps d \
             JOIN tasks t ON t.id = d.task_id WHERE t.project_id = ?1",
        )?;
        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        let mapped = stmt.query_map(params![project_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        for row in mapped {
            let (task_id, dep) = row?;
            out.entry(task_id).or_default().push(dep);
        }
        Ok(out)
    }

    pub(crate) fn append_context(
        conn: &Connection,
        task_id: &str,
        kind: &str,
        content: &str,
        now: &str,
    ) -> rusqlite::Result<()> {
        let raw: Option<String> = conn
            .query_row(
                "SELECT context_json FROM tasks WHERE id = ?1",
                params![task_id],
                |r| r.get(0),
            )
            .optional()?;
        let mut context: Vec<ContextEntry> = raw
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        context.push(ContextEntry::new(kind, content));
        conn.execute(
            "UPDATE tasks SET context_json = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                task_id,
                serde_json::to_string(&context).unwrap_or_else(|_| "[]".into()),
                now
            ],
        )?;
        Ok(())
    }

    /// Append one usage row. Part of the budget recording transaction.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn insert_usage(
        conn: &Connection,
        project_id: Option<&str>,
        task_id: Option<&str>,
        provider: &str,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost_nanos: u64,
        purpose: &str,
        now: &str,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO usage_log (project_id, task_id, provider, model, prompt_tokens, \
             completion_tokens, cost_nanos, purpose, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                project_id,
                task_id,
                provider,
                model,
                prompt_tokens as i64,
                completion_tokens as i64,
                cost_nanos as i64,
                purpose,
                now
            ],
        )?;
        Ok(())
    }

    /// Upsert one budget period aggregate. Part of the recording transaction.
    pub(crate) fn upsert_period(
        conn: &Connection,
        period_key: &str,
        period_type: &str,
        cost_nanos: u64,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO budget_periods (period_key, period_type, cost_nanos, prompt_tokens, \
             completion_tokens, api_call_count) VALUES (?1, ?2, ?3, ?4, ?5, 1) \
             ON CONFLICT(period_key) DO UPDATE SET \
             cost_nanos = cost_nanos + excluded.cost_nanos, \
             prompt_tokens = prompt_tokens + excluded.prompt_tokens, \
             completion_tokens = completion_tokens + excluded.completion_tokens, \
             api_call_count = api_call_count + 1",
            params![
                period_key,
                period_type,
                cost_nanos as i64,
                prompt_tokens as i64,
                completion_tokens as i64
            ],
        )?;
        Ok(())
    }

    pub(crate) fn insert_event(
        conn: &Connection,
        project_id: &str,
        task_id: Option<&str>,
        kind: EventKind,
        message: &str,
        extras: &Value,
        now: &str,
    ) -> rusqlite::Result<i64> {
        conn.execute(
            "INSERT INTO task_events (project_id, task_id, event_type, message, data_json, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![project_id, task_id, kind.as_str(), message, extras.to_string(), now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub(crate) fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
        let kind: String = row.get("event_type")?;
        let extras: Option<String> = row.get("data_json")?;
        Ok(EventRecord {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            task_id: row.get("task_id")?,
            kind: EventKind::parse(&kind).ok_or_else(|| status_err("event type", &kind))?,
            message: row.get::<_, Option<String>>("message")?.unwrap_or_default(),
            extras: extras
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or_else(|| Value::Object(Default::default())),
            timestamp: ts(row.get("timestamp")?)?,
        })
    }

    pub(crate) fn usage_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UsageRecord> {
        Ok(UsageRecord {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            task_id: row.get("task_id")?,
            provider: row.get("provider")?,
            model: row.get("model")?,
            prompt_tokens: row.get::<_, i64>("prompt_tokens")?.max(0) as u64,
            completion_tokens: row.get::<_, i64>("completion_tokens")?.max(0) as u64,
            cost_nanos: row.get::<_, i64>("cost_nanos")?.max(0) as u64,
            purpose: row.get("purpose")?,
            timestamp: ts(row.get("timestamp")?)?,
        })
    }

    pub(crate) fn checkpoint_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Checkpoint> {
        let attempts: Option<String> = row.get("attempts_json")?;
        Ok(Checkpoint {
            id: row.get("id")?,
            project_id: row.get("project_id")?,
            task_id: row.get("task_id")?,
            checkpoint_type: row.get("checkpoint_type")?,
            summary: row.get("summary")?,
            attempts: attempts
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or(Value::Array(Vec::new())),
            question: row.get("question")?,
            response: row.get("response")?,
            resolved_at: ts_opt(row.get("resolved_at")?)?,
            created_at: ts(row.get("created_at")?)?,
        })
    }
}
