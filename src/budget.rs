//! Budget manager: pre-flight reservation, post-flight recording.
//!
//! Reservation tracking prevents check-then-spend races: concurrent
//! dispatches call [`BudgetManager::reserve`], which holds one mutex, so
//! only one check+reserve runs at a time. Reservations are approximate by
//! design: a task reserved before midnight but recording after creates a
//! stale daily reservation, bounded by max concurrency times the largest
//! single-task estimate, and self-corrects at the next period-key check.
//! Reservations do not survive a process restart; startup recovery re-derives
//! task state instead.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::config::BudgetLimits;
use crate::error::Result;
use crate::store::{rows, Store, UsageSummary};

/// Spend floor treated as "effectively exhausted" by mid-loop checks
/// ($0.001).
const EPSILON_NANOS: u64 = 1_000_000;

#[derive(Debug, Default)]
struct ReservationState {
    reserved_daily: u64,
    reserved_monthly: u64,
    reserved_per_project: HashMap<String, u64>,
    last_daily_key: String,
    last_monthly_key: String,
}

/// Spending vs. limits snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub daily_spent_nanos: u64,
    pub daily_limit_nanos: u64,
    pub daily_pct: f64,
    pub monthly_spent_nanos: u64,
    pub monthly_limit_nanos: u64,
    pub monthly_pct: f64,
}

/// One billable call to record.
#[derive(Debug, Clone)]
pub struct SpendRecord<'a> {
    pub cost_nanos: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub provider: &'a str,
    pub model: &'a str,
    pub purpose: &'a str,
    pub project_id: Option<&'a str>,
    pub task_id: Option<&'a str>,
}

/// Tracks spending and enforces daily/monthly/per-project limits.
pub struct BudgetManager {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    limits: BudgetLimits,
    state: Mutex<ReservationState>,
}

impl BudgetManager {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>, limits: BudgetLimits) -> Self {
        Self {
            store,
            clock,
            limits,
            state: Mutex::new(ReservationState::default()),
        }
    }

    /// Current daily period key (UTC).
    pub fn daily_key(&self) -> String {
        self.clock.now().format("%Y-%m-%d").to_string()
    }

    /// Current monthly period key (UTC).
    pub fn monthly_key(&self) -> String {
        self.clock.now().format("%Y-%m").to_string()
    }

    fn rollover(&self, state: &mut ReservationState, daily_key: &str, monthly_key: &str) {
        if state.last_daily_key != daily_key {
            state.reserved_daily = 0;
            state.reserved_per_project.clear();
            state.last_daily_key = daily_key.to_string();
        }
        if state.last_monthly_key != monthly_key {
            state.reserved_monthly = 0;
            state.last_monthly_key = monthly_key.to_string();
        }
    }

    /// Atomically check all limits and reserve `estimated` nanodollars for a
    /// project. Returns false when any of daily/monthly/per-project limits
    /// would be exceeded by committed + reserved + estimated.
    pub async fn reserve(&self, estimated: u64, project_id: &str) -> Result<bool> {
        if estimated == 0 {
            return Ok(true);
        }

        let daily_key = self.daily_key();
        let monthly_key = self.monthly_key();
        let mut state = self.state.lock().await;
        self.rollover(&mut state, &daily_key, &monthly_key);

        let daily_spent = self.store.period_spend(&daily_key).await?;
        let monthly_spent = self.store.period_spend(&monthly_key).await?;
        let project_spent = self.store.project_spend(project_id).await?;
        let project_reserved = state
            .reserved_per_project
            .get(project_id)
            .copied()
            .unwrap_or(0);

        let daily_ok =
            daily_spent + state.reserved_daily + estimated <= self.limits.daily_nanos;
        let monthly_ok =
            monthly_spent + state.reserved_monthly + estimated <= self.limits.monthly_nanos;
        let project_ok =
            project_spent + project_reserved + estimated <= self.limits.per_project_nanos;

        if !(daily_ok && monthly_ok && project_ok) {
            return Ok(false);
        }

        state.reserved_daily += estimated;
        state.reserved_monthly += estimated;
        *state
            .reserved_per_project
            .entry(project_id.to_string())
            .or_insert(0) += estimated;
        Ok(true)
    }

    /// Release a previously held reservation (after recording, on failure,
    /// or on cancellation). Clamped at zero.
    pub async fn release(&self, estimated: u64, project_id: &str) {
        if estimated == 0 {
            return;
        }
        let mut state = self.state.lock().await;
        state.reserved_daily = state.reserved_daily.saturating_sub(estimated);
        state.reserved_monthly = state.reserved_monthly.saturating_sub(estimated);
        if let Some(reserved) = state.reserved_per_project.get_mut(project_id) {
            *reserved = reserved.saturating_sub(estimated);
        }
    }

    /// Record one billable call. The usage row and the daily and monthly
    /// period upserts run in a single transaction.
    pub async fn record(&self, spend: SpendRecord<'_>) -> Result<()> {
        let daily_key = self.daily_key();
        let monthly_key = self.monthly_key();
        let now = self.clock.now_string();
        self.store
            .transaction(|conn| {
                rows::insert_usage(
                    conn,
                    spend.project_id,
                    spend.task_id,
                    spend.provider,
                    spend.model,
                    spend.prompt_tokens,
                    spend.completion_tokens,
                    spend.cost_nanos,
                    spend.purpose,
                    &now,
                )?;
                rows::upsert_period(
                    conn,
                    &daily_key,
                    "daily",
                    spend.cost_nanos,
                    spend.prompt_tokens,
                    spend.completion_tokens,
                )?;
                rows::upsert_period(
                    conn,
                    &monthly_key,
                    "monthly",
                    spend.cost_nanos,
                    spend.prompt_tokens,
                    spend.completion_tokens,
                )
            })
            .await
    }

    /// Committed-spend check without reserving. Used by planning and the
    /// mid-loop hard stop.
    pub async fn can_spend(&self, estimated: u64) -> Result<bool> {
        if estimated == 0 {
            return Ok(true);
        }
        let daily_spent = self.store.period_spend(&self.daily_key()).await?;
        let monthly_spent = self.store.period_spend(&self.monthly_key()).await?;
        Ok(daily_spent + estimated <= self.limits.daily_nanos
            && monthly_spent + estimated <= self.limits.monthly_nanos)
    }

    /// Mid-loop check: may the tool loop start another round? False once
    /// committed spend is within epsilon of either period limit.
    pub async fn can_continue(&self) -> Result<bool> {
        self.can_spend(EPSILON_NANOS).await
    }

    /// Current spending vs. limits.
    pub async fn status(&self) -> Result<BudgetStatus> {
        let daily_spent = self.store.period_spend(&self.daily_key()).await?;
        let monthly_spent = self.store.period_spend(&self.monthly_key()).await?;
        let pct = |spent: u64, limit: u64| {
            if limit == 0 {
                0.0
            } else {
                (spent as f64 / limit as f64 * 1000.0).round() / 10.0
            }
        };
        Ok(BudgetStatus {
            daily_spent_nanos: daily_spent,
            daily_limit_nanos: self.limits.daily_nanos,
            daily_pct: pct(daily_spent, self.limits.daily_nanos),
            monthly_spent_nanos: monthly_spent,
            monthly_limit_nanos: self.limits.monthly_nanos,
            monthly_pct: pct(monthly_spent, self.limits.monthly_nanos),
        })
    }

    /// Whether spending has crossed the warning threshold.
    pub async fn is_warning(&self) -> Result<bool> {
        let status = self.status().await?;
        let threshold = self.limits.warn_at_pct as f64;
        Ok(status.daily_pct >= threshold || status.monthly_pct >= threshold)
    }

    /// Aggregate usage statistics, optionally scoped to one project.
    pub async fn usage_summary(&self, project_id: Option<&str>) -> Result<UsageSummary> {
        self.store.usage_summary(project_id).await
    }
}
