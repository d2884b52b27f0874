//! Library error taxonomy.
//!
//! Internal boundaries return these variants rather than panicking; outer
//! adapters translate them to their own error surface (HTTP layers map
//! `NotFound` to 404, `Conflict` to 409, and so on).

use thiserror::Error;

use crate::provider::ProviderError;

/// Top-level error for orchestration operations.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Malformed input at the API boundary. No state change.
    #[error("validation error: {0}")]
    Validation(String),

    /// Entity lookup miss.
    #[error("{0} not found")]
    NotFound(String),

    /// Ownership violation surfaced by an outer layer.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Attempted illegal state transition (e.g. approving a non-draft plan).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Reservation refused or mid-loop budget stop. Non-fatal.
    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),

    /// The dependency graph contains a cycle after filtering.
    #[error("dependency cycle: {0}")]
    CycleDetected(String),

    /// The planning model's reply did not contain a usable plan.
    #[error("plan parse error: {0}")]
    PlanParse(String),

    /// Provider call failed (carries retry classification).
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Underlying SQLite failure.
    #[error("storage error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Invariant violation or unexpected internal state.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;

impl OrchestrationError {
    /// Whether the error indicates a client mistake rather than a fault in
    /// the orchestrator itself.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            OrchestrationError::Validation(_)
                | OrchestrationError::NotFound(_)
                | OrchestrationError::Forbidden(_)
                | OrchestrationError::Conflict(_)
                | OrchestrationError::PlanParse(_)
                | OrchestrationError::CycleDetected(_)
        )
    }
}
