//! # taskwave
//!
//! Dependency-aware orchestration core for long-running, model-driven work.
//!
//! A user submits natural-language requirements; the planning model produces
//! a structured plan; the decomposer turns it into a DAG of tasks; the
//! executor dispatches tasks concurrently, respecting dependencies, budget
//! limits, external-service health, and cancellation. Progress streams live
//! to subscribers and persists in the journal.
//!
//! ```text
//!  requirements ──► planner ──► plan (draft)
//!                                 │ approve
//!                                 ▼
//!                            decomposer ──► tasks + dependency edges
//!                                 │
//!                                 ▼
//!  ┌─────────────────────── executor ticks ───────────────────────┐
//!  │ ready tasks → reserve budget → claim → worker → agent loop   │
//!  │     ▲                                             │          │
//!  │     └──────────── retry deadline / backoff ◄──────┘          │
//!  └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The crate is library-style: the HTTP surface, auth, and migrations are
//! external collaborators. [`Orchestrator`] is the composition root and the
//! operation surface they call into.

pub mod agent;
pub mod budget;
pub mod clock;
pub mod config;
pub mod decomposer;
pub mod error;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod planner;
pub mod pricing;
pub mod provider;
pub mod resources;
pub mod router;
pub mod store;
pub mod tools;
pub mod verifier;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{OrchestrationError, Result};
pub use orchestrator::{CheckpointAction, Orchestrator, TaskUpdate};
pub use store::types::{
    Complexity, EventKind, ModelTier, PlanStatus, ProjectStatus, TaskStatus, TaskType,
};
