//! Conductor Core: workflow execution engine for multi-worker collaboration.
//!
//! A planning collaborator hands the engine a structured plan. The engine
//! dispatches each step to a specialist worker, turns the follow-up needs that
//! workers declare into new steps, enforces capability ownership, pauses for
//! human clarification and keeps a strictly sequenced audit trail.
//!
//! The crate has **no HTTP server dependency**; remote workers are reached
//! through `reqwest`, local workers through the [`workflow::LocalWorker`] trait.
//!
//! # Layout
//!
//! - [`audit`]: sequenced JSONL audit log with archive-on-start rotation
//! - [`workflow`]: plan schema, needs parsing, dispatch, replanning, executor
//! - [`store`]: SQLite persistence for workflow state and conversation turns
//! - [`config`]: YAML configuration with `${ENV}` expansion

pub mod audit;
pub mod config;
pub mod db;
pub mod error;
pub mod store;
pub mod workflow;

// Convenience re-exports
pub use audit::{AuditLog, AuditReader, Direction, LogEvent};
pub use config::ConductorConfig;
pub use db::Database;
pub use error::CoreError;
pub use workflow::{Plan, RunContext, WorkflowExecutor, WorkflowResult};
