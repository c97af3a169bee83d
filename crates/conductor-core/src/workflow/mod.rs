//! Workflow engine: plan execution across specialist workers.
//!
//! A plan arrives from the planning collaborator, is copied into a step queue
//! and driven to a result. Worker outputs may declare follow-up needs that
//! become new steps within a bounded step budget.
//!
//! # Architecture
//!
//! ```text
//! plan.yaml ──► Plan ──► WorkflowExecutor ──► StepDispatcher ──► LocalWorker / HTTP worker
//!                             │    ▲                                     │
//!          CapabilityRegistry ┘    │                                  output
//!                                  │                                     │
//!                    ReplanCoordinator ◄── open needs ◄── NeedsParser ◄──┘
//!                                  │
//!                        PlanningCollaborator (HTTP)
//! ```
//!
//! Every transition is written to the [`AuditLog`](crate::audit::AuditLog);
//! paused workflows are persisted through [`WorkflowStore`](crate::store::WorkflowStore).

pub mod capability;
pub mod dispatcher;
pub mod executor;
pub mod local;
pub mod needs;
pub mod replan;
pub mod schema;
pub mod state;
pub mod worker;

pub use capability::{CapabilityMatch, CapabilityRegistry};
pub use dispatcher::{
    ContextPacket, DispatchConfig, DispatchReport, FnWorker, LocalWorker, PriorResult,
    RetryPolicy, StepDispatcher, TransportError, TransportErrorKind,
};
pub use executor::{
    CancellationFlag, EngineSettings, FailureKind, FailureSummary, RunContext, WorkflowExecutor,
    WorkflowResult,
};
pub use local::CommandWorker;
pub use needs::{
    ClarificationClassifier, Need, NeedStatus, NeedsFormat, NeedsParser, ParsedNeeds,
    PhraseClassifier,
};
pub use replan::{
    HttpPlanningCollaborator, PlanningCollaborator, PlanningError, ReplanCoordinator,
    ReplanRequest, ReplanResponse,
};
pub use schema::{Plan, PlanError, PlannedStep, Step, StepOrigin, StepStatus};
pub use state::{WorkflowPhase, WorkflowState};
pub use worker::{WorkerCatalog, WorkerDescriptor, WorkerTransport};
