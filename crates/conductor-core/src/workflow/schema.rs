//! Plan schema and step types.
//!
//! A plan arrives from the planning collaborator as JSON or YAML:
//!
//! ```yaml
//! raw_plan: "Collect SNS chatter, then verify with web sources."
//! routing_hint:
//!   selected_workers: ["Worker_SNS", "Worker_Web"]
//!   keywords: ["ai", "trends"]
//!   reason: "social + web evidence"
//! collaboration_plan:
//!   notes: "SNS first"
//!   steps:
//!     - agent: "Worker_SNS"
//!       goal: "summarize AI posts"
//!       deliverable: "top 5 posts with links"
//!       tool_hints: ["sns.search"]
//! ```
//!
//! The executor never mutates a `Plan`; it copies the planned steps into a
//! queue of [`Step`]s with engine-assigned ids.

use serde::{Deserialize, Serialize};

/// Deliverable used for steps synthesized from a need.
pub const NEED_STEP_DELIVERABLE: &str = "response to request";
/// Goal of the steps built from the routing hint when a plan has no steps.
pub const ROUTED_STEP_GOAL: &str =
    "Handle your part of the user request and provide handoff-ready output.";
pub const ROUTED_STEP_DELIVERABLE: &str = "Concise result with key facts for the next step.";

/// Top-level plan handed to the executor.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Plan {
    /// Free-form rationale from the planner
    #[serde(default)]
    pub raw_plan: String,

    #[serde(default)]
    pub routing_hint: RoutingHint,

    #[serde(default)]
    pub collaboration_plan: CollaborationPlan,
}

/// Routing summary produced alongside the plan.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoutingHint {
    #[serde(default)]
    pub selected_workers: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub reason: String,
}

/// Ordered steps plus planner notes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CollaborationPlan {
    #[serde(default)]
    pub steps: Vec<PlannedStep>,
    #[serde(default)]
    pub notes: String,
}

/// A step as the planner describes it (wire form).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedStep {
    /// Worker expected to perform the step
    pub agent: String,
    pub goal: String,
    #[serde(default)]
    pub deliverable: String,
    #[serde(default)]
    pub tool_hints: Vec<String>,
}

impl PlannedStep {
    pub fn new(agent: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            goal: goal.into(),
            deliverable: String::new(),
            tool_hints: Vec::new(),
        }
    }

    pub fn with_deliverable(mut self, deliverable: impl Into<String>) -> Self {
        self.deliverable = deliverable.into();
        self
    }

    pub fn with_tool_hints<I, S>(mut self, hints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_hints = hints.into_iter().map(Into::into).collect();
        self
    }
}

impl Plan {
    /// Build a plan directly from planned steps.
    pub fn from_steps(raw_plan: impl Into<String>, steps: Vec<PlannedStep>) -> Self {
        Self {
            raw_plan: raw_plan.into(),
            routing_hint: RoutingHint::default(),
            collaboration_plan: CollaborationPlan {
                steps,
                notes: String::new(),
            },
        }
    }

    /// Parse a plan from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, PlanError> {
        serde_json::from_str(json).map_err(|e| PlanError::Parse(format!("JSON: {}", e)))
    }

    /// Parse a plan from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, PlanError> {
        serde_yaml::from_str(yaml).map_err(|e| PlanError::Parse(format!("YAML: {}", e)))
    }

    /// Load a plan from a file; `.json` files are parsed as JSON, everything else as YAML.
    pub fn from_file(path: &str) -> Result<Self, PlanError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PlanError::Io(format!("Failed to read plan file '{}': {}", path, e)))?;
        if path.ends_with(".json") {
            Self::from_json(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    pub fn steps(&self) -> &[PlannedStep] {
        &self.collaboration_plan.steps
    }
}

/// Execution status of a step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
    /// Reassigned to a capability owner; still waiting to run
    Rerouted,
}

/// Where a step came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOrigin {
    /// Part of the accepted plan
    Plan,
    /// Synthesized to answer an open need
    Need,
    /// Substitute proposed after a failed step
    Recovery,
}

/// One unit of work in the step queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    /// Unique within the workflow, assigned in increasing order
    pub id: u64,
    pub assigned_worker: String,
    /// Worker named by the plan before a capability reroute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_worker: Option<String>,
    pub goal: String,
    pub deliverable: String,
    #[serde(default)]
    pub tool_hints: Vec<String>,
    pub status: StepStatus,
    pub origin: StepOrigin,
    /// Key of the need this step answers (need-driven steps only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answers_need: Option<String>,
}

impl Step {
    pub fn from_planned(id: u64, planned: &PlannedStep, origin: StepOrigin) -> Self {
        let mut tool_hints: Vec<String> = Vec::new();
        for hint in &planned.tool_hints {
            let hint = hint.trim();
            if !hint.is_empty() && !tool_hints.iter().any(|h| h == hint) {
                tool_hints.push(hint.to_string());
            }
        }
        Self {
            id,
            assigned_worker: planned.agent.trim().to_string(),
            original_worker: None,
            goal: planned.goal.trim().to_string(),
            deliverable: planned.deliverable.trim().to_string(),
            tool_hints,
            status: StepStatus::Pending,
            origin,
            answers_need: None,
        }
    }

    /// Whether this step occupies a reserved slot of the step budget.
    pub fn is_synthesized(&self) -> bool {
        self.origin != StepOrigin::Plan
    }

    pub fn summary(&self) -> StepSummary {
        StepSummary {
            id: self.id,
            worker: self.assigned_worker.clone(),
            goal: self.goal.clone(),
            deliverable: self.deliverable.clone(),
            tool_hints: self.tool_hints.clone(),
        }
    }
}

/// Compact view of a step shared with workers and the planning collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSummary {
    pub id: u64,
    pub worker: String,
    pub goal: String,
    pub deliverable: String,
    #[serde(default)]
    pub tool_hints: Vec<String>,
}

/// Error type for plan loading.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("Failed to read plan: {0}")]
    Io(String),
    #[error("Failed to parse plan: {0}")]
    Parse(String),
}
