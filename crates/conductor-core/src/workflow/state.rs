//! WorkflowState: the mutable copy of a plan the executor works on.
//!
//! The whole struct is serialised to JSON when a workflow pauses or finishes,
//! so it can be resumed by id on the next user turn.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::dispatcher::PriorResult;
use super::needs::{Need, NeedStatus};
use super::schema::{Plan, Step, StepOrigin, StepSummary};

/// Lifecycle phase of a workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Planning,
    Running,
    Paused,
    Completed,
    Failed,
}

impl WorkflowPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowPhase::Planning => "planning",
            WorkflowPhase::Running => "running",
            WorkflowPhase::Paused => "paused",
            WorkflowPhase::Completed => "completed",
            WorkflowPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowPhase::Completed | WorkflowPhase::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    #[default]
    None,
    Completed,
    Failed,
}

/// A step that failed after its retries ran out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedStep {
    pub step: StepSummary,
    pub error: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub session_id: String,
    pub user_request: String,
    #[serde(default)]
    pub raw_plan: String,
    pub phase: WorkflowPhase,
    pub step_queue: VecDeque<Step>,
    /// Completion order
    pub prior_results: Vec<PriorResult>,
    pub open_needs: Vec<Need>,
    /// Resolved and expired needs
    #[serde(default)]
    pub closed_needs: Vec<Need>,
    #[serde(default)]
    pub failed_steps: Vec<FailedStep>,
    /// Steps skipped because the budget ran out
    #[serde(default)]
    pub skipped_steps: Vec<StepSummary>,
    pub executed_step_count: usize,
    #[serde(default)]
    pub synthesized_step_count: usize,
    pub budget: usize,
    pub next_step_id: u64,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub pause_reason: Option<String>,
    /// Key of the need the workflow is paused on
    #[serde(default)]
    pub pending_clarification: Option<String>,
    #[serde(default)]
    pub terminal_status: TerminalStatus,
    #[serde(default)]
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    /// Copy the plan into a fresh queue with ids `1..=N`.
    pub fn from_plan(
        workflow_id: impl Into<String>,
        session_id: impl Into<String>,
        user_request: impl Into<String>,
        plan: &Plan,
        budget: usize,
    ) -> Self {
        let step_queue: VecDeque<Step> = plan
            .steps()
            .iter()
            .enumerate()
            .map(|(i, planned)| Step::from_planned(i as u64 + 1, planned, StepOrigin::Plan))
            .collect();
        let now = Utc::now();
        Self {
            workflow_id: workflow_id.into(),
            session_id: session_id.into(),
            user_request: user_request.into(),
            raw_plan: plan.raw_plan.clone(),
            phase: WorkflowPhase::Planning,
            next_step_id: step_queue.len() as u64 + 1,
            step_queue,
            prior_results: Vec::new(),
            open_needs: Vec::new(),
            closed_needs: Vec::new(),
            failed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            executed_step_count: 0,
            synthesized_step_count: 0,
            budget,
            paused: false,
            pause_reason: None,
            pending_clarification: None,
            terminal_status: TerminalStatus::None,
            degraded: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn allocate_step_id(&mut self) -> u64 {
        let id = self.next_step_id;
        self.next_step_id += 1;
        id
    }

    pub fn set_phase(&mut self, phase: WorkflowPhase) {
        self.phase = phase;
        self.paused = phase == WorkflowPhase::Paused;
        self.terminal_status = match phase {
            WorkflowPhase::Completed => TerminalStatus::Completed,
            WorkflowPhase::Failed => TerminalStatus::Failed,
            _ => TerminalStatus::None,
        };
        self.updated_at = Utc::now();
    }

    /// Queued steps that were synthesized (need or recovery); they hold budget.
    pub fn reserved_slots(&self) -> usize {
        self.step_queue.iter().filter(|s| s.is_synthesized()).count()
    }

    /// Whether a plan step may still be dispatched under the budget.
    pub fn has_room_for_plan_step(&self) -> bool {
        self.executed_step_count + self.reserved_slots() < self.budget
    }

    fn is_known_need(&self, key: &str) -> bool {
        self.open_needs
            .iter()
            .chain(self.closed_needs.iter())
            .any(|n| n.key() == key)
    }

    /// Add needs not seen before in this workflow. Returns the ones added.
    pub fn merge_needs(&mut self, needs: Vec<Need>) -> Vec<Need> {
        let mut added = Vec::new();
        for need in needs {
            if self.is_known_need(&need.key()) {
                continue;
            }
            self.open_needs.push(need.clone());
            added.push(need);
        }
        added
    }

    pub fn mark_need_answered(&mut self, key: &str, step_id: u64) {
        if let Some(need) = self.open_needs.iter_mut().find(|n| n.key() == key) {
            need.answered_by = Some(step_id);
        }
    }

    /// Move an open need to the closed list with the given status.
    pub fn close_need(&mut self, key: &str, status: NeedStatus) -> Option<Need> {
        let idx = self.open_needs.iter().position(|n| n.key() == key)?;
        let mut need = self.open_needs.remove(idx);
        need.status = status;
        self.closed_needs.push(need.clone());
        Some(need)
    }

    /// Expire every open need. Returns how many expired.
    pub fn expire_open_needs(&mut self) -> usize {
        let count = self.open_needs.len();
        for mut need in self.open_needs.drain(..) {
            need.status = NeedStatus::Expired;
            self.closed_needs.push(need);
        }
        count
    }

    pub fn expired_needs(&self) -> impl Iterator<Item = &Need> {
        self.closed_needs
            .iter()
            .filter(|n| n.status == NeedStatus::Expired)
    }

    pub fn remaining_summaries(&self) -> Vec<StepSummary> {
        self.step_queue.iter().map(Step::summary).collect()
    }

    /// Structural checks run on state loaded from storage.
    pub fn validate(&self) -> Result<(), String> {
        if self.workflow_id.trim().is_empty() {
            return Err("workflow id is empty".to_string());
        }
        if self.executed_step_count > self.budget {
            return Err(format!(
                "executed step count {} exceeds budget {}",
                self.executed_step_count, self.budget
            ));
        }
        let mut ids: Vec<u64> = self
            .step_queue
            .iter()
            .map(|s| s.id)
            .chain(self.prior_results.iter().map(|r| r.step_id))
            .chain(self.failed_steps.iter().map(|f| f.step.id))
            .collect();
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != total {
            return Err("duplicate step ids".to_string());
        }
        if let Some(max) = ids.last() {
            if *max >= self.next_step_id {
                return Err(format!(
                    "step id {} is not below next id {}",
                    max, self.next_step_id
                ));
            }
        }
        if self.open_needs.iter().any(|n| !n.is_open()) {
            return Err("closed need in the open set".to_string());
        }
        Ok(())
    }
}
