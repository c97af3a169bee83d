//! ReplanCoordinator: turns open needs into new steps.
//!
//! The planning collaborator is asked first, a bounded number of times. If it
//! is absent, fails, or proposes nothing usable, a deterministic fallback
//! creates one step per unanswered need. Every proposal is capped by the
//! remaining step budget.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::dispatcher::PriorResult;
use super::needs::Need;
use super::schema::{PlannedStep, Step, StepOrigin, StepSummary, NEED_STEP_DELIVERABLE};
use super::worker::{WorkerCard, WorkerCatalog};
use crate::audit::{AuditLevel, AuditLog, Direction};

const COMPONENT: &str = "replan_coordinator";

/// Tool hints copied from the target worker onto a fallback step.
pub const FALLBACK_TOOL_HINTS: usize = 4;

/// Step budget as seen at the moment of replanning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepBudget {
    pub limit: usize,
    pub executed: usize,
    /// Synthesized steps still waiting in the queue
    pub reserved: usize,
}

impl StepBudget {
    pub fn remaining(&self) -> usize {
        self.limit
            .saturating_sub(self.executed.saturating_add(self.reserved))
    }
}

/// What the collaborator is told when asked to replan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanRequest {
    pub workflow_id: String,
    pub user_request: String,
    #[serde(default)]
    pub conversation_history: String,
    #[serde(default)]
    pub raw_plan: String,
    pub coordinator: String,
    #[serde(default)]
    pub latest_step: Option<StepSummary>,
    #[serde(default)]
    pub latest_output: Option<String>,
    /// Set when asking for a substitute after a failed step
    #[serde(default)]
    pub latest_error: Option<String>,
    pub prior_results: Vec<PriorResult>,
    pub open_needs: Vec<Need>,
    pub pending_steps: Vec<StepSummary>,
    pub workers: Vec<WorkerCard>,
    pub budget: StepBudget,
}

/// The collaborator's answer: steps to insert ahead of the pending ones.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplanResponse {
    #[serde(default)]
    pub should_update_plan: bool,
    #[serde(default)]
    pub updated_steps: Vec<PlannedStep>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    #[error("planning collaborator unreachable: {0}")]
    Transport(String),
    #[error("planning collaborator returned an unusable answer: {0}")]
    Parse(String),
}

/// External planner consulted during replanning.
#[async_trait]
pub trait PlanningCollaborator: Send + Sync {
    async fn review(&self, request: &ReplanRequest) -> Result<ReplanResponse, PlanningError>;
}

/// Planning collaborator reached over HTTP (`POST {endpoint}` with the request as JSON).
pub struct HttpPlanningCollaborator {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpPlanningCollaborator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }
}

#[async_trait]
impl PlanningCollaborator for HttpPlanningCollaborator {
    async fn review(&self, request: &ReplanRequest) -> Result<ReplanResponse, PlanningError> {
        tracing::info!(
            "[HttpPlanningCollaborator] POST {} ({} open needs)",
            self.endpoint,
            request.open_needs.len()
        );
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| PlanningError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| PlanningError::Transport(format!("Failed to read response body: {}", e)))?;
        if !status.is_success() {
            return Err(PlanningError::Transport(format!(
                "planner returned {}: {}",
                status, text
            )));
        }
        parse_review_body(&text)
    }
}

/// Accepts the response object directly, or wrapped as a JSON string in
/// `output`/`text`/`content`.
pub fn parse_review_body(body: &str) -> Result<ReplanResponse, PlanningError> {
    let value: serde_json::Value =
        serde_json::from_str(body.trim()).map_err(|e| PlanningError::Parse(e.to_string()))?;

    let wrapped = ["output", "text", "content"]
        .iter()
        .find_map(|f| value.get(*f).and_then(|v| v.as_str()));
    if let Some(inner) = wrapped {
        let start = inner.find('{');
        let end = inner.rfind('}');
        return match (start, end) {
            (Some(s), Some(e)) if e > s => serde_json::from_str(&inner[s..=e])
                .map_err(|e| PlanningError::Parse(e.to_string())),
            _ => Err(PlanningError::Parse("no JSON object in wrapped answer".to_string())),
        };
    }
    serde_json::from_value(value).map_err(|e| PlanningError::Parse(e.to_string()))
}

/// Where proposed steps came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplanSource {
    Collaborator,
    Fallback,
    /// Nothing proposed
    None,
}

/// A step the executor should queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedStep {
    pub planned: PlannedStep,
    pub origin: StepOrigin,
    /// Key of the need this step answers
    pub answers_need: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplanOutcome {
    pub steps: Vec<ProposedStep>,
    pub source: ReplanSource,
    pub anomalies: Vec<String>,
}

impl ReplanOutcome {
    fn none(anomalies: Vec<String>) -> Self {
        Self {
            steps: Vec::new(),
            source: ReplanSource::None,
            anomalies,
        }
    }
}

pub struct ReplanCoordinator {
    collaborator: Option<Arc<dyn PlanningCollaborator>>,
    attempts: u32,
    fallback_step_limit: usize,
    coordinator_name: String,
    audit: Option<AuditLog>,
}

impl ReplanCoordinator {
    pub fn new(coordinator_name: impl Into<String>) -> Self {
        Self {
            collaborator: None,
            attempts: 2,
            fallback_step_limit: 3,
            coordinator_name: coordinator_name.into(),
            audit: None,
        }
    }

    pub fn with_collaborator(mut self, collaborator: Arc<dyn PlanningCollaborator>) -> Self {
        self.collaborator = Some(collaborator);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_fallback_step_limit(mut self, limit: usize) -> Self {
        self.fallback_step_limit = limit;
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn has_collaborator(&self) -> bool {
        self.collaborator.is_some()
    }

    /// New steps for the open needs, never more than the budget allows.
    pub async fn reconcile(
        &self,
        request: &ReplanRequest,
        pending: &[Step],
        catalog: &WorkerCatalog,
    ) -> ReplanOutcome {
        let room = request.budget.remaining();
        if room == 0 {
            return ReplanOutcome::none(vec!["step budget exhausted".to_string()]);
        }

        let mut anomalies = Vec::new();
        if let Some(response) = self.ask_collaborator(request, &mut anomalies).await {
            let steps = self.accept_proposals(
                response.updated_steps,
                StepOrigin::Need,
                request,
                pending,
                catalog,
                room,
                &mut anomalies,
            );
            if !steps.is_empty() {
                return ReplanOutcome {
                    steps,
                    source: ReplanSource::Collaborator,
                    anomalies,
                };
            }
        }

        let steps = self.fallback_steps(request, pending, catalog, room, &mut anomalies);
        if steps.is_empty() {
            return ReplanOutcome::none(anomalies);
        }
        tracing::info!(
            "[ReplanCoordinator] Fallback synthesized {} step(s) for workflow {}",
            steps.len(),
            request.workflow_id
        );
        ReplanOutcome {
            steps,
            source: ReplanSource::Fallback,
            anomalies,
        }
    }

    /// Ask the collaborator for a substitute after a step failed for good.
    /// There is no deterministic fallback for recovery.
    pub async fn recover(
        &self,
        request: &ReplanRequest,
        pending: &[Step],
        catalog: &WorkerCatalog,
    ) -> ReplanOutcome {
        let room = request.budget.remaining().min(1);
        if room == 0 || self.collaborator.is_none() {
            return ReplanOutcome::none(Vec::new());
        }

        let mut anomalies = Vec::new();
        let Some(response) = self.ask_collaborator(request, &mut anomalies).await else {
            return ReplanOutcome::none(anomalies);
        };
        let steps = self.accept_proposals(
            response.updated_steps,
            StepOrigin::Recovery,
            request,
            pending,
            catalog,
            room,
            &mut anomalies,
        );
        if steps.is_empty() {
            return ReplanOutcome::none(anomalies);
        }
        ReplanOutcome {
            steps,
            source: ReplanSource::Collaborator,
            anomalies,
        }
    }

    async fn ask_collaborator(
        &self,
        request: &ReplanRequest,
        anomalies: &mut Vec<String>,
    ) -> Option<ReplanResponse> {
        let collaborator = self.collaborator.as_ref()?;

        for attempt in 1..=self.attempts {
            self.audit(
                AuditLevel::Info,
                "collaborator_request",
                Direction::Outbound,
                json!({
                    "workflow_id": request.workflow_id,
                    "attempt": attempt,
                    "open_needs": request.open_needs.len(),
                    "pending_steps": request.pending_steps.len(),
                    "budget_remaining": request.budget.remaining(),
                    "recovery": request.latest_error.is_some(),
                }),
            )
            .await;

            match collaborator.review(request).await {
                Ok(response) => {
                    self.audit(
                        AuditLevel::Info,
                        "collaborator_response",
                        Direction::Inbound,
                        json!({
                            "workflow_id": request.workflow_id,
                            "should_update_plan": response.should_update_plan,
                            "steps": response.updated_steps.len(),
                            "reason": response.reason,
                        }),
                    )
                    .await;
                    if response.updated_steps.is_empty() {
                        return None;
                    }
                    return Some(response);
                }
                Err(e) => {
                    tracing::warn!(
                        "[ReplanCoordinator] Collaborator attempt {}/{} failed: {}",
                        attempt,
                        self.attempts,
                        e
                    );
                    anomalies.push(e.to_string());
                    self.audit(
                        AuditLevel::Warn,
                        "collaborator_failed",
                        Direction::Inbound,
                        json!({
                            "workflow_id": request.workflow_id,
                            "attempt": attempt,
                            "error": e.to_string(),
                        }),
                    )
                    .await;
                }
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn accept_proposals(
        &self,
        proposals: Vec<PlannedStep>,
        origin: StepOrigin,
        request: &ReplanRequest,
        pending: &[Step],
        catalog: &WorkerCatalog,
        room: usize,
        anomalies: &mut Vec<String>,
    ) -> Vec<ProposedStep> {
        let mut seen: HashSet<String> = pending
            .iter()
            .map(|s| signature(&s.assigned_worker, &s.goal))
            .collect();
        let mut claimed: HashSet<String> = HashSet::new();
        let mut steps = Vec::new();

        for mut planned in proposals {
            if steps.len() >= room {
                anomalies.push("proposal truncated to the remaining step budget".to_string());
                break;
            }
            let Some(worker) = catalog.canonical_name(&planned.agent) else {
                anomalies.push(format!("proposed step names unknown worker '{}'", planned.agent));
                continue;
            };
            planned.agent = worker.to_string();
            if planned.goal.trim().is_empty() {
                anomalies.push(format!("proposed step for '{}' has no goal", worker));
                continue;
            }
            if !seen.insert(signature(&planned.agent, &planned.goal)) {
                continue;
            }

            let answers_need = if origin == StepOrigin::Need {
                request
                    .open_needs
                    .iter()
                    .filter(|n| n.is_open() && n.answered_by.is_none())
                    .find(|n| {
                        n.target_worker.eq_ignore_ascii_case(&planned.agent)
                            && !claimed.contains(&n.key())
                    })
                    .map(|n| n.key())
            } else {
                None
            };
            if let Some(key) = &answers_need {
                claimed.insert(key.clone());
            }

            steps.push(ProposedStep {
                planned,
                origin,
                answers_need,
            });
        }
        steps
    }

    fn fallback_steps(
        &self,
        request: &ReplanRequest,
        pending: &[Step],
        catalog: &WorkerCatalog,
        room: usize,
        anomalies: &mut Vec<String>,
    ) -> Vec<ProposedStep> {
        let limit = self.fallback_step_limit.min(room);
        let mut seen: HashSet<String> = pending
            .iter()
            .map(|s| signature(&s.assigned_worker, &s.goal))
            .collect();
        let mut steps = Vec::new();

        for need in &request.open_needs {
            if steps.len() >= limit {
                break;
            }
            if !need.is_open() || need.answered_by.is_some() {
                continue;
            }
            if need.target_worker.eq_ignore_ascii_case(&self.coordinator_name) {
                continue;
            }
            let Some(worker) = catalog.canonical_name(&need.target_worker) else {
                anomalies.push(format!(
                    "need targets '{}' which has no dispatchable worker",
                    need.target_worker
                ));
                continue;
            };
            if !seen.insert(signature(worker, &need.request_text)) {
                continue;
            }

            let planned = PlannedStep::new(worker, need.request_text.clone())
                .with_deliverable(NEED_STEP_DELIVERABLE)
                .with_tool_hints(catalog.tool_hints_for(worker, FALLBACK_TOOL_HINTS));
            steps.push(ProposedStep {
                planned,
                origin: StepOrigin::Need,
                answers_need: Some(need.key()),
            });
        }
        steps
    }

    async fn audit(
        &self,
        level: AuditLevel,
        action: &str,
        direction: Direction,
        details: serde_json::Value,
    ) {
        if let Some(audit) = &self.audit {
            audit
                .record_safe(level, COMPONENT, action, direction, details)
                .await;
        }
    }
}

fn signature(worker: &str, goal: &str) -> String {
    format!(
        "{}|{}",
        worker.trim().to_lowercase(),
        goal.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
    )
}
