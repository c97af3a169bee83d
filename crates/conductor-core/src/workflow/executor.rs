//! Workflow Executor: drives an accepted plan to a result.
//!
//! The executor:
//! 1. Copies the plan into a step queue and assigns step ids
//! 2. Reroutes each step to the owner of the capability its tool hints name
//! 3. Dispatches the step and parses the needs declared in its output
//! 4. Pauses when a worker asks the coordinator for human clarification
//! 5. Asks the ReplanCoordinator for steps that answer open needs
//! 6. Stops when the queue and the needs are exhausted or the budget runs out
//!
//! Each workflow is driven sequentially. Several workflows may run at once on
//! the same executor; they share only the capability registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::capability::CapabilityRegistry;
use super::dispatcher::{ContextPacket, PriorResult, StepDispatcher};
use super::needs::{ClarificationClassifier, Need, NeedStatus, NeedsParser, PhraseClassifier};
use super::replan::{
    PlanningCollaborator, ProposedStep, ReplanCoordinator, ReplanRequest, StepBudget,
};
use super::schema::{
    Plan, PlannedStep, Step, StepStatus, StepSummary, ROUTED_STEP_DELIVERABLE, ROUTED_STEP_GOAL,
};
use super::state::{FailedStep, WorkflowPhase, WorkflowState};
use super::worker::WorkerCatalog;
use crate::audit::{AuditLevel, AuditLog, Direction};
use crate::config::EngineConfig;
use crate::store::WorkflowStore;

const COMPONENT: &str = "workflow_executor";

/// Worker name recorded for user answers in prior results.
pub const USER_ANSWER_WORKER: &str = "user";

/// Smallest default step budget.
const MIN_BUDGET: usize = 8;
/// Default headroom above the plan length for synthesized steps.
const BUDGET_HEADROOM: usize = 6;

/// Cooperative cancellation, checked before each dispatch.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-run inputs that are not part of the plan.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub session_id: String,
    pub user_request: String,
    pub conversation_history: String,
    pub cancel: CancellationFlag,
}

impl RunContext {
    pub fn new(session_id: impl Into<String>, user_request: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_request: user_request.into(),
            conversation_history: String::new(),
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_history(mut self, history: impl Into<String>) -> Self {
        self.conversation_history = history.into();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Stored state missing, corrupt, or not resumable
    FatalState,
    Cancelled,
}

/// User-facing failure description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureSummary {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowResult {
    Completed {
        workflow_id: String,
        answer: String,
        /// Needs expired, steps failed, or steps skipped for budget
        degraded: bool,
        unresolved_needs: Vec<Need>,
        failed_steps: Vec<FailedStep>,
        skipped_steps: Vec<StepSummary>,
        executed_steps: usize,
    },
    Paused {
        workflow_id: String,
        question: String,
        prior_results: Vec<PriorResult>,
    },
    Failed {
        workflow_id: String,
        error: FailureSummary,
    },
}

impl WorkflowResult {
    pub fn workflow_id(&self) -> &str {
        match self {
            WorkflowResult::Completed { workflow_id, .. }
            | WorkflowResult::Paused { workflow_id, .. }
            | WorkflowResult::Failed { workflow_id, .. } => workflow_id,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, WorkflowResult::Completed { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, WorkflowResult::Paused { .. })
    }
}

/// Engine policy knobs.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_total_steps: Option<usize>,
    pub coordinator_name: String,
    pub replan_attempts: u32,
    pub fallback_step_limit: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_total_steps: config.max_total_steps,
            coordinator_name: config.coordinator_name.clone(),
            replan_attempts: config.replan_attempts,
            fallback_step_limit: config.fallback_step_limit,
        }
    }
}

impl EngineSettings {
    /// Configured budget, or `max(8, plan_len + 6)`.
    pub fn budget_for(&self, plan_len: usize) -> usize {
        self.max_total_steps
            .unwrap_or_else(|| MIN_BUDGET.max(plan_len + BUDGET_HEADROOM))
    }
}

/// The workflow execution engine.
pub struct WorkflowExecutor {
    catalog: Arc<WorkerCatalog>,
    dispatcher: StepDispatcher,
    registry: CapabilityRegistry,
    audit: AuditLog,
    store: WorkflowStore,
    replan: ReplanCoordinator,
    classifier: Arc<dyn ClarificationClassifier>,
    parser: NeedsParser,
    settings: EngineSettings,
}

impl WorkflowExecutor {
    pub fn new(
        catalog: Arc<WorkerCatalog>,
        dispatcher: StepDispatcher,
        registry: CapabilityRegistry,
        audit: AuditLog,
        store: WorkflowStore,
        settings: EngineSettings,
    ) -> Self {
        let mut known_targets = catalog.names();
        if !catalog.contains(&settings.coordinator_name) {
            known_targets.push(settings.coordinator_name.clone());
        }
        let replan = ReplanCoordinator::new(settings.coordinator_name.clone())
            .with_attempts(settings.replan_attempts)
            .with_fallback_step_limit(settings.fallback_step_limit)
            .with_audit(audit.clone());

        Self {
            catalog,
            dispatcher,
            registry,
            audit,
            store,
            replan,
            classifier: Arc::new(PhraseClassifier::default()),
            parser: NeedsParser::new(known_targets),
            settings,
        }
    }

    pub fn with_collaborator(mut self, collaborator: Arc<dyn PlanningCollaborator>) -> Self {
        self.replan = self.replan.with_collaborator(collaborator);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ClarificationClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &WorkerCatalog {
        &self.catalog
    }

    /// Execute a freshly accepted plan.
    ///
    /// A plan without steps falls back to one generic step per routed worker
    /// known to the catalog.
    pub async fn run(&self, plan: &Plan, ctx: &RunContext) -> WorkflowResult {
        let workflow_id = new_workflow_id(&ctx.session_id);
        let routed = self.routed_plan(plan);
        if let Some(routed) = &routed {
            tracing::info!(
                "[WorkflowExecutor] Plan has no steps; routing to {} selected worker(s)",
                routed.steps().len()
            );
            self.record(
                "routing_fallback",
                Direction::Internal,
                json!({
                    "workflow_id": workflow_id,
                    "selected_workers": plan.routing_hint.selected_workers,
                    "workers": routed.steps().iter().map(|s| s.agent.as_str()).collect::<Vec<_>>(),
                }),
            )
            .await;
        }
        let plan = routed.as_ref().unwrap_or(plan);
        let budget = self.settings.budget_for(plan.steps().len());
        let mut state = WorkflowState::from_plan(
            workflow_id.clone(),
            ctx.session_id.clone(),
            ctx.user_request.clone(),
            plan,
            budget,
        );

        tracing::info!(
            "[WorkflowExecutor] Starting workflow {} ({} steps, budget {})",
            workflow_id,
            plan.steps().len(),
            budget
        );
        self.record(
            "plan_accepted",
            Direction::Inbound,
            json!({
                "workflow_id": workflow_id,
                "session_id": ctx.session_id,
                "user_request": ctx.user_request,
                "raw_plan": plan.raw_plan,
                "routing_hint": {
                    "selected_workers": plan.routing_hint.selected_workers,
                    "keywords": plan.routing_hint.keywords,
                    "reason": plan.routing_hint.reason,
                },
                "steps": state.remaining_summaries(),
                "budget": budget,
            }),
        )
        .await;

        state.set_phase(WorkflowPhase::Running);
        self.drive(state, ctx).await
    }

    fn routed_plan(&self, plan: &Plan) -> Option<Plan> {
        if !plan.steps().is_empty() {
            return None;
        }
        let mut workers: Vec<String> = Vec::new();
        for name in &plan.routing_hint.selected_workers {
            if let Some(canonical) = self.catalog.canonical_name(name) {
                if !workers.iter().any(|w| w == canonical) {
                    workers.push(canonical.to_string());
                }
            }
        }
        if workers.is_empty() {
            return None;
        }

        let mut routed = plan.clone();
        routed.collaboration_plan.steps = workers
            .into_iter()
            .map(|worker| {
                PlannedStep::new(worker, ROUTED_STEP_GOAL).with_deliverable(ROUTED_STEP_DELIVERABLE)
            })
            .collect();
        Some(routed)
    }

    /// Continue a paused workflow with the user's answer.
    pub async fn resume(&self, workflow_id: &str, user_answer: &str, ctx: &RunContext) -> WorkflowResult {
        let mut state = match self.load_resumable(workflow_id).await {
            Ok(state) => state,
            Err(message) => {
                tracing::warn!("[WorkflowExecutor] Cannot resume {}: {}", workflow_id, message);
                self.record_level(
                    AuditLevel::Error,
                    "resume_rejected",
                    Direction::Inbound,
                    json!({ "workflow_id": workflow_id, "error": message }),
                )
                .await;
                return WorkflowResult::Failed {
                    workflow_id: workflow_id.to_string(),
                    error: FailureSummary {
                        kind: FailureKind::FatalState,
                        message,
                    },
                };
            }
        };

        let question = state.pause_reason.take().unwrap_or_default();
        if let Some(key) = state.pending_clarification.take() {
            state.close_need(&key, NeedStatus::Resolved);
        }
        let answer_id = state.allocate_step_id();
        state.prior_results.push(PriorResult {
            step_id: answer_id,
            worker: USER_ANSWER_WORKER.to_string(),
            goal: question.clone(),
            output: user_answer.to_string(),
        });
        state.set_phase(WorkflowPhase::Running);

        tracing::info!("[WorkflowExecutor] Resuming workflow {}", workflow_id);
        self.record(
            "user_answer_received",
            Direction::Inbound,
            json!({
                "workflow_id": workflow_id,
                "question": question,
                "answer": user_answer,
                "queued_steps": state.step_queue.len(),
            }),
        )
        .await;

        self.replan_open_needs(&mut state, ctx, None).await;
        self.drive(state, ctx).await
    }

    async fn load_resumable(&self, workflow_id: &str) -> Result<WorkflowState, String> {
        let state = self
            .store
            .load(workflow_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("unknown workflow '{}'", workflow_id))?;
        if state.phase != WorkflowPhase::Paused {
            return Err(format!(
                "workflow '{}' is {} and cannot be resumed",
                workflow_id,
                state.phase.as_str()
            ));
        }
        state
            .validate()
            .map_err(|e| format!("stored state is inconsistent: {}", e))?;
        let claimed = self
            .store
            .claim_paused(workflow_id)
            .await
            .map_err(|e| e.to_string())?;
        if !claimed {
            return Err(format!(
                "workflow '{}' was already resumed and cannot be resumed again",
                workflow_id
            ));
        }
        Ok(state)
    }

    /// The step loop.
    async fn drive(&self, mut state: WorkflowState, ctx: &RunContext) -> WorkflowResult {
        loop {
            if ctx.cancel.is_cancelled() {
                return self
                    .fail(&mut state, FailureKind::Cancelled, "workflow cancelled")
                    .await;
            }

            if state.step_queue.is_empty() {
                if state.open_needs.is_empty() {
                    return self.complete(&mut state).await;
                }
                if self.replan_open_needs(&mut state, ctx, None).await > 0 {
                    continue;
                }
                let expired: Vec<Need> = state.open_needs.clone();
                state.expire_open_needs();
                state.degraded = true;
                tracing::warn!(
                    "[WorkflowExecutor] {} need(s) expired in workflow {}",
                    expired.len(),
                    state.workflow_id
                );
                self.record_level(
                    AuditLevel::Warn,
                    "needs_expired",
                    Direction::Internal,
                    json!({ "workflow_id": state.workflow_id, "needs": expired }),
                )
                .await;
                return self.complete(&mut state).await;
            }

            let front_is_plan = state
                .step_queue
                .front()
                .map(|s| !s.is_synthesized())
                .unwrap_or(false);
            if front_is_plan && !state.has_room_for_plan_step() {
                self.skip_plan_steps(&mut state).await;
                continue;
            }

            let Some(mut step) = state.step_queue.pop_front() else {
                continue;
            };
            self.apply_capability_policy(&mut step, &state).await;
            step.status = StepStatus::Running;
            state.executed_step_count += 1;

            let packet = self.build_packet(&state, &step, ctx).await;
            self.record(
                "step_dispatched",
                Direction::Outbound,
                json!({
                    "workflow_id": state.workflow_id,
                    "step_id": step.id,
                    "worker": step.assigned_worker,
                    "goal": step.goal,
                    "origin": step.origin,
                    "tool_hints": step.tool_hints,
                    "executed_step_count": state.executed_step_count,
                }),
            )
            .await;

            let report = self.dispatcher.dispatch_with_retry(&step, &packet).await;
            match report.result {
                Ok(output) => {
                    step.status = StepStatus::Done;
                    if let Some(result) = self.on_step_done(&mut state, &step, output, report.attempts, ctx).await {
                        return result;
                    }
                }
                Err(error) => {
                    step.status = StepStatus::Failed;
                    tracing::warn!(
                        "[WorkflowExecutor] Step {} ({}) failed after {} attempt(s): {}",
                        step.id,
                        step.assigned_worker,
                        report.attempts,
                        error
                    );
                    self.record_level(
                        AuditLevel::Error,
                        "step_failed",
                        Direction::Inbound,
                        json!({
                            "workflow_id": state.workflow_id,
                            "step_id": step.id,
                            "worker": step.assigned_worker,
                            "attempts": report.attempts,
                            "transient": error.is_transient(),
                            "kind": error.kind(),
                            "error": error.message(),
                        }),
                    )
                    .await;

                    if let Some(key) = &step.answers_need {
                        state.close_need(key, NeedStatus::Expired);
                    }
                    state.failed_steps.push(FailedStep {
                        step: step.summary(),
                        error: error.to_string(),
                        attempts: report.attempts,
                    });
                    state.degraded = true;
                    self.recover_failed_step(&mut state, &step, &error.to_string(), ctx)
                        .await;
                }
            }
        }
    }

    /// Bookkeeping after a successful dispatch. Returns a result when the
    /// workflow pauses.
    async fn on_step_done(
        &self,
        state: &mut WorkflowState,
        step: &Step,
        output: String,
        attempts: u32,
        ctx: &RunContext,
    ) -> Option<WorkflowResult> {
        self.record(
            "step_completed",
            Direction::Inbound,
            json!({
                "workflow_id": state.workflow_id,
                "step_id": step.id,
                "worker": step.assigned_worker,
                "attempts": attempts,
                "output": output,
            }),
        )
        .await;

        if let Some(key) = &step.answers_need {
            if let Some(need) = state.close_need(key, NeedStatus::Resolved) {
                self.record(
                    "need_resolved",
                    Direction::Internal,
                    json!({
                        "workflow_id": state.workflow_id,
                        "step_id": step.id,
                        "need": need,
                    }),
                )
                .await;
            }
        }

        state.prior_results.push(PriorResult {
            step_id: step.id,
            worker: step.assigned_worker.clone(),
            goal: step.goal.clone(),
            output: output.clone(),
        });

        let parsed = self.parser.parse(&output, step.id);
        for anomaly in &parsed.anomalies {
            tracing::warn!(
                "[WorkflowExecutor] Needs parse anomaly in step {}: {}",
                step.id,
                anomaly.reason
            );
            self.record_level(
                AuditLevel::Warn,
                "needs_parse_anomaly",
                Direction::Internal,
                json!({
                    "workflow_id": state.workflow_id,
                    "step_id": step.id,
                    "reason": anomaly.reason,
                    "fragment": anomaly.fragment,
                }),
            )
            .await;
        }

        let added = state.merge_needs(parsed.needs);
        if !added.is_empty() {
            self.record(
                "needs_merged",
                Direction::Internal,
                json!({
                    "workflow_id": state.workflow_id,
                    "step_id": step.id,
                    "format": parsed.format,
                    "needs": added,
                }),
            )
            .await;
        }

        let clarification = added.iter().find(|n| {
            n.target_worker
                .eq_ignore_ascii_case(&self.settings.coordinator_name)
                && self.classifier.is_clarification(n)
        });
        if let Some(need) = clarification {
            return Some(self.pause(state, need.clone()).await);
        }

        self.replan_open_needs(state, ctx, Some((step, output.as_str())))
            .await;
        None
    }

    async fn pause(&self, state: &mut WorkflowState, need: Need) -> WorkflowResult {
        state.pending_clarification = Some(need.key());
        state.pause_reason = Some(need.request_text.clone());
        state.set_phase(WorkflowPhase::Paused);
        self.persist(state).await;

        tracing::info!(
            "[WorkflowExecutor] Workflow {} paused for clarification",
            state.workflow_id
        );
        self.record(
            "workflow_paused",
            Direction::Outbound,
            json!({
                "workflow_id": state.workflow_id,
                "question": need.request_text,
                "origin_step_id": need.origin_step_id,
                "queued_steps": state.step_queue.len(),
            }),
        )
        .await;

        WorkflowResult::Paused {
            workflow_id: state.workflow_id.clone(),
            question: need.request_text,
            prior_results: state.prior_results.clone(),
        }
    }

    /// Reassign the step to the owner of the first owned capability in its hints.
    async fn apply_capability_policy(&self, step: &mut Step, state: &WorkflowState) {
        let Some(found) = self.registry.resolve_step(&step.tool_hints).await else {
            for hint in &step.tool_hints {
                if self.catalog.declares_capability(hint) {
                    tracing::warn!(
                        "[WorkflowExecutor] Capability '{}' has no owner; step {} stays with {}",
                        hint,
                        step.id,
                        step.assigned_worker
                    );
                    self.record_level(
                        AuditLevel::Warn,
                        "policy_gap",
                        Direction::Internal,
                        json!({
                            "workflow_id": state.workflow_id,
                            "step_id": step.id,
                            "capability": hint,
                            "worker": step.assigned_worker,
                        }),
                    )
                    .await;
                }
            }
            return;
        };

        if found.owner.eq_ignore_ascii_case(&step.assigned_worker) {
            return;
        }
        let Some(owner) = self.catalog.canonical_name(&found.owner) else {
            tracing::warn!(
                "[WorkflowExecutor] Owner '{}' of '{}' is not a known worker; step {} stays with {}",
                found.owner,
                found.capability,
                step.id,
                step.assigned_worker
            );
            self.record_level(
                AuditLevel::Warn,
                "policy_owner_unknown",
                Direction::Internal,
                json!({
                    "workflow_id": state.workflow_id,
                    "step_id": step.id,
                    "capability": found.capability,
                    "owner": found.owner,
                }),
            )
            .await;
            return;
        };

        let previous = std::mem::replace(&mut step.assigned_worker, owner.to_string());
        if step.original_worker.is_none() {
            step.original_worker = Some(previous.clone());
        }
        step.status = StepStatus::Rerouted;
        tracing::info!(
            "[WorkflowExecutor] Step {} rerouted {} -> {} (capability '{}')",
            step.id,
            previous,
            owner,
            found.capability
        );
        self.record(
            "policy_override",
            Direction::Internal,
            json!({
                "workflow_id": state.workflow_id,
                "step_id": step.id,
                "capability": found.capability,
                "from": previous,
                "to": owner,
            }),
        )
        .await;
    }

    /// Ask for steps that answer open needs. Returns how many were queued.
    async fn replan_open_needs(
        &self,
        state: &mut WorkflowState,
        ctx: &RunContext,
        latest: Option<(&Step, &str)>,
    ) -> usize {
        let actionable = state
            .open_needs
            .iter()
            .any(|n| n.answered_by.is_none());
        if !actionable {
            return 0;
        }

        let mut request = self.replan_request(state, ctx);
        if let Some((step, output)) = latest {
            request.latest_step = Some(step.summary());
            request.latest_output = Some(output.to_string());
        }
        let pending: Vec<Step> = state.step_queue.iter().cloned().collect();
        let outcome = self.replan.reconcile(&request, &pending, &self.catalog).await;

        for anomaly in &outcome.anomalies {
            self.record_level(
                AuditLevel::Warn,
                "replan_anomaly",
                Direction::Internal,
                json!({ "workflow_id": state.workflow_id, "reason": anomaly }),
            )
            .await;
        }
        let queued = self.enqueue(state, outcome.steps);
        if queued > 0 {
            self.record(
                "steps_synthesized",
                Direction::Internal,
                json!({
                    "workflow_id": state.workflow_id,
                    "source": outcome.source,
                    "steps": state.step_queue.iter().take(queued).map(Step::summary).collect::<Vec<_>>(),
                    "executed_step_count": state.executed_step_count,
                    "reserved": state.reserved_slots(),
                    "budget": state.budget,
                }),
            )
            .await;
        }
        queued
    }

    async fn recover_failed_step(
        &self,
        state: &mut WorkflowState,
        failed: &Step,
        error: &str,
        ctx: &RunContext,
    ) {
        if !self.replan.has_collaborator() {
            return;
        }
        let mut request = self.replan_request(state, ctx);
        request.latest_step = Some(failed.summary());
        request.latest_error = Some(error.to_string());
        let pending: Vec<Step> = state.step_queue.iter().cloned().collect();
        let outcome = self.replan.recover(&request, &pending, &self.catalog).await;

        let queued = self.enqueue(state, outcome.steps);
        if queued > 0 {
            self.record(
                "recovery_step_queued",
                Direction::Internal,
                json!({
                    "workflow_id": state.workflow_id,
                    "failed_step_id": failed.id,
                    "steps": state.step_queue.iter().take(queued).map(Step::summary).collect::<Vec<_>>(),
                }),
            )
            .await;
        }
    }

    /// Put proposed steps at the front of the queue, in proposal order.
    fn enqueue(&self, state: &mut WorkflowState, proposed: Vec<ProposedStep>) -> usize {
        let budget = StepBudget {
            limit: state.budget,
            executed: state.executed_step_count,
            reserved: state.reserved_slots(),
        };
        let mut steps = Vec::new();
        for p in proposed.into_iter().take(budget.remaining()) {
            let id = state.allocate_step_id();
            let mut step = Step::from_planned(id, &p.planned, p.origin);
            if let Some(key) = p.answers_need {
                state.mark_need_answered(&key, id);
                step.answers_need = Some(key);
            }
            steps.push(step);
        }
        let count = steps.len();
        state.synthesized_step_count += count;
        for step in steps.into_iter().rev() {
            state.step_queue.push_front(step);
        }
        count
    }

    async fn skip_plan_steps(&self, state: &mut WorkflowState) {
        let (skipped, kept): (Vec<Step>, Vec<Step>) = state
            .step_queue
            .drain(..)
            .partition(|s| !s.is_synthesized());
        state.step_queue.extend(kept);
        state.degraded = true;
        let summaries: Vec<StepSummary> = skipped.iter().map(Step::summary).collect();
        tracing::warn!(
            "[WorkflowExecutor] Step budget {} reached in workflow {}; skipping {} plan step(s)",
            state.budget,
            state.workflow_id,
            summaries.len()
        );
        self.record_level(
            AuditLevel::Warn,
            "budget_exhausted",
            Direction::Internal,
            json!({
                "workflow_id": state.workflow_id,
                "budget": state.budget,
                "executed_step_count": state.executed_step_count,
                "skipped": summaries,
            }),
        )
        .await;
        state.skipped_steps.extend(summaries);
    }

    fn replan_request(&self, state: &WorkflowState, ctx: &RunContext) -> ReplanRequest {
        ReplanRequest {
            workflow_id: state.workflow_id.clone(),
            user_request: state.user_request.clone(),
            conversation_history: ctx.conversation_history.clone(),
            raw_plan: state.raw_plan.clone(),
            coordinator: self.settings.coordinator_name.clone(),
            latest_step: None,
            latest_output: None,
            latest_error: None,
            prior_results: state.prior_results.clone(),
            open_needs: state.open_needs.clone(),
            pending_steps: state.remaining_summaries(),
            workers: self.catalog.cards(),
            budget: StepBudget {
                limit: state.budget,
                executed: state.executed_step_count,
                reserved: state.reserved_slots(),
            },
        }
    }

    async fn build_packet(&self, state: &WorkflowState, step: &Step, ctx: &RunContext) -> ContextPacket {
        ContextPacket {
            workflow_id: state.workflow_id.clone(),
            coordinator: self.settings.coordinator_name.clone(),
            step: step.summary(),
            step_position: state.executed_step_count,
            total_steps_hint: state.executed_step_count + state.step_queue.len(),
            user_request: state.user_request.clone(),
            conversation_history: ctx.conversation_history.clone(),
            prior_results: state.prior_results.clone(),
            open_needs: state.open_needs.clone(),
            remaining_steps: state.remaining_summaries(),
            worker_catalog: self.catalog.cards(),
            capability_policy: self.registry.snapshot().await,
        }
    }

    async fn complete(&self, state: &mut WorkflowState) -> WorkflowResult {
        state.set_phase(WorkflowPhase::Completed);
        let unresolved: Vec<Need> = state.expired_needs().cloned().collect();
        let degraded = state.degraded || !unresolved.is_empty();
        let answer = synthesize(state);
        self.persist(state).await;

        tracing::info!(
            "[WorkflowExecutor] Workflow {} completed ({} steps{})",
            state.workflow_id,
            state.executed_step_count,
            if degraded { ", degraded" } else { "" }
        );
        self.record(
            "workflow_completed",
            Direction::Outbound,
            json!({
                "workflow_id": state.workflow_id,
                "executed_step_count": state.executed_step_count,
                "synthesized_step_count": state.synthesized_step_count,
                "degraded": degraded,
                "unresolved_needs": unresolved.len(),
                "failed_steps": state.failed_steps.len(),
                "skipped_steps": state.skipped_steps.len(),
            }),
        )
        .await;

        WorkflowResult::Completed {
            workflow_id: state.workflow_id.clone(),
            answer,
            degraded,
            unresolved_needs: unresolved,
            failed_steps: state.failed_steps.clone(),
            skipped_steps: state.skipped_steps.clone(),
            executed_steps: state.executed_step_count,
        }
    }

    async fn fail(&self, state: &mut WorkflowState, kind: FailureKind, message: &str) -> WorkflowResult {
        state.set_phase(WorkflowPhase::Failed);
        self.persist(state).await;
        tracing::warn!(
            "[WorkflowExecutor] Workflow {} failed: {}",
            state.workflow_id,
            message
        );
        self.record_level(
            AuditLevel::Error,
            "workflow_failed",
            Direction::Outbound,
            json!({
                "workflow_id": state.workflow_id,
                "kind": kind,
                "message": message,
                "executed_step_count": state.executed_step_count,
            }),
        )
        .await;
        WorkflowResult::Failed {
            workflow_id: state.workflow_id.clone(),
            error: FailureSummary {
                kind,
                message: message.to_string(),
            },
        }
    }

    async fn persist(&self, state: &WorkflowState) {
        if let Err(e) = self.store.save(state).await {
            tracing::error!(
                "[WorkflowExecutor] Failed to persist workflow {}: {}",
                state.workflow_id,
                e
            );
        }
    }

    async fn record(&self, action: &str, direction: Direction, details: serde_json::Value) {
        self.record_level(AuditLevel::Info, action, direction, details)
            .await;
    }

    async fn record_level(
        &self,
        level: AuditLevel,
        action: &str,
        direction: Direction,
        details: serde_json::Value,
    ) {
        self.audit
            .record_safe(level, COMPONENT, action, direction, details)
            .await;
    }
}

fn new_workflow_id(session_id: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", session_id, &suffix[..8])
}

/// Deterministic final answer built from the execution record.
pub fn synthesize(state: &WorkflowState) -> String {
    let mut out = String::new();

    out.push_str("=== Plan ===\n");
    if state.raw_plan.trim().is_empty() {
        out.push_str("(none)\n");
    } else {
        out.push_str(state.raw_plan.trim());
        out.push('\n');
    }

    out.push_str("\n=== Execution Results ===\n");
    if state.prior_results.is_empty() {
        out.push_str("(none)\n");
    }
    for result in &state.prior_results {
        out.push_str(&format!(
            "[Step {}] {}: {}\n{}\n\n",
            result.step_id,
            result.worker,
            result.goal,
            result.output.trim()
        ));
    }

    if !state.failed_steps.is_empty() {
        out.push_str("=== Failed Steps ===\n");
        for failed in &state.failed_steps {
            out.push_str(&format!(
                "[Step {}] {}: {} ({})\n",
                failed.step.id, failed.step.worker, failed.step.goal, failed.error
            ));
        }
        out.push('\n');
    }

    if !state.skipped_steps.is_empty() {
        out.push_str("=== Skipped Steps ===\n");
        for skipped in &state.skipped_steps {
            out.push_str(&format!(
                "[Step {}] {}: {}\n",
                skipped.id, skipped.worker, skipped.goal
            ));
        }
        out.push('\n');
    }

    let unresolved: Vec<&Need> = state.expired_needs().collect();
    if !unresolved.is_empty() {
        out.push_str("=== Unresolved Needs ===\n");
        for need in unresolved {
            out.push_str(&format!("- [{}] {}\n", need.target_worker, need.request_text));
        }
    }

    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditReader;
    use crate::db::Database;
    use crate::workflow::dispatcher::{
        DispatchConfig, FnWorker, RetryPolicy, TransportError, TransportErrorKind,
    };
    use crate::workflow::replan::{PlanningError, ReplanResponse};
    use crate::workflow::schema::PlannedStep;
    use crate::workflow::worker::WorkerDescriptor;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    type Handler = Box<dyn Fn(&ContextPacket) -> Result<String, TransportError> + Send + Sync>;

    /// Records every packet a worker receives.
    #[derive(Clone, Default)]
    struct CallLog(Arc<Mutex<Vec<ContextPacket>>>);

    impl CallLog {
        fn calls(&self) -> Vec<ContextPacket> {
            self.0.lock().unwrap().clone()
        }

        fn workers(&self) -> Vec<String> {
            self.calls().into_iter().map(|p| p.step.worker).collect()
        }
    }

    struct Harness {
        executor: WorkflowExecutor,
        calls: CallLog,
        _dir: tempfile::TempDir,
        log_dir: std::path::PathBuf,
    }

    async fn harness(
        workers: Vec<WorkerDescriptor>,
        handlers: Vec<(&str, Handler)>,
        capabilities: Vec<(&str, &str)>,
        settings: EngineSettings,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("log");
        let audit = AuditLog::open(&log_dir).await.unwrap();
        let catalog = Arc::new(WorkerCatalog::from_descriptors(workers));
        let mut dispatcher = StepDispatcher::new(
            catalog.clone(),
            DispatchConfig {
                timeout: Duration::from_secs(5),
                retry: RetryPolicy {
                    max_retries: 1,
                    initial_delay_ms: 0,
                    max_delay_ms: 0,
                    backoff_multiplier: 1.0,
                },
            },
        )
        .with_audit(audit.clone());

        let calls = CallLog::default();
        for (name, handler) in handlers {
            let log = calls.clone();
            dispatcher.register_local(
                name,
                Arc::new(FnWorker::new(move |p| {
                    log.0.lock().unwrap().push(p.clone());
                    handler(p)
                })),
            );
        }

        let store = WorkflowStore::new(Database::open_in_memory().unwrap());
        let executor = WorkflowExecutor::new(
            catalog,
            dispatcher,
            CapabilityRegistry::from_table(capabilities),
            audit,
            store,
            settings,
        );
        Harness {
            executor,
            calls,
            _dir: dir,
            log_dir,
        }
    }

    fn boxed<F>(f: F) -> Handler
    where
        F: Fn(&ContextPacket) -> Result<String, TransportError> + Send + Sync + 'static,
    {
        Box::new(f)
    }

    fn reply(text: &'static str) -> Handler {
        boxed(move |_| Ok(text.to_string()))
    }

    fn default_workers() -> Vec<WorkerDescriptor> {
        vec![
            WorkerDescriptor::local("Worker_SNS").with_tools(["sns.search"]),
            WorkerDescriptor::local("Worker_Web")
                .with_capabilities(["web.search"])
                .with_tools(["web.search", "web.fetch"]),
            WorkerDescriptor::local("MainAgent").with_capabilities(["comm.slack.post"]),
        ]
    }

    fn ctx() -> RunContext {
        RunContext::new("sess", "What are the AI trends this week?")
    }

    #[tokio::test]
    async fn test_plan_without_needs_dispatches_each_step_once() {
        let h = harness(
            default_workers(),
            vec![
                ("Worker_SNS", reply("posts\nAdditional Needs: none")),
                ("Worker_Web", reply("articles\nAdditional Needs: none")),
            ],
            vec![],
            EngineSettings::default(),
        )
        .await;
        let plan = Plan::from_steps(
            "three steps",
            vec![
                PlannedStep::new("Worker_SNS", "collect posts"),
                PlannedStep::new("Worker_Web", "collect articles"),
                PlannedStep::new("Worker_SNS", "collect replies"),
            ],
        );

        let result = h.executor.run(&plan, &ctx()).await;
        match &result {
            WorkflowResult::Completed {
                executed_steps,
                degraded,
                answer,
                ..
            } => {
                assert_eq!(*executed_steps, 3);
                assert!(!degraded);
                let first = answer.find("[Step 1] Worker_SNS: collect posts").unwrap();
                let second = answer.find("[Step 2] Worker_Web: collect articles").unwrap();
                let third = answer.find("[Step 3] Worker_SNS: collect replies").unwrap();
                assert!(first < second && second < third);
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(h.calls.workers(), vec!["Worker_SNS", "Worker_Web", "Worker_SNS"]);
        assert!(result.workflow_id().starts_with("sess-"));
        assert_eq!(result.workflow_id().len(), "sess-".len() + 8);
    }

    #[tokio::test]
    async fn test_sns_need_routes_to_web() {
        let h = harness(
            default_workers(),
            vec![
                (
                    "Worker_SNS",
                    reply("Top posts: ...\nAdditional Needs:\n- [Worker_Web] verify the top posts with web sources"),
                ),
                ("Worker_Web", reply("Verified.\nAdditional Needs: none")),
            ],
            vec![],
            EngineSettings::default(),
        )
        .await;
        let plan = Plan::from_steps("sns", vec![PlannedStep::new("Worker_SNS", "summarize AI posts")]);

        let result = h.executor.run(&plan, &ctx()).await;
        let WorkflowResult::Completed {
            executed_steps,
            degraded,
            unresolved_needs,
            answer,
            ..
        } = result
        else {
            panic!("expected completion");
        };
        assert_eq!(executed_steps, 2);
        assert!(!degraded);
        assert!(unresolved_needs.is_empty());
        let sns = answer.find("[Step 1] Worker_SNS").expect("SNS result in answer");
        let web = answer.find("[Step 2] Worker_Web").expect("Web result in answer");
        assert!(sns < web);
        assert!(answer.contains("Top posts"));
        assert!(answer.contains("Verified."));

        let calls = h.calls.calls();
        assert_eq!(calls[1].step.worker, "Worker_Web");
        assert_eq!(calls[1].step.goal, "verify the top posts with web sources");
        assert_eq!(calls[1].step.deliverable, "response to request");
        assert_eq!(calls[1].step.tool_hints, vec!["web.search", "web.fetch"]);
        assert_eq!(calls[1].prior_results.len(), 1);
        assert_eq!(calls[1].open_needs.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_plan_routes_to_selected_workers() {
        let h = harness(
            default_workers(),
            vec![
                ("Worker_SNS", reply("Posts.\nAdditional Needs: none")),
                ("Worker_Web", reply("Articles.\nAdditional Needs: none")),
            ],
            vec![],
            EngineSettings::default(),
        )
        .await;
        let mut plan = Plan::from_steps("route only", vec![]);
        plan.routing_hint.selected_workers = vec![
            "worker_web".to_string(),
            "Worker_Ghost".to_string(),
            "Worker_SNS".to_string(),
            "WORKER_WEB".to_string(),
        ];

        let result = h.executor.run(&plan, &ctx()).await;
        let WorkflowResult::Completed { executed_steps, .. } = result else {
            panic!("expected completion");
        };
        assert_eq!(executed_steps, 2);
        assert_eq!(h.calls.workers(), vec!["Worker_Web", "Worker_SNS"]);
        let calls = h.calls.calls();
        assert_eq!(calls[0].step.goal, ROUTED_STEP_GOAL);
        assert_eq!(calls[0].step.deliverable, ROUTED_STEP_DELIVERABLE);
    }

    #[tokio::test]
    async fn test_empty_plan_without_routing_completes_immediately() {
        let h = harness(default_workers(), vec![], vec![], EngineSettings::default()).await;
        let mut plan = Plan::from_steps("", vec![]);
        plan.routing_hint.selected_workers = vec!["Worker_Ghost".to_string()];

        let result = h.executor.run(&plan, &ctx()).await;
        let WorkflowResult::Completed { executed_steps, .. } = result else {
            panic!("expected completion");
        };
        assert_eq!(executed_steps, 0);
        assert!(h.calls.calls().is_empty());
    }

    #[tokio::test]
    async fn test_no_needs_sentinel_completes_after_plan() {
        let h = harness(
            default_workers(),
            vec![("Worker_SNS", reply("Summary.\nAdditional Needs: none"))],
            vec![],
            EngineSettings::default(),
        )
        .await;
        let plan = Plan::from_steps("", vec![PlannedStep::new("Worker_SNS", "summarize")]);
        let result = h.executor.run(&plan, &ctx()).await;
        let WorkflowResult::Completed {
            executed_steps,
            degraded,
            ..
        } = result
        else {
            panic!("expected completion");
        };
        assert_eq!(executed_steps, 1);
        assert!(!degraded);
        assert_eq!(h.calls.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_clarification_pauses_and_resume_continues_with_next_step() {
        let h = harness(
            default_workers(),
            vec![
                (
                    "Worker_SNS",
                    reply("Found posts in several regions.\nAdditional Needs:\n- [MainAgent] Please confirm which region the user cares about"),
                ),
                ("Worker_Web", reply("Region report.\nAdditional Needs: none")),
            ],
            vec![],
            EngineSettings::default(),
        )
        .await;
        let plan = Plan::from_steps(
            "",
            vec![
                PlannedStep::new("Worker_SNS", "collect posts"),
                PlannedStep::new("Worker_Web", "find articles"),
            ],
        );

        let paused = h.executor.run(&plan, &ctx()).await;
        let WorkflowResult::Paused {
            workflow_id,
            question,
            prior_results,
        } = paused
        else {
            panic!("expected pause");
        };
        assert_eq!(question, "Please confirm which region the user cares about");
        assert_eq!(prior_results.len(), 1);
        assert_eq!(h.calls.workers(), vec!["Worker_SNS"]);

        let resumed = h.executor.resume(&workflow_id, "Korea", &ctx()).await;
        let WorkflowResult::Completed {
            executed_steps,
            degraded,
            answer,
            ..
        } = resumed
        else {
            panic!("expected completion after resume");
        };
        assert_eq!(executed_steps, 2);
        assert!(!degraded);
        assert!(answer.contains("Korea"));

        let calls = h.calls.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].step.id, 2);
        assert_eq!(calls[1].step.worker, "Worker_Web");
        let answer_result = calls[1].prior_results.last().unwrap();
        assert_eq!(answer_result.worker, USER_ANSWER_WORKER);
        assert_eq!(answer_result.output, "Korea");

        let again = h.executor.resume(&workflow_id, "Japan", &ctx()).await;
        let WorkflowResult::Failed { error, .. } = again else {
            panic!("completed workflow must not resume");
        };
        assert_eq!(error.kind, FailureKind::FatalState);
    }

    #[tokio::test]
    async fn test_concurrent_resume_runs_once() {
        let h = harness(
            default_workers(),
            vec![
                (
                    "Worker_SNS",
                    reply("Posts.\nAdditional Needs:\n- [MainAgent] Please confirm date range with user"),
                ),
                ("Worker_Web", reply("Articles.\nAdditional Needs: none")),
            ],
            vec![],
            EngineSettings::default(),
        )
        .await;
        let plan = Plan::from_steps(
            "",
            vec![
                PlannedStep::new("Worker_SNS", "collect posts"),
                PlannedStep::new("Worker_Web", "find articles"),
            ],
        );

        let WorkflowResult::Paused { workflow_id, .. } = h.executor.run(&plan, &ctx()).await else {
            panic!("expected pause");
        };

        let (ctx_a, ctx_b) = (ctx(), ctx());
        let (a, b) = tokio::join!(
            h.executor.resume(&workflow_id, "last week", &ctx_a),
            h.executor.resume(&workflow_id, "last month", &ctx_b),
        );
        let results = [a, b];
        let completed = results.iter().filter(|r| r.is_completed()).count();
        assert_eq!(completed, 1);
        let rejected = results
            .iter()
            .filter(|r| {
                matches!(r, WorkflowResult::Failed { error, .. } if error.kind == FailureKind::FatalState)
            })
            .count();
        assert_eq!(rejected, 1);
        assert_eq!(h.calls.workers(), vec!["Worker_SNS", "Worker_Web"]);
    }

    #[tokio::test]
    async fn test_resume_unknown_workflow_is_fatal() {
        let h = harness(default_workers(), vec![], vec![], EngineSettings::default()).await;
        let result = h.executor.resume("sess-deadbeef", "hi", &ctx()).await;
        let WorkflowResult::Failed { error, workflow_id } = result else {
            panic!("expected failure");
        };
        assert_eq!(workflow_id, "sess-deadbeef");
        assert_eq!(error.kind, FailureKind::FatalState);
    }

    #[tokio::test]
    async fn test_budget_is_never_exceeded() {
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let sns_counter = counter.clone();
        let web_counter = counter.clone();
        let h = harness(
            default_workers(),
            vec![
                (
                    "Worker_SNS",
                    boxed(move |_| {
                        let n = sns_counter.fetch_add(1, Ordering::SeqCst);
                        Ok(format!("Additional Needs:\n- [Worker_Web] follow-up {}", n))
                    }),
                ),
                (
                    "Worker_Web",
                    boxed(move |_| {
                        let n = web_counter.fetch_add(1, Ordering::SeqCst);
                        Ok(format!("Additional Needs:\n- [Worker_SNS] follow-up {}", n))
                    }),
                ),
            ],
            vec![],
            EngineSettings {
                max_total_steps: Some(3),
                ..EngineSettings::default()
            },
        )
        .await;
        let plan = Plan::from_steps(
            "",
            vec![
                PlannedStep::new("Worker_SNS", "start"),
                PlannedStep::new("Worker_SNS", "second plan step"),
            ],
        );

        let result = h.executor.run(&plan, &ctx()).await;
        let WorkflowResult::Completed {
            executed_steps,
            degraded,
            unresolved_needs,
            skipped_steps,
            ..
        } = result
        else {
            panic!("expected completion");
        };
        assert!(executed_steps <= 3);
        assert_eq!(h.calls.calls().len(), executed_steps);
        assert!(degraded);
        assert!(!unresolved_needs.is_empty() || !skipped_steps.is_empty());
    }

    #[tokio::test]
    async fn test_reroute_to_capability_owner() {
        let h = harness(
            default_workers(),
            vec![
                ("Worker_SNS", reply("sns\nAdditional Needs: none")),
                ("Worker_Web", reply("web\nAdditional Needs: none")),
            ],
            vec![("web.search", "Worker_Web")],
            EngineSettings::default(),
        )
        .await;
        let plan = Plan::from_steps(
            "",
            vec![
                PlannedStep::new("Worker_SNS", "search the web").with_tool_hints(["web.search"]),
                PlannedStep::new("Worker_Web", "search again").with_tool_hints(["web.search"]),
            ],
        );
        let result = h.executor.run(&plan, &ctx()).await;
        assert!(result.is_completed());

        let calls = h.calls.calls();
        assert_eq!(h.calls.workers(), vec!["Worker_Web", "Worker_Web"]);
        assert_eq!(calls[0].step.goal, "search the web");

        let overrides: Vec<_> = AuditReader::new(&h.log_dir)
            .active_session()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.action == "policy_override")
            .collect();
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides[0].details["from"], json!("Worker_SNS"));
        assert_eq!(overrides[0].details["to"], json!("Worker_Web"));
    }

    #[tokio::test]
    async fn test_reroute_is_idempotent() {
        let h = harness(default_workers(), vec![], vec![("web.search", "Worker_Web")], EngineSettings::default()).await;
        let state = WorkflowState::from_plan("wf", "s", "q", &Plan::default(), 8);
        let mut step = Step::from_planned(
            1,
            &PlannedStep::new("Worker_SNS", "g").with_tool_hints(["web.search"]),
            crate::workflow::schema::StepOrigin::Plan,
        );
        h.executor.apply_capability_policy(&mut step, &state).await;
        let once = step.clone();
        h.executor.apply_capability_policy(&mut step, &state).await;
        assert_eq!(step, once);
        assert_eq!(step.assigned_worker, "Worker_Web");
        assert_eq!(step.original_worker.as_deref(), Some("Worker_SNS"));
        assert_eq!(step.goal, "g");
    }

    #[tokio::test]
    async fn test_policy_gap_keeps_worker() {
        let h = harness(
            default_workers(),
            vec![("Worker_SNS", reply("ok\nAdditional Needs: none"))],
            vec![],
            EngineSettings::default(),
        )
        .await;
        let plan = Plan::from_steps(
            "",
            vec![PlannedStep::new("Worker_SNS", "g").with_tool_hints(["web.search"])],
        );
        assert!(h.executor.run(&plan, &ctx()).await.is_completed());
        assert_eq!(h.calls.workers(), vec!["Worker_SNS"]);
        let gaps = AuditReader::new(&h.log_dir)
            .active_session()
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.action == "policy_gap")
            .count();
        assert_eq!(gaps, 1);
    }

    #[tokio::test]
    async fn test_failed_step_does_not_stop_workflow() {
        let h = harness(
            default_workers(),
            vec![
                (
                    "Worker_SNS",
                    boxed(|_| {
                        Err(TransportError::permanent(TransportErrorKind::WorkerError, "api key revoked"))
                    }),
                ),
                ("Worker_Web", reply("web\nAdditional Needs: none")),
            ],
            vec![],
            EngineSettings::default(),
        )
        .await;
        let plan = Plan::from_steps(
            "",
            vec![
                PlannedStep::new("Worker_SNS", "collect"),
                PlannedStep::new("Worker_Ghost", "haunt"),
                PlannedStep::new("Worker_Web", "verify"),
            ],
        );
        let result = h.executor.run(&plan, &ctx()).await;
        let WorkflowResult::Completed {
            failed_steps,
            degraded,
            executed_steps,
            answer,
            ..
        } = result
        else {
            panic!("expected completion");
        };
        assert_eq!(executed_steps, 3);
        assert_eq!(failed_steps.len(), 2);
        assert!(degraded);
        assert!(answer.contains("=== Failed Steps ==="));
        // permanent errors are not retried
        assert_eq!(h.calls.workers(), vec!["Worker_SNS", "Worker_Web"]);
    }

    #[tokio::test]
    async fn test_coordinator_request_without_clarification_expires() {
        let h = harness(
            default_workers(),
            vec![(
                "Worker_SNS",
                reply("done\nAdditional Needs:\n- [MainAgent] post the summary to slack"),
            )],
            vec![],
            EngineSettings::default(),
        )
        .await;
        let plan = Plan::from_steps("", vec![PlannedStep::new("Worker_SNS", "collect")]);
        let result = h.executor.run(&plan, &ctx()).await;
        let WorkflowResult::Completed {
            degraded,
            unresolved_needs,
            answer,
            ..
        } = result
        else {
            panic!("expected completion");
        };
        assert!(degraded);
        assert_eq!(unresolved_needs.len(), 1);
        assert_eq!(unresolved_needs[0].status, NeedStatus::Expired);
        assert!(answer.contains("- [MainAgent] post the summary to slack"));
    }

    #[tokio::test]
    async fn test_cancelled_before_dispatch() {
        let h = harness(
            default_workers(),
            vec![("Worker_SNS", reply("x"))],
            vec![],
            EngineSettings::default(),
        )
        .await;
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let plan = Plan::from_steps("", vec![PlannedStep::new("Worker_SNS", "collect")]);
        let result = h.executor.run(&plan, &ctx().with_cancel(cancel)).await;
        let WorkflowResult::Failed { error, .. } = result else {
            panic!("expected failure");
        };
        assert_eq!(error.kind, FailureKind::Cancelled);
        assert!(h.calls.calls().is_empty());
    }

    struct SubstitutePlanner;

    #[async_trait]
    impl PlanningCollaborator for SubstitutePlanner {
        async fn review(&self, request: &ReplanRequest) -> Result<ReplanResponse, PlanningError> {
            if request.latest_error.is_some() {
                return Ok(ReplanResponse {
                    should_update_plan: true,
                    updated_steps: vec![PlannedStep::new("Worker_Web", "collect posts via web")],
                    reason: "substitute".to_string(),
                });
            }
            Err(PlanningError::Transport("offline".to_string()))
        }
    }

    #[tokio::test]
    async fn test_recovery_step_after_failure() {
        let h = harness(
            default_workers(),
            vec![
                (
                    "Worker_SNS",
                    boxed(|_| {
                        Err(TransportError::transient(TransportErrorKind::Connection, "refused"))
                    }),
                ),
                ("Worker_Web", reply("web posts\nAdditional Needs: none")),
            ],
            vec![],
            EngineSettings::default(),
        )
        .await;
        let executor = h.executor.with_collaborator(Arc::new(SubstitutePlanner));
        let plan = Plan::from_steps("", vec![PlannedStep::new("Worker_SNS", "collect posts")]);
        let result = executor.run(&plan, &ctx()).await;
        let WorkflowResult::Completed {
            executed_steps,
            failed_steps,
            answer,
            ..
        } = result
        else {
            panic!("expected completion");
        };
        assert_eq!(executed_steps, 2);
        assert_eq!(failed_steps.len(), 1);
        assert!(answer.contains("[Step 2] Worker_Web: collect posts via web"));
        // one retry for the transient failure
        assert_eq!(h.calls.workers(), vec!["Worker_SNS", "Worker_SNS", "Worker_Web"]);
    }

    #[tokio::test]
    async fn test_audit_sequence_is_contiguous() {
        let h = harness(
            default_workers(),
            vec![
                (
                    "Worker_SNS",
                    reply("posts\nAdditional Needs:\n- [Worker_Web] verify"),
                ),
                ("Worker_Web", reply("ok\nAdditional Needs: none")),
            ],
            vec![],
            EngineSettings::default(),
        )
        .await;
        let plan = Plan::from_steps("", vec![PlannedStep::new("Worker_SNS", "collect")]);
        assert!(h.executor.run(&plan, &ctx()).await.is_completed());

        let events = AuditReader::new(&h.log_dir).active_session().await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.session_seq).collect();
        let expected: Vec<u64> = (1..=events.len() as u64).collect();
        assert_eq!(seqs, expected);
        let actions: Vec<&str> = events.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions.first(), Some(&"plan_accepted"));
        assert_eq!(actions.last(), Some(&"workflow_completed"));
        assert!(actions.contains(&"needs_merged"));
        assert!(actions.contains(&"steps_synthesized"));
        assert!(actions.contains(&"need_resolved"));
    }

    #[tokio::test]
    async fn test_concurrent_workflows_are_isolated() {
        let h = harness(
            default_workers(),
            vec![("Worker_SNS", reply("ok\nAdditional Needs: none"))],
            vec![],
            EngineSettings::default(),
        )
        .await;
        let executor = Arc::new(h.executor);
        let plan = Plan::from_steps("", vec![PlannedStep::new("Worker_SNS", "collect")]);

        let mut handles = Vec::new();
        for i in 0..4 {
            let executor = executor.clone();
            let plan = plan.clone();
            handles.push(tokio::spawn(async move {
                executor
                    .run(&plan, &RunContext::new(format!("sess{}", i), "q"))
                    .await
            }));
        }
        for handle in handles {
            let result = handle.await.unwrap();
            let WorkflowResult::Completed { executed_steps, .. } = result else {
                panic!("expected completion");
            };
            assert_eq!(executed_steps, 1);
        }
    }

    #[test]
    fn test_default_budget() {
        let settings = EngineSettings::default();
        assert_eq!(settings.budget_for(1), 8);
        assert_eq!(settings.budget_for(5), 11);
        let fixed = EngineSettings {
            max_total_steps: Some(4),
            ..EngineSettings::default()
        };
        assert_eq!(fixed.budget_for(10), 4);
    }
}
