//! `conductor run` / `conductor resume` / `conductor paused`.

use conductor_core::store::session_store::HISTORY_PAIRS;
use conductor_core::workflow::{Plan, RunContext, WorkflowResult};

use super::{print_json, render_result};
use crate::app::App;

/// Execute a plan file for one user request.
pub async fn run(
    app: &App,
    plan_file: &str,
    session_id: &str,
    request: &str,
    json: bool,
) -> Result<(), String> {
    let plan = Plan::from_file(plan_file).map_err(|e| e.to_string())?;
    if plan.steps().is_empty() && plan.routing_hint.selected_workers.is_empty() {
        return Err(format!("Plan '{}' has no steps and no selected workers", plan_file));
    }
    tracing::info!(
        "[Run] Loaded plan {} ({} step(s)) for session {}",
        plan_file,
        plan.steps().len(),
        session_id
    );

    let ctx = context(app, session_id, request).await?;
    app.sessions
        .add_user_turn(session_id, request)
        .await
        .map_err(|e| e.to_string())?;

    let result = app.executor.run(&plan, &ctx).await;
    finish(app, session_id, &result, json).await
}

/// Answer a paused workflow's clarification question.
pub async fn resume(
    app: &App,
    workflow_id: &str,
    answer: &str,
    session_id: Option<&str>,
    json: bool,
) -> Result<(), String> {
    let stored = app
        .workflows
        .load(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    let session_id = match (session_id, &stored) {
        (Some(s), _) => s.to_string(),
        (None, Some(state)) => state.session_id.clone(),
        (None, None) => return Err(format!("Unknown workflow '{}'", workflow_id)),
    };
    let request = stored
        .map(|s| s.user_request)
        .unwrap_or_default();

    let ctx = context(app, &session_id, &request).await?;
    app.sessions
        .add_user_turn(&session_id, answer)
        .await
        .map_err(|e| e.to_string())?;

    let result = app.executor.resume(workflow_id, answer, &ctx).await;
    finish(app, &session_id, &result, json).await
}

/// List workflows of a session that are waiting for an answer.
pub async fn paused(app: &App, session_id: &str) -> Result<(), String> {
    let paused = app
        .workflows
        .list_paused(session_id)
        .await
        .map_err(|e| e.to_string())?;
    if paused.is_empty() {
        println!("No paused workflows for session '{}'", session_id);
        return Ok(());
    }
    for workflow in paused {
        let question = app
            .workflows
            .load(&workflow.id)
            .await
            .map_err(|e| e.to_string())?
            .and_then(|s| s.pause_reason)
            .unwrap_or_default();
        println!("{}  {}", workflow.id, question);
    }
    Ok(())
}

async fn context(app: &App, session_id: &str, request: &str) -> Result<RunContext, String> {
    let history = app
        .sessions
        .history_as_text(session_id, HISTORY_PAIRS)
        .await
        .map_err(|e| e.to_string())?;
    Ok(RunContext::new(session_id, request).with_history(history))
}

async fn finish(app: &App, session_id: &str, result: &WorkflowResult, json: bool) -> Result<(), String> {
    let reply = match result {
        WorkflowResult::Completed { answer, .. } => Some(answer.as_str()),
        WorkflowResult::Paused { question, .. } => Some(question.as_str()),
        WorkflowResult::Failed { .. } => None,
    };
    if let Some(text) = reply {
        if let Err(e) = app.sessions.add_assistant_turn(session_id, text).await {
            tracing::warn!("[Run] Failed to record assistant turn: {}", e);
        }
    }

    if json {
        let value = serde_json::to_value(result).map_err(|e| e.to_string())?;
        print_json(&value);
    } else {
        println!("{}", render_result(result));
    }

    match result {
        WorkflowResult::Failed { error, .. } => Err(error.message.clone()),
        _ => Ok(()),
    }
}
