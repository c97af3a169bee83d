//! Integration tests for the conductor CLI commands.
//!
//! These tests bootstrap the engine from a `ConductorConfig` the same way the
//! binary does, with shell-command workers and a throwaway directory for the
//! audit log and SQLite database.

use conductor_cli::app::App;
use conductor_cli::commands;
use conductor_core::audit::AuditReader;
use conductor_core::workflow::{Plan, PlannedStep, RunContext, WorkerDescriptor, WorkerTransport, WorkflowResult};
use conductor_core::ConductorConfig;

fn command_worker(name: &str, command: &str) -> WorkerDescriptor {
    let mut worker = WorkerDescriptor::local(name);
    worker.transport = WorkerTransport::Local {
        command: Some(command.to_string()),
    };
    worker
}

fn test_config(dir: &tempfile::TempDir, sns_command: &str) -> ConductorConfig {
    let mut config = ConductorConfig::default();
    config.workers = vec![
        command_worker("Worker_SNS", sns_command).with_tools(["sns.search"]),
        command_worker(
            "Worker_Web",
            "cat > /dev/null; printf 'web articles\\nAdditional Needs: none\\n'",
        )
        .with_tools(["web.search"]),
        WorkerDescriptor::local("MainAgent"),
    ];
    config.audit.log_dir = dir.path().join("log").to_string_lossy().to_string();
    config.database.path = dir.path().join("conductor.db").to_string_lossy().to_string();
    config.dispatch.timeout_secs = 10;
    config.dispatch.retry.max_retries = 0;
    config
}

fn write_plan(dir: &tempfile::TempDir) -> String {
    let path = dir.path().join("plan.yaml");
    std::fs::write(
        &path,
        r#"
raw_plan: "collect posts, then articles"
routing_hint:
  selected_workers: [Worker_SNS, Worker_Web]
collaboration_plan:
  steps:
    - agent: Worker_SNS
      goal: collect AI posts
    - agent: Worker_Web
      goal: collect AI articles
"#,
    )
    .expect("write plan");
    path.to_string_lossy().to_string()
}

#[tokio::test]
async fn test_run_plan_with_command_workers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(
        &dir,
        "cat > /dev/null; printf 'sns posts\\nAdditional Needs: none\\n'",
    );
    let app = App::bootstrap(config, true).await.expect("bootstrap");
    let plan = write_plan(&dir);

    commands::run::run(&app, &plan, "sess-1", "AI trends?", false)
        .await
        .expect("run succeeds");

    let turns = app.sessions.turns("sess-1").await.expect("turns");
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].text, "AI trends?");
    assert!(turns[1].text.contains("sns posts"));
    assert!(turns[1].text.contains("web articles"));

    let events = AuditReader::new(&app.config.audit.log_dir)
        .active_session()
        .await
        .expect("audit");
    assert_eq!(events[0].session_seq, 1);
    assert_eq!(events[0].action, "plan_accepted");
    assert_eq!(events.last().map(|e| e.action.as_str()), Some("workflow_completed"));
}

#[tokio::test]
async fn test_worker_need_becomes_a_step() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(
        &dir,
        "cat > /dev/null; printf 'sns posts\\nAdditional Needs:\\n- [Worker_Web] verify the viral post\\n'",
    );
    let app = App::bootstrap(config, true).await.expect("bootstrap");
    let plan = Plan::from_steps("", vec![PlannedStep::new("Worker_SNS", "collect AI posts")]);

    let result = app
        .executor
        .run(&plan, &RunContext::new("sess-2", "AI trends?"))
        .await;
    match result {
        WorkflowResult::Completed {
            executed_steps,
            answer,
            degraded,
            ..
        } => {
            assert_eq!(executed_steps, 2);
            assert!(!degraded);
            assert!(answer.contains("[Step 2] Worker_Web: verify the viral post"));
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_pause_and_resume_through_commands() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(
        &dir,
        "cat > /dev/null; printf 'posts from many regions\\nAdditional Needs:\\n- [MainAgent] please confirm which region to focus on\\n'",
    );
    let app = App::bootstrap(config, true).await.expect("bootstrap");
    let plan = write_plan(&dir);

    commands::run::run(&app, &plan, "sess-3", "AI trends?", true)
        .await
        .expect("pause is not an error");

    let paused = app.workflows.list_paused("sess-3").await.expect("list");
    assert_eq!(paused.len(), 1);
    let workflow_id = paused[0].id.clone();

    commands::run::resume(&app, &workflow_id, "Korea", None, false)
        .await
        .expect("resume succeeds");

    assert!(app.workflows.list_paused("sess-3").await.expect("list").is_empty());
    let state = app
        .workflows
        .load(&workflow_id)
        .await
        .expect("load")
        .expect("stored");
    assert_eq!(state.phase.as_str(), "completed");
    assert_eq!(state.executed_step_count, 2);

    let history = app
        .sessions
        .history_as_text("sess-3", 8)
        .await
        .expect("history");
    assert!(history.contains("ASSISTANT: please confirm which region to focus on"));
    assert!(history.contains("USER: Korea"));

    let err = commands::run::resume(&app, &workflow_id, "Japan", None, false)
        .await
        .expect_err("completed workflows cannot resume");
    assert!(err.contains("cannot be resumed"));
}

#[tokio::test]
async fn test_routing_only_plan_runs_selected_workers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(
        &dir,
        "cat > /dev/null; printf 'sns posts\\nAdditional Needs: none\\n'",
    );
    let app = App::bootstrap(config, true).await.expect("bootstrap");
    let path = dir.path().join("routed.yaml");
    std::fs::write(
        &path,
        "routing_hint:\n  selected_workers: [Worker_SNS, Worker_Web]\n",
    )
    .expect("write plan");
    let plan = path.to_string_lossy().to_string();

    commands::run::run(&app, &plan, "sess-5", "AI trends?", false)
        .await
        .expect("routed run succeeds");
    let turns = app.sessions.turns("sess-5").await.expect("turns");
    assert!(turns[1].text.contains("sns posts"));
    assert!(turns[1].text.contains("web articles"));

    let empty = dir.path().join("empty.yaml");
    std::fs::write(&empty, "raw_plan: nothing\n").expect("write plan");
    let empty = empty.to_string_lossy().to_string();
    assert!(commands::run::run(&app, &empty, "sess-5", "AI trends?", false)
        .await
        .is_err());
}

#[tokio::test]
async fn test_bootstrap_rejects_unknown_capability_owner() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(&dir, "cat > /dev/null; echo ok");
    config
        .capabilities
        .insert("web.search".to_string(), "Worker_Ghost".to_string());

    let err = App::bootstrap(config.clone(), true)
        .await
        .err()
        .expect("invalid config");
    assert!(err.contains("Worker_Ghost"));
    assert!(commands::workers::validate(&config, None).await.is_err());
}

#[tokio::test]
async fn test_validate_plan_against_catalog() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(&dir, "cat > /dev/null; echo ok");
    let plan = write_plan(&dir);
    commands::workers::validate(&config, Some(plan.as_str()))
        .await
        .expect("plan is valid");

    let bad = dir.path().join("bad.yaml");
    std::fs::write(
        &bad,
        "collaboration_plan:\n  steps:\n    - agent: Worker_Ghost\n      goal: haunt\n",
    )
    .expect("write plan");
    let bad = bad.to_string_lossy().to_string();
    let err = commands::workers::validate(&config, Some(bad.as_str()))
        .await
        .expect_err("unknown worker");
    assert!(err.contains("Worker_Ghost"));
}

#[tokio::test]
async fn test_new_session_archives_previous_audit_stream() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(
        &dir,
        "cat > /dev/null; printf 'sns posts\\nAdditional Needs: none\\n'",
    );
    let plan = write_plan(&dir);

    let app = App::bootstrap(config.clone(), true).await.expect("bootstrap");
    commands::run::run(&app, &plan, "sess-4", "first", false)
        .await
        .expect("run");
    drop(app);

    let app = App::bootstrap(config, true).await.expect("bootstrap again");
    let reader = AuditReader::new(&app.config.audit.log_dir);
    assert!(reader.active_session().await.expect("active").is_empty());
    let archives = reader.archives().await.expect("archives");
    assert_eq!(archives.len(), 1);
    let archived = reader.archived_events(&archives[0]).await.expect("archived");
    assert_eq!(archived[0].session_seq, 1);
}

#[test]
fn test_load_config_defaults_when_default_file_missing() {
    let config = commands::load_config("conductor.yaml").expect("defaults");
    assert_eq!(config.engine.coordinator_name, "MainAgent");
    assert!(commands::load_config("/nonexistent/conductor-custom.yaml").is_err());
}
