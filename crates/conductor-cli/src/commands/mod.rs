//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command. Commands that
//! execute workflows share the engine built by [`crate::app::App`].

pub mod audit;
pub mod run;
pub mod workers;

use std::path::Path;

use conductor_core::config::DEFAULT_CONFIG_FILE;
use conductor_core::workflow::WorkflowResult;
use conductor_core::ConductorConfig;

/// Load the config file. A missing default file means built-in defaults.
pub fn load_config(path: &str) -> Result<ConductorConfig, String> {
    if !Path::new(path).exists() && path == DEFAULT_CONFIG_FILE {
        tracing::info!("[Config] No {} found, using defaults", DEFAULT_CONFIG_FILE);
        return Ok(ConductorConfig::default());
    }
    ConductorConfig::from_file(path).map_err(|e| e.to_string())
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Human-readable rendering of a workflow result.
pub fn render_result(result: &WorkflowResult) -> String {
    match result {
        WorkflowResult::Completed {
            workflow_id,
            answer,
            degraded,
            executed_steps,
            ..
        } => {
            let mut out = format!(
                "Workflow {} completed ({} step(s){})\n\n",
                workflow_id,
                executed_steps,
                if *degraded { ", degraded" } else { "" }
            );
            out.push_str(answer);
            out
        }
        WorkflowResult::Paused {
            workflow_id,
            question,
            ..
        } => format!(
            "Workflow {} is waiting for your answer:\n  {}\n\nResume with: conductor resume {} \"<answer>\"",
            workflow_id, question, workflow_id
        ),
        WorkflowResult::Failed { workflow_id, error } => format!(
            "Workflow {} failed ({:?}): {}",
            workflow_id, error.kind, error.message
        ),
    }
}
