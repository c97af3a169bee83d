//! `conductor workers` and `conductor validate`.

use conductor_core::workflow::{CapabilityRegistry, Plan, WorkerTransport};
use conductor_core::ConductorConfig;

/// List configured workers and the capability table.
pub async fn list(config: &ConductorConfig) -> Result<(), String> {
    let catalog = config.build_catalog().map_err(|e| e.to_string())?;
    if catalog.is_empty() {
        println!("No workers configured");
        return Ok(());
    }

    println!("┌──────────────────────┬──────────┬──────────────────────────────────────────┐");
    println!("│ Worker               │ Kind     │ Tools                                    │");
    println!("├──────────────────────┼──────────┼──────────────────────────────────────────┤");
    for worker in catalog.descriptors() {
        let kind = match &worker.transport {
            WorkerTransport::Local { command: Some(_) } => "command",
            WorkerTransport::Local { command: None } => "local",
            WorkerTransport::Remote { .. } => "remote",
        };
        println!(
            "│ {:<20} │ {:<8} │ {:<40} │",
            truncate(&worker.name, 20),
            kind,
            truncate(&worker.tools.join(", "), 40)
        );
    }
    println!("└──────────────────────┴──────────┴──────────────────────────────────────────┘");

    let registry = CapabilityRegistry::from_table(config.capabilities.clone());
    let owners = registry.snapshot().await;
    if !owners.is_empty() {
        println!();
        println!("Capability owners:");
        for (capability, owner) in owners {
            println!("  {} -> {}", capability, owner);
        }
    }
    Ok(())
}

/// Validate the configuration and, optionally, a plan file against it.
pub async fn validate(config: &ConductorConfig, plan_file: Option<&str>) -> Result<(), String> {
    let catalog = config.build_catalog().map_err(|e| e.to_string())?;
    config.validate(&catalog).map_err(|e| e.to_string())?;
    println!(
        "Configuration is valid ({} worker(s), {} capability owner(s))",
        catalog.len(),
        config.capabilities.len()
    );

    let Some(path) = plan_file else {
        return Ok(());
    };
    let plan = Plan::from_file(path).map_err(|e| e.to_string())?;
    let unknown: Vec<&str> = plan
        .steps()
        .iter()
        .map(|s| s.agent.as_str())
        .filter(|agent| !catalog.contains(agent))
        .collect();

    println!("Plan '{}': {} step(s)", path, plan.steps().len());
    for (i, step) in plan.steps().iter().enumerate() {
        println!("  {}. {}: {}", i + 1, step.agent, step.goal);
    }
    if !unknown.is_empty() {
        return Err(format!("Plan names unknown worker(s): {}", unknown.join(", ")));
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}
