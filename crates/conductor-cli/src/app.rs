//! Wires a `ConductorConfig` into a ready-to-run executor.

use std::sync::Arc;
use std::time::Duration;

use conductor_core::audit::AuditLog;
use conductor_core::store::{SessionStore, WorkflowStore};
use conductor_core::workflow::{
    CapabilityRegistry, EngineSettings, HttpPlanningCollaborator, PhraseClassifier,
    StepDispatcher, WorkerCatalog, WorkflowExecutor,
};
use conductor_core::{ConductorConfig, Database};

/// Everything a command needs after startup.
pub struct App {
    pub config: ConductorConfig,
    pub catalog: Arc<WorkerCatalog>,
    pub executor: WorkflowExecutor,
    pub workflows: WorkflowStore,
    pub sessions: SessionStore,
    pub audit: AuditLog,
}

impl App {
    /// Build the engine from configuration.
    ///
    /// With `new_audit_session` the previous audit stream is archived and the
    /// sequence restarts at 1.
    pub async fn bootstrap(config: ConductorConfig, new_audit_session: bool) -> Result<Self, String> {
        let catalog = config.build_catalog().map_err(|e| e.to_string())?;
        config.validate(&catalog).map_err(|e| e.to_string())?;
        let catalog = Arc::new(catalog);

        let audit = AuditLog::open(&config.audit.log_dir)
            .await
            .map_err(|e| format!("Failed to open audit log '{}': {}", config.audit.log_dir, e))?;
        if new_audit_session {
            let start = audit.start_session(true).await.map_err(|e| e.to_string())?;
            if let Some(dir) = start.archive_dir {
                tracing::info!(
                    "[App] Archived {} audit record(s) to {:?}",
                    start.archived_records,
                    dir
                );
            }
        }

        let db = Database::open(&config.database.path).map_err(|e| e.to_string())?;

        let dispatcher = StepDispatcher::new(catalog.clone(), config.dispatch_config())
            .with_audit(audit.clone());
        let registry = CapabilityRegistry::from_table(config.capabilities.clone());
        let classifier = PhraseClassifier::new(config.engine.clarification_phrases.clone());

        let mut executor = WorkflowExecutor::new(
            catalog.clone(),
            dispatcher,
            registry,
            audit.clone(),
            WorkflowStore::new(db.clone()),
            EngineSettings::from(&config.engine),
        )
        .with_classifier(Arc::new(classifier));

        if let Some(planner) = &config.planner {
            tracing::info!("[App] Planning collaborator at {}", planner.endpoint);
            executor = executor.with_collaborator(Arc::new(HttpPlanningCollaborator::new(
                planner.endpoint.clone(),
                Duration::from_secs(planner.timeout_secs),
            )));
        }

        Ok(Self {
            config,
            catalog,
            executor,
            workflows: WorkflowStore::new(db.clone()),
            sessions: SessionStore::new(db),
            audit,
        })
    }
}
