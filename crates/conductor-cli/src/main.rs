//! Conductor CLI: run plan files through the workflow engine.
//!
//! Workers, capabilities and the planning collaborator come from
//! `conductor.yaml`; state and conversation history live in SQLite.

use clap::{Parser, Subcommand};

use conductor_cli::app::App;
use conductor_cli::commands;

/// Conductor: multi-worker workflow execution engine
#[derive(Parser)]
#[command(name = "conductor", version, about = "Conductor: multi-worker workflow execution engine")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, short = 'c', env = "CONDUCTOR_CONFIG", default_value = "conductor.yaml")]
    config: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan file for a user request
    Run {
        /// Path to the plan (YAML or JSON)
        plan: String,
        /// The user's request the plan answers
        #[arg(long, short = 'r')]
        request: String,
        /// Conversation session (a new one is created if omitted)
        #[arg(long, short = 's', env = "CONDUCTOR_SESSION")]
        session: Option<String>,
    },

    /// Answer a paused workflow's clarification question
    Resume {
        /// Workflow id printed when the workflow paused
        workflow_id: String,
        /// The answer to the question
        answer: String,
        /// Session override (defaults to the workflow's session)
        #[arg(long, short = 's')]
        session: Option<String>,
    },

    /// List paused workflows of a session
    Paused {
        #[arg(long, short = 's', env = "CONDUCTOR_SESSION")]
        session: String,
    },

    /// Validate the configuration and optionally a plan file
    Validate {
        /// Plan file to check against the worker catalog
        plan: Option<String>,
    },

    /// List configured workers and capability owners
    Workers,

    /// Inspect the audit log
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
}

#[derive(Subcommand)]
enum AuditAction {
    /// Show the latest records of the active session
    Tail {
        /// Only records from this component
        #[arg(long)]
        component: Option<String>,
        /// Only records with this action
        #[arg(long)]
        action: Option<String>,
        /// Number of records to show
        #[arg(long, short = 'n', default_value_t = 50)]
        limit: usize,
    },
    /// List archived sessions, or show one
    Archives {
        /// Archive folder name to print
        show: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conductor_core=info,conductor_cli=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Some(command) => dispatch(command, &cli.config, cli.json).await,
        None => {
            use clap::CommandFactory;
            Cli::command().print_help().ok();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn dispatch(command: Commands, config_path: &str, json: bool) -> Result<(), String> {
    let config = commands::load_config(config_path)?;

    match command {
        Commands::Run {
            plan,
            request,
            session,
        } => {
            let session = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let app = App::bootstrap(config, true).await?;
            commands::run::run(&app, &plan, &session, &request, json).await
        }
        Commands::Resume {
            workflow_id,
            answer,
            session,
        } => {
            let app = App::bootstrap(config, true).await?;
            commands::run::resume(&app, &workflow_id, &answer, session.as_deref(), json).await
        }
        Commands::Paused { session } => {
            let app = App::bootstrap(config, false).await?;
            commands::run::paused(&app, &session).await
        }
        Commands::Validate { plan } => commands::workers::validate(&config, plan.as_deref()).await,
        Commands::Workers => commands::workers::list(&config).await,
        Commands::Audit { action } => {
            let log_dir = config.audit.log_dir.clone();
            match action {
                AuditAction::Tail {
                    component,
                    action,
                    limit,
                } => commands::audit::tail(&log_dir, component, action, limit, json).await,
                AuditAction::Archives { show } => commands::audit::archives(&log_dir, show).await,
            }
        }
    }
}
