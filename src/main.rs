use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use waypoint_core::config::AppConfig;
use waypoint_core::event::EventBus;
use waypoint_core::traits::CheckpointStore;
use waypoint_core::types::{Request, ResponseStatus, SessionId};

use waypoint_engine::{ComplianceEngine, GraphCoordinator, SessionManager, WorkflowClassifier};
use waypoint_gateway::{registry_from_config, AgentGateway};
use waypoint_store::{JsonlAuditSink, MemoryConversationStore, SqliteCheckpointStore};

#[derive(Parser)]
#[command(name = "waypoint", version, about = "Compliance-gated workflow orchestration for agent pipelines")]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "WAYPOINT_CONFIG", default_value = "waypoint.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Handle one request and print the response
    Run {
        /// Continue an existing session
        #[arg(short, long)]
        session: Option<String>,
        /// Request context entry, repeatable (e.g. --context workflow=maintenance)
        #[arg(long = "context", value_parser = parse_key_val)]
        context: Vec<(String, String)>,
        /// Cancel the request after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
        /// Requester id recorded on the run
        #[arg(long, default_value = "cli")]
        requester: String,
        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
        /// The query (read from stdin when omitted)
        #[arg(trailing_var_arg = true)]
        query: Vec<String>,
    },
    /// List the checkpoints of a session
    History {
        #[arg(short, long)]
        session: String,
    },
    /// Print a checkpointed run state as JSON
    Inspect {
        #[arg(short, long)]
        session: String,
        /// Step to load (latest when omitted)
        #[arg(long)]
        step: Option<u64>,
    },
    /// List sessions with checkpoints
    Sessions,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("waypoint=info,warn")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "waypoint", &mut io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    if let Commands::Config = &cli.command {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let manager = build_manager(&config)?;

    match cli.command {
        Commands::Run {
            session,
            context,
            deadline_secs,
            requester,
            json,
            query,
        } => {
            let mut text = query.join(" ");
            if text.trim().is_empty() {
                io::stdin().read_to_string(&mut text)?;
            }
            let text = text.trim();
            if text.is_empty() {
                anyhow::bail!("empty query");
            }

            let mut request = Request::new(requester, text);
            for (key, value) in context {
                request = request.with_context(key, value);
            }
            if let Some(session) = session {
                request = request.with_session(SessionId::from_string(session));
            }
            if let Some(secs) = deadline_secs {
                request = request.with_deadline(Duration::from_secs(secs));
            }

            let response = manager.respond(request).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("{}", response.body);
                eprintln!();
                eprintln!("session: {}", response.session);
                eprintln!("status:  {}", response.status);
                if let Some(workflow) = response.workflow {
                    eprintln!("workflow: {}", workflow);
                }
                for v in &response.violations {
                    eprintln!("violation: [{}] {} {}", v.severity, v.rule_id, truncate(&v.span, 80));
                }
                if response.degraded {
                    eprintln!("note: partial result");
                }
            }

            if matches!(response.status, ResponseStatus::Error | ResponseStatus::Cancelled) {
                std::process::exit(1);
            }
        }
        Commands::History { session } => {
            let history = manager.history(&SessionId::from_string(session.as_str())).await?;
            if history.is_empty() {
                println!("No checkpoints for session {}", session);
            }
            for checkpoint in history {
                let state = checkpoint.state()?;
                println!(
                    "{:>4}  {:<20} {:<22} turn {:<3} {}",
                    checkpoint.step_index,
                    state.completed_steps.last().map(String::as_str).unwrap_or("-"),
                    checkpoint.workflow_type,
                    state.turn,
                    checkpoint.written_at.format("%Y-%m-%d %H:%M:%S%.3f"),
                );
            }
        }
        Commands::Inspect { session, step } => {
            let state = manager
                .inspect(&SessionId::from_string(session), step)
                .await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Sessions => {
            for session in manager.coordinator().store().sessions().await? {
                println!("{}", session);
            }
        }
        Commands::Config | Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Load the config file, falling back to ~/.waypoint/config.toml, then defaults.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    if let Some(home_config) = dirs_home().map(|h| h.join(".waypoint").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }

    warn!(path = %path.display(), "No config file found, using defaults");
    Ok(AppConfig::default())
}

fn build_manager(config: &AppConfig) -> anyhow::Result<SessionManager> {
    let store = Arc::new(SqliteCheckpointStore::open(&config.checkpoint_path())?);
    let audit = Arc::new(JsonlAuditSink::open(&config.audit_path())?);

    let registry = registry_from_config(&config.gateway);
    if registry.is_empty() {
        warn!("No agents configured under [gateway.agents]; every agent call will fail");
    } else {
        info!(roles = ?registry.roles(), "Agents registered");
    }

    let event_bus = Arc::new(EventBus::default());
    let coordinator = GraphCoordinator::new(
        Arc::new(AgentGateway::new(registry, config.gateway.clone())),
        Arc::new(ComplianceEngine::with_builtins(&config.compliance)),
        store,
        event_bus.clone(),
        config,
    )
    .with_audit(audit);

    Ok(
        SessionManager::new(WorkflowClassifier::with_defaults(), coordinator, event_bus, config)
            .with_conversations(Arc::new(MemoryConversationStore::new())),
    )
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
