//! Underwrite CLI: run one loan application through a declared pattern and
//! print the decision.
//!
//! The LLM provider is an external collaborator; this host drives the
//! pipeline from a replay file of scripted provider turns, which is also how
//! operators rehearse configuration changes without network access.
//!
//! Exit codes: 0 on a completed run, 2 on configuration errors, 3 on an
//! aborted run or other runtime failure.

mod replay;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use underwrite::agent::AgentRegistry;
use underwrite::audit::{AuditRecorder, JsonlSink};
use underwrite::config::RuntimeConfig;
use underwrite::engine::Orchestrator;
use underwrite::ledger::TerminalState;
use underwrite::mcp::ClientPool;
use underwrite::schema::SchemaRegistry;

const EXIT_CONFIG: u8 = 2;
const EXIT_RUNTIME: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "underwrite")]
#[command(about = "Run loan applications through the multi-agent pipeline")]
struct Args {
    #[command(subcommand)]
    cmd: Command,

    /// Verbose: debug-level logs from the runtime
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one application through a pattern and print the decision as JSON
    Run {
        /// Runtime configuration document (YAML)
        #[arg(long, value_name = "PATH")]
        config: PathBuf,

        /// Loan application record (JSON)
        #[arg(long, value_name = "PATH")]
        application: PathBuf,

        /// Pattern id to execute
        #[arg(long, default_value = "loan_processing")]
        pattern: String,

        /// Scripted provider turns (JSON array), consumed in order
        #[arg(long, value_name = "PATH")]
        replay: PathBuf,

        /// Append one audit record per run to this JSONL file
        #[arg(long, value_name = "PATH")]
        audit_log: Option<PathBuf>,

        /// Pretty-print the decision
        #[arg(long)]
        pretty: bool,
    },
}

enum CliError {
    Config(String),
    Runtime(String),
}

impl CliError {
    fn code(&self) -> u8 {
        match self {
            CliError::Config(_) => EXIT_CONFIG,
            CliError::Runtime(_) => EXIT_RUNTIME,
        }
    }

    fn message(&self) -> &str {
        match self {
            CliError::Config(m) | CliError::Runtime(m) => m,
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "underwrite=debug,cli=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = config::layer_process_env(None) {
        eprintln!("underwrite: environment config: {e}");
        return ExitCode::from(EXIT_CONFIG);
    }
    init_tracing(args.verbose);

    match args.cmd {
        Command::Run {
            config,
            application,
            pattern,
            replay,
            audit_log,
            pretty,
        } => match run(config, application, pattern, replay, audit_log, pretty).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("underwrite: {}", e.message());
                ExitCode::from(e.code())
            }
        },
    }
}

async fn run(
    config_path: PathBuf,
    application_path: PathBuf,
    pattern: String,
    replay_path: PathBuf,
    audit_log: Option<PathBuf>,
    pretty: bool,
) -> Result<ExitCode, CliError> {
    let runtime_config = RuntimeConfig::load(&config_path)
        .map_err(|e| CliError::Config(format!("load {}: {e}", config_path.display())))?;
    let application_text = std::fs::read_to_string(&application_path)
        .map_err(|e| CliError::Config(format!("read {}: {e}", application_path.display())))?;
    let application = serde_json::from_str(&application_text)
        .map_err(|e| CliError::Config(format!("parse {}: {e}", application_path.display())))?;
    let provider = Arc::new(
        replay::load_provider(&replay_path)
            .map_err(|e| CliError::Config(format!("load {}: {e}", replay_path.display())))?,
    );

    let persona_root = config_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let schemas = SchemaRegistry::builtin();
    let pool = Arc::new(ClientPool::new(runtime_config.tool_servers.clone()));
    let registry = Arc::new(
        AgentRegistry::new(&runtime_config, &schemas, pool, provider, &persona_root)
            .map_err(|e| CliError::Config(e.to_string()))?,
    );

    let mut engine = Orchestrator::new(registry, runtime_config.patterns.clone());
    let mut audit_task = None;
    if let Some(path) = audit_log {
        let (recorder, task) = AuditRecorder::spawn(Arc::new(JsonlSink::new(path)));
        engine = engine.with_audit(recorder);
        audit_task = Some(task);
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; cancelling run");
            signal_cancel.cancel();
        }
    });

    let outcome = engine
        .run(&pattern, application, cancel)
        .await
        .map_err(|e| CliError::Runtime(e.to_string()))?;

    let rendered = if pretty {
        serde_json::to_string_pretty(&outcome.decision)
    } else {
        serde_json::to_string(&outcome.decision)
    }
    .map_err(|e| CliError::Runtime(e.to_string()))?;
    println!("{rendered}");

    // Let the audit consumer drain before exiting.
    drop(engine);
    if let Some(task) = audit_task {
        let _ = task.await;
    }

    Ok(match outcome.ledger.terminal_state {
        TerminalState::Completed => ExitCode::SUCCESS,
        _ => ExitCode::from(EXIT_RUNTIME),
    })
}
