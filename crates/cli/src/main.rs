//! Command-line runner for sipflow scenarios.
//!
//! Runs flow documents against the in-process loopback endpoint and manages
//! the scenario database. Lifecycle events are printed as JSON lines so the
//! output can be piped into other tools.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sipflow_engine::testkit::{LoopbackNetwork, MemoryScenarioStore};
use sipflow_engine::{ChannelEventSink, Engine, EngineEvent, EventSink, ScenarioStore};
use sipflow_scenario_store::{SqliteScenarioRepository, DEFAULT_PROJECT_ID};

#[derive(Parser)]
#[command(name = "sipflow", version, about = "SIP call-flow scenario runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a flow document without running it
    Check {
        /// Path to a flow JSON file
        flow: PathBuf,
    },
    /// Run a flow document against the local loopback endpoint
    Run {
        /// Path to a flow JSON file
        flow: PathBuf,
        /// First candidate SIP port for instance allocation
        #[arg(long, default_value_t = 5060)]
        base_port: u16,
    },
    /// Manage the scenario database
    Db {
        /// Path to the SQLite database file
        #[arg(long, default_value = "scenarios.db")]
        db: PathBuf,
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Subcommand)]
enum DbCommand {
    /// List scenarios in a project
    List {
        #[arg(long, default_value = DEFAULT_PROJECT_ID)]
        project: String,
    },
    /// Create an empty scenario
    Create {
        name: String,
        #[arg(long, default_value = DEFAULT_PROJECT_ID)]
        project: String,
    },
    /// Replace a scenario's flow document from a file
    Import { id: String, flow: PathBuf },
    /// Print a scenario's flow document
    Export { id: String },
    /// Rename a scenario
    Rename { id: String, name: String },
    /// Delete a scenario
    Delete { id: String },
    /// Run a stored scenario against the local loopback endpoint
    Run {
        id: String,
        #[arg(long, default_value_t = 5060)]
        base_port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Check { flow } => check_flow(&flow),
        Command::Run { flow, base_port } => run_file(&flow, base_port).await,
        Command::Db { db, command } => run_db_command(&db, command).await,
    }
}

fn check_flow(path: &PathBuf) -> anyhow::Result<ExitCode> {
    let flow_data = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    match sipflow_engine::compile(&flow_data) {
        Ok(graph) => {
            println!(
                "{}: {} instance(s), {} node(s)",
                path.display(),
                graph.instances.len(),
                graph.nodes.len()
            );
            for id in graph.instance_ids_sorted() {
                if let Some(chain) = graph.instance(&id) {
                    println!(
                        "  {} ({}): {} start node(s)",
                        id,
                        chain.config.label,
                        chain.start_nodes.len()
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            eprintln!("{}: {err}", path.display());
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_file(path: &PathBuf, base_port: u16) -> anyhow::Result<ExitCode> {
    let flow_data = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;

    let store = MemoryScenarioStore::new();
    store.insert("cli", "cli run", &flow_data);
    run_scenario(Arc::new(store), "cli", base_port).await
}

async fn run_db_command(db: &PathBuf, command: DbCommand) -> anyhow::Result<ExitCode> {
    let repo = SqliteScenarioRepository::open(db)
        .await
        .with_context(|| format!("opening {}", db.display()))?;

    match command {
        DbCommand::List { project } => {
            for scenario in repo.list(&project).await? {
                println!(
                    "{}  {}  (updated {})",
                    scenario.id,
                    scenario.name,
                    scenario.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        DbCommand::Create { name, project } => {
            let created = repo.create(&project, &name).await?;
            println!("{}", created.id);
        }
        DbCommand::Import { id, flow } => {
            let flow_data = std::fs::read_to_string(&flow)
                .with_context(|| format!("reading {}", flow.display()))?;
            repo.save_flow(&id, &flow_data).await?;
        }
        DbCommand::Export { id } => {
            let scenario = repo.load(&id).await?;
            println!("{}", scenario.flow_data);
        }
        DbCommand::Rename { id, name } => repo.rename(&id, &name).await?,
        DbCommand::Delete { id } => repo.delete(&id).await?,
        DbCommand::Run { id, base_port } => {
            return run_scenario(Arc::new(repo), &id, base_port).await;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Run one scenario to completion, printing each lifecycle event as a
/// `{name} {payload}` JSON line. Exits non-zero when the run fails.
async fn run_scenario(
    store: Arc<dyn ScenarioStore>,
    scenario_id: &str,
    base_port: u16,
) -> anyhow::Result<ExitCode> {
    let (sink, mut events) = ChannelEventSink::new();
    let sink: Arc<dyn EventSink> = Arc::new(sink);
    let engine = Engine::with_base_port(
        store,
        Arc::new(LoopbackNetwork::new()),
        sink,
        base_port,
    );

    engine.start_scenario(scenario_id).await?;

    while let Some(event) = events.recv().await {
        println!("{} {}", event.name(), event.payload());
        match event {
            EngineEvent::ScenarioCompleted { .. } | EngineEvent::ScenarioStopped { .. } => {
                return Ok(ExitCode::SUCCESS);
            }
            EngineEvent::ScenarioFailed { .. } => return Ok(ExitCode::FAILURE),
            _ => {}
        }
    }
    anyhow::bail!("event stream ended before the scenario finished")
}
