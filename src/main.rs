//! chartd - State-chart execution engine
//!
//! Runs a chart to completion and prints its result. With persistence
//! enabled, an interrupted session can be resumed by running it again under
//! the same session id.

use chartd_core::{Event, EventName, SessionId, Value};
use chartd_engine::{ChartSource, Config, EngineError, Host, HostOptions};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chartd")]
#[command(about = "State-chart execution engine with resumable sessions")]
#[command(version)]
struct Cli {
    /// Data directory (overrides the configured one)
    #[arg(long, env = "CHARTD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a chart and print its result as JSON
    Run {
        /// Chart definition (JSON)
        chart: PathBuf,

        /// Session id; reusing one resumes a suspended session
        #[arg(short, long)]
        session: Option<String>,

        /// Arguments overriding top-level data (JSON object)
        #[arg(short, long)]
        args: Option<String>,

        /// External event to send once the session has started (repeatable)
        #[arg(short, long = "event")]
        events: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Load configuration (from file if CHARTD_CONFIG is set, then env overrides)
    let mut config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            if std::env::var("CHARTD_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }

    match cli.command {
        Commands::Run {
            chart,
            session,
            args,
            events,
        } => run(&config, chart, session, args, events).await,
    }
}

async fn run(
    config: &Config,
    chart: PathBuf,
    session: Option<String>,
    args: Option<String>,
    events: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let events = events
        .iter()
        .map(|name| EventName::parse(name))
        .collect::<Result<Vec<_>, _>>()?;
    let text = std::fs::read_to_string(&chart)?;
    let arguments = match args {
        Some(json) => Value::from_json(&serde_json::from_str(&json)?),
        None => Value::Undefined,
    };

    tracing::info!("  Chart: {}", chart.display());
    tracing::info!("  Persistence: {:?}", config.storage.persistence);
    tracing::info!("  Data directory: {}", config.storage.data_dir.display());

    let host = Host::new(HostOptions::from_config(config)?);

    // Suspend on Ctrl-C so the session can be resumed later
    let stopping = host.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, suspending sessions...");
        stopping.stop_host().await;
    });

    let outcome = execute(&host, text, session, arguments, events).await;
    host.shutdown().await;

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result.to_json())?);
            Ok(())
        }
        Err(EngineError::Suspended) => {
            tracing::info!("Session suspended");
            Ok(())
        }
        Err(e) => {
            tracing::error!("Session failed: {}", e);
            Err(e.into())
        }
    }
}

async fn execute(
    host: &Host,
    text: String,
    session: Option<String>,
    arguments: Value,
    events: Vec<EventName>,
) -> Result<Value, EngineError> {
    let controller = host
        .create_and_add_state_machine(
            ChartSource::Text(text),
            session.map(SessionId::new),
            arguments,
        )
        .await?;
    let session_id = controller.session_id().clone();
    tracing::info!("  Session: {}", session_id);

    host.start_state_machine(&session_id).await?;
    for name in events {
        if let Err(e) = controller.send(Event::external(name)) {
            tracing::warn!("Event not delivered: {}", e);
        }
    }
    let outcome = controller.result().await;

    match host.destroy_state_machine(&session_id).await {
        Ok(()) | Err(EngineError::UnknownSession { .. }) => {}
        Err(e) => tracing::warn!("Cleanup failed: {}", e),
    }
    outcome
}
