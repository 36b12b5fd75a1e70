//! spindle CLI - load units from a directory of manifests and build them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use spindle_core::app::{RuntimeStatus, SchedulerConfig, SchedulerRuntime};
use spindle_core::domain::{BuildAttempt, SchedulerEvent, UnitId, UnitStatus};
use spindle_core::impls::{FsUnitLoader, RecordingEventSink};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spindle")]
#[command(about = "Component dependency scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the bootstrap units and build everything reachable from them
    Run {
        /// Directory holding `<id>.json` unit manifests
        #[arg(long)]
        root: PathBuf,
        /// Semicolon-separated unit ids (`app/main;lib/extra`)
        #[arg(long)]
        bootstrap: String,
        /// Scheduler configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Include build attempts and scheduler events in the report
        #[arg(long)]
        verbose: bool,
    },
}

#[derive(Serialize)]
struct Report {
    runtime: RuntimeStatus,
    units: Vec<UnitStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attempts: Vec<BuildAttempt>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    events: Vec<SchedulerEvent>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            root,
            bootstrap,
            config,
            verbose,
        } => run(root, &bootstrap, config, verbose).await,
    }
}

async fn run(root: PathBuf, bootstrap: &str, config: Option<PathBuf>, verbose: bool) -> Result<()> {
    let config = match config {
        Some(path) => {
            let json = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading config {}", path.display()))?;
            SchedulerConfig::from_json(&json)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => SchedulerConfig::default(),
    };
    let ids = UnitId::parse_list(bootstrap)?;
    anyhow::ensure!(!ids.is_empty(), "--bootstrap names no unit");

    let sink = Arc::new(RecordingEventSink::new());
    let runtime = SchedulerRuntime::builder(Arc::new(FsUnitLoader::new(&root)))
        .config(config)
        .event_sink(sink.clone())
        .spawn()?;
    let handle = runtime.handle();

    info!(root = %root.display(), units = ids.len(), "bootstrapping");
    let loaded = handle.bootstrap(&ids).await;
    if let Err(e) = &loaded {
        warn!(error = %e, "bootstrap load failed");
    }
    let settled = handle.wait_idle().await;

    let report = Report {
        runtime: handle.status(),
        units: handle.snapshot().await?,
        error: settled.as_ref().err().map(ToString::to_string),
        attempts: if verbose { handle.attempts().await? } else { Vec::new() },
        events: if verbose { sink.events() } else { Vec::new() },
    };
    runtime.shutdown_and_join().await;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Err(e) = settled {
        error!(error = %e, "build did not complete");
        return Err(e.into());
    }
    loaded?;
    Ok(())
}
