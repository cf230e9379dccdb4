use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod aggregate;
mod classify;
mod clock;
mod config;
mod db;
mod error;
mod evidence;
#[cfg(test)]
mod fixtures;
mod models;
mod normalize;
mod orchestrator;
mod pipeline;
mod report;
mod retry;
mod source;
mod store;
mod transport;

use crate::classify::Classifier;
use crate::clock::{Clock, SystemClock};
use crate::config::{AlertArgs, RecognitionArgs, Settings, StoreArgs};
use crate::evidence::{DirectorySnapshotSink, FixedLocation, LocationProvider, NoLocation};
use crate::orchestrator::{Collaborators, Orchestrator};
use crate::pipeline::Monitor;
use crate::source::{CsvSource, DetectorSource, JsonLinesSource, LandmarkSource};
use crate::store::{EvidenceStore, JsonlStore};
use crate::transport::{CommandTransport, ConsoleTransport, MessageTransport};

#[derive(Parser)]
#[command(name = "distress-signal")]
#[command(about = "Watches hand landmarks for distress gestures and raises alerts", long_about = None)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Watch a live stream of detector output
    Watch {
        /// Detector to spawn; frames are read from stdin when omitted
        #[arg(long, env = "DETECTOR_CMD")]
        detector_cmd: Option<PathBuf>,
        #[arg(long = "detector-arg")]
        detector_args: Vec<String>,
        /// Wait for the detector to print READY before reading frames
        #[arg(long)]
        wait_ready: bool,
        #[command(flatten)]
        recognition: RecognitionArgs,
        #[command(flatten)]
        alerts: AlertArgs,
    },
    /// Replay a landmark recording from a CSV file
    Replay {
        #[arg(long)]
        csv: PathBuf,
        #[command(flatten)]
        recognition: RecognitionArgs,
        #[command(flatten)]
        alerts: AlertArgs,
    },
    /// Generate a markdown incident report
    Report {
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Dispatch a recorded incident that never resolved
    Redeliver {
        #[arg(long)]
        incident: Uuid,
        #[command(flatten)]
        alerts: AlertArgs,
    },
}

async fn open_store(args: &StoreArgs) -> anyhow::Result<Arc<dyn EvidenceStore>> {
    match &args.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("failed to connect to Postgres")?;
            info!("evidence store: postgres");
            Ok(Arc::new(db::PgStore::new(pool)))
        }
        None => {
            let store = JsonlStore::open(&args.log_file).await?;
            info!(path = %store.path().display(), "evidence store: jsonl");
            Ok(Arc::new(store))
        }
    }
}

fn collaborators(
    alerts: &AlertArgs,
    settings: &Settings,
    store: Arc<dyn EvidenceStore>,
    clock: Arc<dyn Clock>,
) -> Collaborators {
    let transport: Arc<dyn MessageTransport> = match &alerts.transport_cmd {
        Some(program) => Arc::new(CommandTransport::new(
            program.clone(),
            alerts.transport_args.clone(),
        )),
        None => {
            warn!("no ALERT_TRANSPORT_CMD configured; alerts will only be shown locally");
            Arc::new(ConsoleTransport)
        }
    };
    let location: Arc<dyn LocationProvider> = match &settings.location {
        Some(location) => Arc::new(FixedLocation::new(location.clone())),
        None => Arc::new(NoLocation),
    };

    Collaborators {
        store,
        transport,
        location,
        snapshots: Arc::new(DirectorySnapshotSink::new(alerts.output_dir.clone())),
        clock,
    }
}

async fn monitor(
    source: &mut dyn LandmarkSource,
    settings: Settings,
    deps: Collaborators,
) -> anyhow::Result<()> {
    let mut orchestrator = Orchestrator::new(deps, settings.alerts.clone());
    if let Some(id) = orchestrator.resume_interrupted().await? {
        println!("Resuming interrupted incident {id}.");
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let alerts = tokio::spawn(orchestrator.run(rx));

    let monitor = Monitor::new(
        Classifier::new(settings.normalizer, settings.classifier),
        settings.aggregator,
        tx,
    );
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };
    // The orchestrator gets its shutdown grace even when intake failed.
    let intake = monitor.run(source, shutdown).await;
    let summary = alerts.await.context("alert orchestrator crashed")?;
    let stats = intake?;

    println!(
        "Processed {} frames, {} confirmations.",
        stats.frames, stats.confirmations
    );
    println!(
        "Alerts: {} dispatched, {} delivered, {} failed, {} suppressed.",
        summary.dispatched, summary.delivered, summary.failed, summary.suppressed
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "distress_signal=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Commands::InitDb => {
            let database_url = cli
                .store
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to a Postgres instance")?;
            let pool = PgPoolOptions::new()
                .max_connections(1)
                .connect(database_url)
                .await
                .context("failed to connect to Postgres")?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Watch {
            detector_cmd,
            detector_args,
            wait_ready,
            recognition,
            alerts,
        } => {
            let settings = Settings::from_args(Some(&recognition), &alerts)?;
            let store = open_store(&cli.store).await?;
            let deps = collaborators(&alerts, &settings, store, Arc::clone(&clock));

            let mut source: Box<dyn LandmarkSource> = match detector_cmd {
                Some(program) => Box::new(
                    DetectorSource::spawn(&program, &detector_args, wait_ready, clock).await?,
                ),
                None => Box::new(JsonLinesSource::new(
                    BufReader::new(tokio::io::stdin()),
                    clock,
                )),
            };
            monitor(source.as_mut(), settings, deps).await?;
        }
        Commands::Replay {
            csv,
            recognition,
            alerts,
        } => {
            let settings = Settings::from_args(Some(&recognition), &alerts)?;
            let store = open_store(&cli.store).await?;
            let mut source = CsvSource::from_path(&csv, clock.now())?;
            println!("Replaying {} frames from {}.", source.remaining(), csv.display());
            let deps = collaborators(&alerts, &settings, store, clock);
            monitor(&mut source, settings, deps).await?;
        }
        Commands::Report { out } => {
            let store = open_store(&cli.store).await?;
            let records = store.incidents().await?;
            let report = report::build_report(Utc::now(), &records);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Redeliver { incident, alerts } => {
            let settings = Settings::from_args(None, &alerts)?;
            let store = open_store(&cli.store).await?;
            let deps = collaborators(&alerts, &settings, store, clock);
            let mut orchestrator = Orchestrator::new(deps, settings.alerts);

            let state = orchestrator.redeliver(incident).await?;
            if state.is_terminal() {
                println!("Incident {incident} already {state}; nothing to do.");
            } else {
                for resolved in orchestrator.wait_idle().await {
                    println!("Incident {} is now {}.", resolved.id, resolved.state);
                }
            }
        }
    }

    Ok(())
}
