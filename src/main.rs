//! Bhangmeter station - command line interface
//!
//! Usage:
//!   bhangmeter run                       # Start the station
//!   bhangmeter queue list                # Show persisted queue entries
//!   bhangmeter queue requeue <sequence>  # Retry an entry that was given up on
//!   bhangmeter config                    # Print the effective configuration
//!
//! `run` reads pin transitions from stdin on hosts without a detector board: a line
//! `ned` pulls the detector line low, `bist` pulls the self-test line low, `status`
//! prints the indicators and `ack` clears the fault indicator.

use anyhow::{Context, Result};
use bhangmeter::clock::MonotonicClock;
use bhangmeter::config::StationConfig;
use bhangmeter::health::{Diagnostics, DiagnosticsConfig};
use bhangmeter::queue::DeliveryQueue;
use bhangmeter::signal::{EdgeSource, Level};
use bhangmeter::station::{RunningStation, StationDeps};
use bhangmeter::tracing_setup::{self, TracingConfig};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "bhangmeter")]
#[command(about = "Bhangmeter event capture station", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = bhangmeter::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the capture and delivery pipeline
    Run,
    /// Inspect or repair the delivery queue (stop the station first)
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum QueueAction {
    /// List persisted entries
    List,
    /// Return a FAILED_PERMANENT entry to PENDING
    Requeue {
        /// Sequence number of the entry
        sequence: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = StationConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    tracing_setup::init(TracingConfig::from_logging(&config.logging)?)?;

    match cli.command {
        Commands::Run => run_station(config).await,
        Commands::Queue { action } => queue_command(config, action).await,
        Commands::Config => {
            print!("{}", config.to_redacted_toml()?);
            Ok(())
        }
    }
}

async fn run_station(config: StationConfig) -> Result<()> {
    let (deps, board) = StationDeps::from_config(&config)?;
    let clock: Arc<dyn MonotonicClock> = deps.clock.clone();
    let (station, mut timestamper) = RunningStation::start(&config, deps).await?;

    println!("📡 Station '{}' running - Press Ctrl+C to stop", config.station.name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if stdin_open => {
                let Some(line) = line? else {
                    stdin_open = false;
                    continue;
                };
                match line.trim() {
                    "ned" => {
                        let outcome = timestamper.on_level_change(EdgeSource::Detector, Level::Low, clock.now());
                        timestamper.on_level_change(EdgeSource::Detector, Level::High, clock.now());
                        println!("detector edge: {outcome:?}");
                    }
                    "bist" => {
                        let outcome = timestamper.on_level_change(EdgeSource::Bist, Level::Low, clock.now());
                        timestamper.on_level_change(EdgeSource::Bist, Level::High, clock.now());
                        println!("self-test edge: {outcome:?}");
                    }
                    "status" => {
                        println!("{:#?}", board.snapshot());
                        println!("{:#?}", station.diagnostics().counters());
                        println!("health: {:?}", station.diagnostics().system_health());
                    }
                    "ack" => {
                        station.diagnostics().acknowledge();
                        board.clear_fault();
                        println!("fault indicator cleared");
                    }
                    "" => {}
                    other => println!("unknown input '{other}' (ned, bist, status, ack)"),
                }
            }
        }
    }

    println!("\n👋 Station shutting down...");
    station.shutdown().await;
    Ok(())
}

async fn queue_command(config: StationConfig, action: QueueAction) -> Result<()> {
    let diagnostics = Arc::new(Diagnostics::new(DiagnosticsConfig {
        max_fault_history: config.status.fault_history,
    }));
    let queue = DeliveryQueue::open(
        &config.queue.dir,
        Duration::from_secs(config.queue.stuck_in_flight_secs),
        diagnostics,
    )
    .await?;

    match action {
        QueueAction::List => {
            let entries = queue.entries().await;
            println!(
                "{} entr{} in {} (last sequence {})",
                entries.len(),
                if entries.len() == 1 { "y" } else { "ies" },
                config.queue.dir.display(),
                queue.last_sequence().await
            );
            for entry in entries {
                println!(
                    "{:>8}  {:<16}  attempts={:<3} {}  {}",
                    entry.sequence(),
                    entry.state,
                    entry.attempts,
                    entry.event.event_id,
                    entry.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        QueueAction::Requeue { sequence } => {
            let entry = queue.requeue_failed(sequence).await?;
            println!("{} is {} again", entry.event.event_id, entry.state);
        }
    }
    Ok(())
}
