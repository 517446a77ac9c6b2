//! Posture Service - supervised SensorTag capture.
//!
//! Run with: `cargo run -p posture-service -- export --label upright --duration 60`

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use posture_core::{BleTransport, CsvSink};
use posture_service::{Collector, Config, RunMode};

/// Posture Service - capture posture telemetry from worn SensorTags.
#[derive(Parser, Debug)]
#[command(name = "posture-service")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output.
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log warnings and errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Append labelled training rows to a CSV file.
    Export {
        /// Classification label written with every row.
        #[arg(short, long)]
        label: Option<String>,

        /// Run time in seconds.
        #[arg(short, long)]
        duration: Option<u64>,

        /// CSV output file (overrides config).
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Stream per-device JSON and publish merged records over MQTT.
    Live {
        /// Broker URL, e.g. `mqtt://192.168.1.20:1883`.
        #[arg(short, long, env = "POSTURE_BROKER")]
        broker: Option<String>,

        /// Directory of the per-device JSON files (overrides config).
        #[arg(long)]
        json_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        "debug"
    } else if args.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(format!("posture_service={level},posture_core={level}"))
            }),
        )
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    let mode = match args.command {
        Command::Export {
            label,
            duration,
            csv,
        } => {
            if label.is_some() {
                config.export.label = label;
            }
            if let Some(duration) = duration {
                config.export.duration_secs = duration;
            }
            if let Some(csv) = csv {
                config.export.csv_path = csv;
            }
            RunMode::Export
        }
        Command::Live { broker, json_dir } => {
            if let Some(broker) = broker {
                config.mqtt.broker = broker;
            }
            if let Some(json_dir) = json_dir {
                config.live.json_dir = json_dir;
            }
            RunMode::Live
        }
    };
    config.validate(mode)?;
    if mode == RunMode::Export {
        CsvSink::check_header(&config.export.csv_path, &config.export_columns()?)?;
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received, shutting down");
                    shutdown.cancel();
                }
                Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
            }
        });
    }

    info!("Opening Bluetooth adapter");
    let transport = Arc::new(BleTransport::new().await?);
    let collector = Collector::new(config, transport);

    match mode {
        RunMode::Export => collector.run_export(shutdown).await?,
        RunMode::Live => collector.run_live(shutdown).await?,
    }

    info!("Stopped");
    Ok(())
}
