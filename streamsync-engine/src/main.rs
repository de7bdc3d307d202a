//! Stream engine simulator (streamsync-sim) - Main entry point
//!
//! Drives a deterministic scenario through the sync or gapless engine the
//! way a graph scheduler would and prints one report line per cycle.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod sim;

use sim::{EngineKind, Simulator};
use streamsync_engine::config::{EngineConfig, LoggingConfig};

/// Command-line arguments for streamsync-sim
#[derive(Parser, Debug)]
#[command(name = "streamsync-sim")]
#[command(about = "Scheduler simulator for the stream composition engines")]
#[command(version)]
struct Args {
    /// Engine to exercise
    #[arg(short, long, value_enum, default_value = "sync")]
    engine: EngineKind,

    /// Configuration file
    #[arg(short, long, env = "STREAMSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Number of scheduler cycles
    #[arg(long, default_value = "24")]
    cycles: u64,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config =
        EngineConfig::resolve(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging)?;

    info!(
        "streamsync-sim {} ({}, built {} [{}])",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let mut simulator =
        Simulator::new(args.engine, &config, args.cycles).context("Failed to set up simulation")?;
    let reports = simulator.run()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for report in &reports {
            let status = report
                .error
                .as_deref()
                .or(report.outcome.as_deref())
                .unwrap_or("skipped");
            println!(
                "cycle {:>3} {:<22} consumed {:?} produced {:?} eof {:?} markers {:?} events {:?}",
                report.cycle,
                status,
                report.consumed,
                report.produced,
                report.end_of_frame,
                report.markers,
                report.events
            );
        }
    }
    Ok(())
}

/// Logs go to stderr, or to the configured file. `RUST_LOG` overrides the
/// configured level.
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "streamsync_sim={0},streamsync_engine={0},streamsync_common={0}",
            logging.level
        ))
    });

    let file_layer = match &logging.file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {:?}", path))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    let stderr_layer = logging
        .file
        .is_none()
        .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}
