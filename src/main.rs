//! CLI Entry Point for telemetry_daq
//!
//! Provides a command-line interface for:
//! - Running an acquisition session from `config/acquisition.toml`
//! - Listing the serial ports present on this machine
//!
//! # Usage
//!
//! Run a session until Ctrl-C:
//! ```bash
//! telemetry_daq run --experiment "walk test"
//! ```
//!
//! Run for 30 seconds with another configuration:
//! ```bash
//! telemetry_daq run --config lab.toml --duration 30
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::future;
use std::path::PathBuf;
use std::time::Duration;
use telemetry_daq::config::{AcquisitionConfig, DeviceType, DEFAULT_CONFIG_PATH};
use telemetry_daq::ports::{PortLister, SystemPorts};
use telemetry_daq::sink::open_sink;
use telemetry_daq::{build_session, tracing_setup, Response, SessionCoordinator};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "telemetry_daq")]
#[command(about = "Multi-device telemetry acquisition", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and start every configured device, logging until interrupted
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Experiment name, overriding the configured one
        #[arg(long)]
        experiment: Option<String>,

        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// List available serial ports
    Ports,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            experiment,
            duration,
        } => run_session(config, experiment, duration.map(Duration::from_secs)).await,
        Commands::Ports => list_ports(),
    }
}

fn list_ports() -> Result<()> {
    let ports = SystemPorts.available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

async fn run_session(
    config_path: PathBuf,
    experiment: Option<String>,
    duration: Option<Duration>,
) -> Result<()> {
    let mut config = AcquisitionConfig::load_from(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    if let Some(experiment) = experiment {
        config.session.experiment = experiment;
    }
    config.validate()?;
    tracing_setup::init_from_config(&config).map_err(anyhow::Error::msg)?;

    tracing::info!(
        app = %config.application.name,
        experiment = %config.session.experiment,
        output_dir = %config.session.output_dir.display(),
        started_at = %chrono::Local::now().to_rfc3339(),
        "Starting acquisition session"
    );

    let (sink_sender, sink_handle) = match open_sink(&config.sink)? {
        Some((sender, handle)) => (Some(sender), Some(handle)),
        None => (None, None),
    };

    let mut coordinator = build_session(&config, sink_sender.clone(), Box::new(SystemPorts))?;
    drop(sink_sender);

    for device in config.enabled_devices() {
        let port = match (&device.port, device.r#type) {
            (Some(port), _) => port.clone(),
            (None, DeviceType::Mock) => device.title.clone(),
            (None, _) => {
                tracing::warn!(device = %device.title, "No port configured, leaving disconnected");
                continue;
            }
        };
        coordinator.connect(&device.title, &port)?;
    }
    coordinator.start_all();

    let deadline = async {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            result = &mut interrupted => {
                result.context("waiting for Ctrl-C")?;
                tracing::info!("Interrupted");
                break;
            }
            _ = &mut deadline => {
                tracing::info!("Session duration elapsed");
                break;
            }
            next = coordinator.next_response() => match next {
                Some((title, response)) => report(&title, &response),
                None => break,
            },
        }
    }

    coordinator.stop_all();
    for title in coordinator.titles().into_iter().map(str::to_string).collect::<Vec<_>>() {
        if let Err(e) = coordinator.disconnect(&title) {
            tracing::warn!(device = %title, error = %e, "Disconnect not delivered");
        }
    }
    drain(&mut coordinator).await;

    for title in coordinator.titles() {
        tracing::info!(
            device = %title,
            samples = coordinator.sample_count(title).unwrap_or_default(),
            "Device summary"
        );
    }
    coordinator.shutdown(SHUTDOWN_TIMEOUT).await?;

    if let Some(handle) = sink_handle {
        match handle.shutdown(SHUTDOWN_TIMEOUT).await {
            Ok(written) => tracing::info!(written, "Live sink closed"),
            Err(e) => tracing::warn!(error = %e, "Live sink ended with an error"),
        }
    }

    tracing::info!("Session finished");
    Ok(())
}

/// Log responses that arrive until the workers go quiet.
async fn drain(coordinator: &mut SessionCoordinator) {
    while let Ok(Some((title, response))) =
        tokio::time::timeout(DRAIN_TIMEOUT, coordinator.next_response()).await
    {
        report(&title, &response);
    }
}

fn report(title: &str, response: &Response) {
    match response {
        Response::LogData(line) => tracing::info!(device = %title, "{line}"),
        Response::Error(detail) => tracing::error!(device = %title, "{detail}"),
        other if other.is_ok() => tracing::info!(device = %title, "{other}"),
        other => tracing::warn!(device = %title, "{other}"),
    }
}
