//! DiskHealth Agent - cross-platform disk health monitoring service
//!
//! Periodically reads the storage health facility of the host, classifies
//! every physical disk as safe / warning / error and publishes the verdicts:
//! - smartctl JSON on Unix-like hosts, PowerShell Storage module on Windows
//! - Rule-based classification with tunable thresholds
//! - InfluxDB v2 points, optionally mirrored on MQTT
//!
//! Exit codes: 0 after a stop signal, 1 on startup failure, 3 when a tick
//! could not classify any device.

mod classify;
mod collector;
mod config;
mod error;
mod privilege;
mod publisher;
mod record;
mod scheduler;
#[cfg(test)]
mod testing;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use classify::Verdict;
use config::AgentConfig;
use publisher::{InfluxPublisher, MqttPublisher, PointTags, Publisher, PublisherSet};
use scheduler::{DeviceOutcome, ExitReason, Scheduler, Shutdown, TickReport};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_STARTUP_FAILURE: u8 = 1;
/// `--once` could not classify a single device
const EXIT_NO_DEVICE: u8 = 1;
const EXIT_DEGRADED: u8 = 3;

#[derive(Debug, Parser)]
#[command(name = "diskhealth-agent", version, about = "Disk health monitoring agent")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, env = "CONFIG_PATH", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Run a single poll, print the verdicts and exit
    #[arg(long)]
    once: bool,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cfg!(windows) {
        tracing_subscriber::fmt().with_env_filter(filter).with_ansi(false).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    }
}

fn exit_status(reason: ExitReason) -> u8 {
    match reason {
        ExitReason::Cancelled => 0,
        ExitReason::Degraded => EXIT_DEGRADED,
    }
}

fn once_status(report: &TickReport) -> u8 {
    if report.classified() > 0 {
        0
    } else {
        EXIT_NO_DEVICE
    }
}

/// Stop the scheduler on SIGINT / SIGTERM
#[cfg(unix)]
async fn wait_for_signal(shutdown: Shutdown) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut terminate, mut interrupt) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(terminate), Ok(interrupt)) => (terminate, interrupt),
        (Err(e), _) | (_, Err(e)) => {
            warn!("Cannot install signal handlers: {}", e);
            return;
        }
    };

    tokio::select! {
        _ = terminate.recv() => info!("SIGTERM received"),
        _ = interrupt.recv() => info!("SIGINT received"),
    }
    shutdown.stop();
}

/// Stop the scheduler on Ctrl-C / service stop
#[cfg(not(unix))]
async fn wait_for_signal(shutdown: Shutdown) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for Ctrl-C: {}", e);
        return;
    }
    info!("Ctrl-C received");
    shutdown.stop();
}

fn print_report(report: &TickReport) {
    if let Some(reason) = &report.enumeration_error {
        println!("enumeration failed: {}", reason);
        return;
    }
    for outcome in &report.outcomes {
        match outcome {
            DeviceOutcome::Classified { classification, temperature_celsius, .. } => {
                let temperature = temperature_celsius.map(|t| format!("{}°C", t)).unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\t{}\t{}",
                    classification.device_name, classification.verdict, temperature, classification.reason
                );
            }
            DeviceOutcome::Failed { device, stage, error } => {
                println!("{}\t{}\t-\t{} failed: {}", device, Verdict::Unknown, stage, error);
            }
            DeviceOutcome::Skipped { device } => println!("{}\t{}\t-\tskipped", device, Verdict::Unknown),
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    info!(
        platform = privilege::platform_name(),
        "DiskHealth Agent v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let path = AgentConfig::resolve_path(cli.config)?;
    let config = AgentConfig::load(&path)
        .await
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    info!("Configuration loaded from {}", path.display());

    let collector = collector::for_host(config.query_timeout())
        .ok_or_else(|| anyhow!("Unsupported platform: {}", privilege::platform_name()))?;

    privilege::ensure_privileged().await?;

    let tags = PointTags {
        host: config.hostname(),
        client: config.agent.client.clone(),
    };

    let mut sinks = PublisherSet::new().with(Box::new(
        InfluxPublisher::new(config.influx_target(), tags.clone()).context("Failed to create InfluxDB publisher")?,
    ));
    if let Some(target) = config.mqtt_target(&tags.host) {
        sinks = sinks.with(Box::new(MqttPublisher::connect(target, tags.clone())));
    }
    info!(
        host = %tags.host,
        client = %tags.client,
        collector = collector.name(),
        "Publishing to {:?}",
        sinks.sink_names()
    );
    let publisher: Arc<dyn Publisher> = Arc::new(sinks);

    let mut scheduler = Scheduler::new(
        collector,
        publisher.clone(),
        config.policy.clone(),
        config.scheduler_settings(),
    );

    let shutdown = Shutdown::new();
    let signals = tokio::spawn(wait_for_signal(shutdown.clone()));

    let code = if cli.once {
        let report = scheduler.run_tick(&shutdown.token()).await;
        report.log_summary();
        print_report(&report);
        once_status(&report)
    } else {
        exit_status(scheduler.run(&shutdown).await)
    };

    signals.abort();
    publisher.close().await;
    info!("DiskHealth Agent stopped");
    Ok(ExitCode::from(code))
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(EXIT_STARTUP_FAILURE)
        }
    }
}
