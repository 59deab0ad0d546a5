//! BMC health monitoring daemon entry point
//!
//! Samples CPU, memory and storage utilization on a fixed interval and
//! drives threshold alarms over the property-bus surface.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bmc_healthd::{
    config::{MonitorConfig, DEFAULT_CONFIG_PATH},
    error::Result,
    HealthService, PropertyBus,
};

/// BMC health daemon command line interface
#[derive(Parser)]
#[command(name = "bmc-healthd")]
#[command(about = "BMC health monitoring daemon")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Platform health metric configuration (JSON) override path
    #[arg(long)]
    health_config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available commands
#[derive(Subcommand)]
enum Commands {
    /// Run the monitoring loop (default)
    Start,

    /// Run a single sampling pass and print the property-bus snapshot
    Sample,

    /// Validate configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,
    },

    /// Health check of the daemon configuration and sources
    Health,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = initialize_logging(&cli) {
        eprintln!("Failed to initialize logging: {e}");
        process::exit(1);
    }

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            process::exit(1);
        }
    };

    let result = match &cli.command {
        Some(Commands::Start) | None => start_service(config).await,
        Some(Commands::Sample) => sample_once(config),
        Some(Commands::Config { show }) => handle_config(config, *show),
        Some(Commands::Health) => health_check(config),
    };

    if let Err(e) = result {
        error!("Command failed: {e}");
        process::exit(1);
    }
}

/// Initialize logging from CLI flags
fn initialize_logging(cli: &Cli) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("bmc_healthd={}", cli.log_level)));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }

    Ok(())
}

/// Load daemon configuration from file or defaults
fn load_configuration(cli: &Cli) -> Result<MonitorConfig> {
    let mut config = if let Some(path) = &cli.config {
        info!("Loading configuration from: {}", path.display());
        MonitorConfig::from_file(path)?
    } else {
        info!("Using configuration from {} or defaults", DEFAULT_CONFIG_PATH);
        MonitorConfig::load_default()?
    };

    if let Some(health_config) = &cli.health_config {
        config.monitor.health_config = Some(health_config.clone());
    }

    config.validate()?;
    Ok(config)
}

/// Run the monitoring loop until SIGTERM/SIGINT
async fn start_service(config: MonitorConfig) -> Result<()> {
    info!("Starting BMC health daemon");

    let mut service = HealthService::new(config)?;
    let shutdown = service.shutdown_handle();

    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            error!("Signal handling failed: {e}");
        }
        shutdown.send(true).ok();
    });

    service.run().await?;

    info!("BMC health daemon stopped");
    Ok(())
}

/// One-shot sampling pass, printing the resulting object snapshot
fn sample_once(config: MonitorConfig) -> Result<()> {
    let mut service = HealthService::new(config)?;
    let stats = service.sample_once();

    let snapshot = service.bus().snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    info!(
        updated = stats.metrics_updated,
        failures = stats.sampler_failures,
        "sampling pass complete"
    );
    Ok(())
}

/// Validate or show the effective configuration
fn handle_config(config: MonitorConfig, show: bool) -> Result<()> {
    if show {
        println!(
            "{}",
            toml::to_string_pretty(&config).map_err(|e| e.to_string())?
        );
    } else {
        config.validate()?;
        println!("Configuration is valid");
    }
    Ok(())
}

/// Check configuration and metric sources without starting the loop
fn health_check(config: MonitorConfig) -> Result<()> {
    println!("BMC Health Daemon Check");
    println!("=======================");

    print!("Daemon configuration: ");
    config.validate()?;
    println!("ok");

    print!("Metric configuration: ");
    let metric_configs =
        bmc_healthd::load_metric_configs(config.monitor.health_config.as_deref())?;
    let count: usize = metric_configs.values().map(Vec::len).sum();
    println!("ok ({count} metrics)");

    print!("Sampling pass: ");
    let mut service = HealthService::new(config)?;
    let stats = service.sample_once();
    if stats.sampler_failures > 0 {
        println!("{} sampler failure(s)", stats.sampler_failures);
    } else {
        println!("ok ({} metrics updated)", stats.metrics_updated);
    }

    Ok(())
}

/// Wait for SIGTERM or SIGINT
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, initiating graceful shutdown");
        }
    }

    Ok(())
}
