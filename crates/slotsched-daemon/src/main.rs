//! slotsched daemon
//!
//! Main daemon process that runs the resource pools and serves the API.

use anyhow::Context;
use clap::Parser;
use slotsched_api::create_router;
use slotsched_core::{DaemonConfig, LoggingConfig, SchedulerType};
use slotsched_pool::{PoolSupervisor, ResourceManager};
use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, Level};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// slotsched daemon - slot scheduler for distributed training clusters
#[derive(Parser, Debug)]
#[command(name = "slotschedd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// RUST_LOG, when set, overrides the configured level
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let writer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_writer(writer);
    if std::env::var_os("RUST_LOG").is_some() {
        let subscriber = builder.with_env_filter(EnvFilter::from_default_env()).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = builder.with_max_level(parse_level(&config.level)).finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(())
}

/// Log what leaves the pools until a provisioner or pod manager is attached
fn spawn_output_loggers(manager: &ResourceManager, supervisor: &mut PoolSupervisor) {
    if let Some(mut updates) = supervisor.take_scaling_updates() {
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                info!(
                    pool = %update.resource_pool,
                    desired_new_instances = update.info.desired_new_instances,
                    agents = update.info.agents.len(),
                    "Scaling signal"
                );
            }
        });
    }

    for pool in manager
        .pools()
        .into_iter()
        .filter(|p| p.scheduler_type == SchedulerType::Kubernetes)
    {
        let Some(mut commands) = supervisor.take_pod_commands(&pool.name) else {
            continue;
        };
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                info!(pool = %pool.name, command = ?command, "Pod command");
            }
        });
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)?,
        None => DaemonConfig::default(),
    };
    if let Some(address) = args.address {
        config.api.address = address;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging)?;
    config.validate()?;

    info!("Starting slotsched daemon v{}", env!("CARGO_PKG_VERSION"));

    let (manager, mut supervisor) = ResourceManager::start(&config)?;
    spawn_output_loggers(&manager, &mut supervisor);
    info!(
        pools = config.resource_pools.len(),
        default_pool = %config.default_resource_pool,
        "Resource pools running"
    );

    let router = create_router(manager, config.api.cors_enabled);

    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("Invalid API address")?;
    info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    supervisor.shutdown().await?;
    info!("slotsched daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args() {
        Args::command().debug_assert();

        let args = Args::parse_from(["slotschedd", "--port", "9000", "--log-level", "debug"]);
        assert_eq!(args.port, Some(9000));
        assert!(args.config.is_none());
        assert_eq!(parse_level(args.log_level.as_deref().unwrap_or("")), Level::DEBUG);
        assert_eq!(parse_level("bogus"), Level::INFO);
    }
}
