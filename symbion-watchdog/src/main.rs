//! Symbion Watchdog - process entry point
//!
//! Loads the config, connects the bus, runs the agent until ctrl-c or
//! SIGTERM. SIGHUP triggers an immediate config reload on unix.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use symbion_watchdog::{Agent, AgentConfig, ConfigSource, FileConfigSource, MqttBus};

#[derive(Debug, Parser)]
#[command(name = "symbion-watchdog", version, about = "Service monitoring agent")]
struct Cli {
    /// Agent config file (TOML, JSON or YAML)
    #[arg(short, long, env = "SYMBION_WATCHDOG_CONFIG")]
    config: Option<PathBuf>,

    /// Log level or filter directive, overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// Validate the config, print a summary and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let source = Arc::new(FileConfigSource::resolve(cli.config.clone()));
    let loaded = source.load().await;

    // Logging needs the config level, so set it up before reporting config errors
    let config_level = loaded.as_ref().map(|c| c.log_level.clone()).unwrap_or_else(|_| "info".into());
    init_logging(cli.log_level.as_deref(), &config_level);

    let config = loaded.with_context(|| format!("Failed to load config from {}", source.describe()))?;

    if cli.check_config {
        print_summary(&config);
        return Ok(());
    }

    info!("🐕 Symbion Watchdog starting (agent {})", config.agent_id);

    let bus = MqttBus::connect(&config.bus)
        .await
        .context("Failed to connect to the bus")?;

    let grace = config.shutdown_grace;
    let agent = Agent::new(config, source, Arc::new(bus)).context("Failed to create agent")?;
    agent.start().await.context("Failed to start agent")?;

    wait_for_shutdown(&agent).await;

    let report = agent.stop(grace).await;
    if !report.drained {
        info!(cancelled = report.cancelled, "shutdown cancelled in-flight checks");
    }
    info!("Symbion Watchdog stopped");
    Ok(())
}

fn init_logging(flag: Option<&str>, config_level: &str) {
    let filter = match flag {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config_level)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_summary(config: &AgentConfig) {
    println!("agent_id:        {}", config.agent_id);
    println!("report subject:  {}", config.report_subject());
    println!("report interval: {:?}", config.report_interval);
    println!("health probes:   {}:{}", config.health_bind, config.health_port);
    println!("bus:             {}:{}", config.bus.host, config.bus.port);
    println!("services:        {}", config.services.len());
    for service in &config.services {
        println!(
            "  - {} [{}] {} every {:?} (timeout {:?})",
            service.name,
            service.kind.label(),
            service.kind.target(),
            service.interval,
            service.timeout
        );
    }
}

#[cfg(unix)]
async fn wait_for_shutdown(agent: &Agent) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut terminate, mut hangup) = match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
        (Ok(terminate), Ok(hangup)) => (terminate, hangup),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "failed to install signal handlers, waiting for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, shutting down");
                return;
            }
            _ = terminate.recv() => {
                info!("SIGTERM received, shutting down");
                return;
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading config");
                // Rejections are logged by the agent
                let _ = agent.reload().await;
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_agent: &Agent) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
    }
    info!("ctrl-c received, shutting down");
}
