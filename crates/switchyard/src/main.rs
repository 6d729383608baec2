use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use switchyard::{BrokerSession, RelayEngine};
use yardconf::SwitchyardConfig;

/// Switchyard - MQTT RPC runtime and multi-broker relay
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to a JSON config file (overrides the local switchyard.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// OTLP gRPC endpoint for OpenTelemetry
    #[arg(long, default_value = "127.0.0.1:4317", global = true)]
    otlp_endpoint: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the configured relay engine (or a bare broker session)
    Run {
        /// Mark the secondary connection ready at startup
        #[arg(long)]
        ready: bool,
    },

    /// Load and validate the config, print a summary, and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry_init_or_fallback(&cli.otlp_endpoint);

    let command = cli.command.unwrap_or(Commands::Run { ready: false });
    match command {
        Commands::Run { ready } => run(cli.config.as_deref(), ready).await?,
        Commands::Check => check(cli.config.as_deref())?,
    }

    switchyard::telemetry::shutdown()?;
    Ok(())
}

/// OTLP init fails when no collector is reachable at startup; fall back to
/// plain fmt logging rather than refusing to run.
fn telemetry_init_or_fallback(otlp_endpoint: &str) {
    if switchyard::telemetry::init(otlp_endpoint).is_err() {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
        tracing::warn!("OTLP telemetry unavailable, using fmt logging only");
    }
}

async fn run(config_path: Option<&std::path::Path>, ready: bool) -> Result<()> {
    let (config, sources) =
        SwitchyardConfig::load_with_sources(config_path).context("Failed to load config")?;
    for path in &sources.files {
        tracing::info!("config loaded from {}", path.display());
    }

    if config.relay.enabled {
        run_relay(&config, ready).await
    } else {
        run_session(&config).await
    }
}

async fn run_relay(config: &SwitchyardConfig, ready: bool) -> Result<()> {
    tracing::info!("starting relay engine");
    let engine = Arc::new(
        RelayEngine::from_config(&config.relay).context("Failed to build relay engine")?,
    );
    switchyard::telemetry::instrument_relay(&engine);
    for session in engine.sessions() {
        switchyard::telemetry::instrument_session(&session);
    }
    if ready {
        engine.set_secondary_ready(true);
    }
    engine.start().await.context("Failed to start relay engine")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;
    tracing::info!("shutdown signal received");

    engine.stop().await;
    for stats in engine.rule_stats() {
        tracing::info!(
            "rule {} -> {}: forwarded={} dropped={} errors={}",
            stats.source,
            stats.destination,
            stats.forwarded,
            stats.dropped,
            stats.errors
        );
    }
    Ok(())
}

async fn run_session(config: &SwitchyardConfig) -> Result<()> {
    tracing::info!(
        "starting broker session {} -> {}:{}",
        config.broker.client_id,
        config.broker.broker_host,
        config.broker.broker_port
    );
    let session =
        Arc::new(BrokerSession::new(config.broker.clone()).context("Failed to build session")?);
    switchyard::telemetry::instrument_session(&session);

    for pattern in &config.json_added_subs {
        session
            .subscribe(pattern, session.default_qos())
            .await
            .with_context(|| format!("Failed to record subscription {pattern}"))?;
    }
    session.start().context("Failed to start session")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;
    tracing::info!("shutdown signal received");

    session.stop().await;
    let stats = session.statistics();
    tracing::info!(
        "session stats: sent={} received={} errors={} connections={}",
        stats.messages_sent,
        stats.messages_received,
        stats.errors,
        stats.connection_count
    );
    Ok(())
}

fn check(config_path: Option<&std::path::Path>) -> Result<()> {
    let (config, sources) =
        SwitchyardConfig::load_with_sources(config_path).context("Config is invalid")?;

    println!("config OK");
    for path in &sources.files {
        println!("  file: {}", path.display());
    }
    for var in &sources.env_overrides {
        println!("  env:  {}", var);
    }
    println!(
        "  broker: {}@{}:{} (tls: {}, auto_reconnect: {})",
        config.broker.client_id,
        config.broker.broker_host,
        config.broker.broker_port,
        config.broker.use_tls,
        config.broker.auto_reconnect
    );
    println!(
        "  relay: enabled={} brokers={} rules={} filters={}",
        config.relay.enabled,
        config.relay.brokers.len(),
        config.relay.rules.len(),
        config.relay.conditional_rules.len()
    );
    println!("  extra subscriptions: {}", config.json_added_subs.len());
    Ok(())
}
