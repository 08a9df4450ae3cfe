//! wsbridge - WebSocket to TCP bridge
//!
//! Lets browser clients, which can only speak WebSocket, reach plain TCP
//! services on an allow-listed set of loopback ports.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wsbridge::{config::ConfigManager, BridgeServer, ShutdownCoordinator};

/// CLI arguments for wsbridge
#[derive(Parser, Debug)]
#[command(name = "wsbridge")]
#[command(about = "WebSocket to TCP bridge for allow-listed loopback ports")]
#[command(version)]
#[command(long_about = "
wsbridge - WebSocket to TCP bridge

Clients connect to ws://<addr>/?port=<n>. When <n> is in the accepted upstream
port list the bridge dials 127.0.0.1:<n> and relays binary WebSocket messages
to and from that TCP connection.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Environment variables
3. Configuration file
4. Built-in defaults

Environment variables:
  WSBRIDGE_LISTEN_ADDR              - Listen address (e.g., :9000)
  WSBRIDGE_ACCEPTED_UPSTREAM_PORTS  - Comma-separated port list (e.g., 8484,8585)
  WSBRIDGE_TEST_PAGE                - Path of the page served on /test
  WSBRIDGE_SHUTDOWN_TIMEOUT         - Drain timeout on shutdown (e.g., 10s)
  WSBRIDGE_LOG_LEVEL                - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "wsbridge.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// HTTP service address (overrides config file)
    #[arg(short, long, help = "HTTP service address (e.g., :9000)")]
    pub addr: Option<String>,

    /// Ports that can be accessed (overrides config file)
    #[arg(long, help = "Comma-separated upstream ports that can be accessed")]
    pub accepted_upstream_ports: Option<String>,

    /// Page served on /test (overrides config file)
    #[arg(long, help = "Path of the page served on /test")]
    pub test_page: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Priority: CLI args > environment > config file > defaults
    let mut config = ConfigManager::load_from_file(&args.config)?;
    ConfigManager::apply_env(&mut config)?;
    config.merge_with_cli_args(
        args.addr.as_deref(),
        args.accepted_upstream_ports.as_deref(),
        args.test_page.as_deref(),
        args.log_level.as_deref(),
    );
    if args.verbose {
        config.logging.level = "debug".to_string();
    }

    init_tracing(&config.logging.level)?;

    info!("Starting wsbridge v{}", env!("CARGO_PKG_VERSION"));
    if args.config.exists() {
        info!("Configuration file: {}", args.config.display());
    } else {
        warn!("Configuration file {} not found, using defaults", args.config.display());
    }

    config
        .validate()
        .context("Final configuration validation failed")?;

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Listen address: {}", config.server.listen_addr);
        info!("  Accepted upstream ports: {}", config.port_policy()?);
        info!("  Test page: {}", config.server.test_page.display());
        info!("  Shutdown timeout: {:?}", config.server.shutdown_timeout);
        return Ok(());
    }

    let server = BridgeServer::new(&config)?;
    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);

    let mut server_handle = tokio::spawn(server.start(shutdown_coordinator.shutdown_signal()));

    info!("Starting server...");

    tokio::select! {
        result = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = result {
                error!("Error setting up signal handlers: {}", e);
            }
        }
        joined = &mut server_handle => {
            // The server only stops on its own when it fails.
            return match joined {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("Server task failed: {}", e)),
            };
        }
    }

    info!("Initiating graceful shutdown...");
    shutdown_coordinator.trigger();
    shutdown_coordinator.wait_for_server(server_handle).await?;

    info!("Server shutdown complete");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
