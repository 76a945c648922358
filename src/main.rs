//! Burrow CLI - reverse TCP tunnel over WebSocket
//!
//! `burrow relay` runs the public side, `burrow agent` the edge side that
//! dials out to a relay and reaches destinations on its behalf.

mod config;

use anyhow::{Context, Result};
use burrow_agent::{Agent, AgentConfig};
use burrow_proto::RequesterHeader;
use burrow_relay::{Relay, RelayConfig};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{
    load_config_file, resolve_listen_addr, AgentFileConfig, FileConfig, RelayFileConfig,
};

/// Burrow - reach services behind NAT through a public relay
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Burrow - reach services behind NAT through a public relay")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("BURROW_COMMIT"), ")"))]
struct Cli {
    /// Enable verbose logging (same as --log-level debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "BURROW_LOG_LEVEL")]
    log_level: Option<String>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept agent registrations and CONNECT requests
    #[command(long_about = r#"
Listen for HTTP connections. A GET with WebSocket upgrade headers registers
an agent (one at a time); a CONNECT request is tunneled through the
registered agent to the requested host:port.

EXAMPLES:
  # Listen on all interfaces, port 8080
  burrow relay :8080

  # Use the legacy Client header to pass the requester address
  burrow relay 0.0.0.0:8080 --requester-header client

  # Then, from a client
  curl -p -x http://relay.example.com:8080 http://10.0.0.5:80/

ENVIRONMENT VARIABLES:
  BURROW_LISTEN            Comma-separated listen addresses
  BURROW_REQUESTER_HEADER  forwarded or client
    "#)]
    Relay(RelayArgs),

    /// Connect to relays and forward their streams to destinations
    #[command(long_about = r#"
Dial out to one or more relays and serve the tunnels they open. Each relay
URL runs independently.

EXAMPLES:
  # Connect to a relay over TLS, reconnecting when the connection drops
  burrow agent https://relay.example.com --reconnect

  # Plain WebSocket relay with bounded destination dials
  burrow agent ws://10.0.0.1:8080 --dial-timeout 5

ENVIRONMENT VARIABLES:
  BURROW_RELAY  Comma-separated relay URLs
    "#)]
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
struct RelayArgs {
    /// Addresses to listen on (e.g. :8080 or 127.0.0.1:8080)
    #[arg(env = "BURROW_LISTEN", value_delimiter = ',')]
    addrs: Vec<String>,

    /// How the client address is passed to the agent
    #[arg(long, env = "BURROW_REQUESTER_HEADER")]
    requester_header: Option<RequesterHeader>,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Relay URLs (http, https, ws or wss)
    #[arg(env = "BURROW_RELAY", value_delimiter = ',')]
    urls: Vec<String>,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,

    /// Seconds allowed for connecting to the relay
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Seconds allowed for dialing a destination
    #[arg(long)]
    dial_timeout: Option<u64>,

    /// Reconnect when the relay connection fails or closes
    #[arg(long)]
    reconnect: bool,

    /// Maximum reconnection attempts (0 = infinite)
    #[arg(long)]
    max_reconnect_attempts: Option<usize>,

    /// Initial reconnection delay in seconds
    #[arg(long)]
    reconnect_delay: Option<u64>,

    /// Maximum reconnection delay in seconds
    #[arg(long)]
    max_reconnect_delay: Option<u64>,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct ReconnectPolicy {
    enabled: bool,
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => load_config_file(path)?,
        None => FileConfig::default(),
    };

    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        cli.log_level
            .clone()
            .or_else(|| file.log_level.clone())
            .unwrap_or_else(|| "info".to_string())
    };
    setup_logging(&log_level)?;

    info!(
        "Burrow {} ({}, built {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BURROW_COMMIT"),
        env!("BURROW_BUILD_DATE")
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down...");
                shutdown.cancel();
            }
        });
    }

    let result = match cli.command {
        Commands::Relay(args) => run_relays(args, file.relay, shutdown).await,
        Commands::Agent(args) => run_agents(args, file.agent, shutdown).await,
    };

    info!("Burrow stopped");
    result
}

/// Run one relay per listen address until Ctrl+C
async fn run_relays(
    args: RelayArgs,
    file: RelayFileConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let addrs = if args.addrs.is_empty() {
        file.listen
    } else {
        args.addrs
    };
    if addrs.is_empty() {
        anyhow::bail!("No listen address given (pass ADDR or set BURROW_LISTEN)");
    }

    let requester_header = match (args.requester_header, file.requester_header) {
        (Some(header), _) => header,
        (None, Some(raw)) => raw
            .parse::<RequesterHeader>()
            .map_err(anyhow::Error::msg)
            .context("Invalid requester_header in config file")?,
        (None, None) => RequesterHeader::default(),
    };
    let config = RelayConfig::new().with_requester_header(requester_header);

    info!("Requester header: {}", requester_header);

    let mut tasks = JoinSet::new();
    for raw in addrs {
        let relay = Relay::new(config.clone());
        let shutdown = shutdown.clone();

        tasks.spawn(async move {
            let result = async {
                let addr = resolve_listen_addr(&raw).await?;

                let watcher = relay.clone();
                let stop = shutdown.clone();
                tokio::spawn(async move {
                    stop.cancelled().await;
                    watcher.shutdown();
                });

                relay.run(addr).await?;
                Ok::<_, anyhow::Error>(())
            }
            .await;
            (raw, result)
        });
    }

    wait_all(tasks, "Relay").await
}

/// Run one agent per relay URL until Ctrl+C
async fn run_agents(
    args: AgentArgs,
    file: AgentFileConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let urls = if args.urls.is_empty() {
        file.relays.clone()
    } else {
        args.urls.clone()
    };
    if urls.is_empty() {
        anyhow::bail!("No relay URL given (pass URL or set BURROW_RELAY)");
    }

    let insecure = args.insecure || file.insecure;
    let connect_timeout = args.connect_timeout.or(file.connect_timeout_secs);
    let dial_timeout = args.dial_timeout.or(file.dial_timeout_secs);
    let policy = ReconnectPolicy {
        enabled: args.reconnect || file.reconnect,
        max_attempts: args
            .max_reconnect_attempts
            .or(file.max_reconnect_attempts)
            .unwrap_or(0),
        initial_delay: Duration::from_secs(
            args.reconnect_delay.or(file.reconnect_delay_secs).unwrap_or(1),
        ),
        max_delay: Duration::from_secs(
            args.max_reconnect_delay
                .or(file.max_reconnect_delay_secs)
                .unwrap_or(60),
        ),
    };

    if insecure {
        warn!("⚠️  Certificate verification disabled (insecure mode)");
    }

    let mut tasks = JoinSet::new();
    for url in urls {
        let mut config = AgentConfig::new(url.clone()).with_insecure(insecure);
        if let Some(secs) = connect_timeout {
            config = config.with_connect_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = dial_timeout {
            config = config.with_dial_timeout(Duration::from_secs(secs));
        }

        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let result = connect_with_reconnect(config, policy, shutdown).await;
            (url, result)
        });
    }

    wait_all(tasks, "Agent").await
}

/// Connect to a relay, optionally reconnecting with exponential backoff
async fn connect_with_reconnect(
    config: AgentConfig,
    policy: ReconnectPolicy,
    shutdown: CancellationToken,
) -> Result<()> {
    let relay = config.relay_url.clone();
    let agent = Agent::new(config)
        .with_context(|| format!("Failed to create agent for {}", relay))?
        .with_shutdown_token(shutdown.clone());

    let mut attempt = 0;
    let mut current_delay = policy.initial_delay;

    loop {
        attempt += 1;

        match agent.run().await {
            Ok(()) if shutdown.is_cancelled() => return Ok(()),
            Ok(()) => {
                info!("Relay {} closed the session", relay);
                if !policy.enabled {
                    return Ok(());
                }
                // A session was established, so start counting afresh
                attempt = 0;
                current_delay = policy.initial_delay;
            }
            Err(e) => {
                error!("Agent error: {:#}", e);

                if !policy.enabled {
                    return Err(e.into());
                }
                if policy.max_attempts > 0 && attempt >= policy.max_attempts {
                    error!(
                        "Maximum reconnection attempts ({}) reached",
                        policy.max_attempts
                    );
                    return Err(e.into());
                }
            }
        }

        warn!(
            "Reconnecting to {} in {} seconds... (attempt {} of {})",
            relay,
            current_delay.as_secs(),
            attempt + 1,
            if policy.max_attempts == 0 {
                "∞".to_string()
            } else {
                policy.max_attempts.to_string()
            }
        );

        tokio::select! {
            _ = tokio::time::sleep(current_delay) => {}
            _ = shutdown.cancelled() => return Ok(()),
        }

        // Exponential backoff with max cap
        current_delay = std::cmp::min(current_delay * 2, policy.max_delay);
    }
}

/// Wait for every instance; one failing does not stop the others
async fn wait_all(mut tasks: JoinSet<(String, Result<()>)>, kind: &str) -> Result<()> {
    let total = tasks.len();
    let mut failures = 0;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((name, Ok(()))) => info!("{} {} stopped", kind, name),
            Ok((name, Err(e))) => {
                error!("{} {} failed: {:#}", kind, name, e);
                failures += 1;
            }
            Err(e) => {
                error!("{} task panicked: {}", kind, e);
                failures += 1;
            }
        }
    }

    if failures == total {
        anyhow::bail!("All {} instances failed", kind.to_lowercase());
    }
    Ok(())
}
