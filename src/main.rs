//! RustForward - local TCP port forwarder
//!
//! `serve` forwards a local port to a remote host, optionally guarded by a
//! termination channel; `terminate` stops such a forwarder from another
//! process; `probe` checks whether a port accepts connections.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rustforward::{
    config::{Config, ConfigManager, ConfigOverrides},
    send_termination,
    shutdown::{self, ShutdownCause},
    util, Credential, ForwardingListener, ShutdownCoordinator, TerminationChannel,
};

/// CLI arguments for RustForward
#[derive(Parser, Debug)]
#[command(name = "rustforward")]
#[command(about = "RustForward - local TCP port forwarder")]
#[command(version)]
#[command(long_about = "
RustForward - local TCP port forwarder

Listens on a local port and relays every connection to a fixed remote
host:port. A forwarder started with a termination channel can be stopped
by another process that knows the channel's socket path and secret.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  RUSTFORWARD_LOCAL_ADDR      - Local listen address (e.g., 127.0.0.1)
  RUSTFORWARD_REMOTE_HOST     - Remote host to forward to
  RUSTFORWARD_REMOTE_PORT     - Remote port to forward to
  RUSTFORWARD_PREFERRED_PORT  - Local port to try first
  RUSTFORWARD_BACKLOG         - Listen backlog
  RUSTFORWARD_CHUNK_SIZE      - Bytes read per readiness event
  RUSTFORWARD_DRAIN_TIMEOUT   - Drain timeout on signal (e.g., 30s)
  RUSTFORWARD_CONTROL_SOCKET  - Termination channel socket path
  RUSTFORWARD_SECRET          - Termination secret
  RUSTFORWARD_LOG_LEVEL       - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Forward a local port to a remote host
    Serve(ServeArgs),
    /// Ask a running forwarder to stop accepting connections
    Terminate(TerminateArgs),
    /// Exit with status 0 iff host:port accepts connections
    Probe(ProbeArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Configuration file path
    #[arg(short, long, help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Local address to listen on")]
    pub local: Option<IpAddr>,

    #[arg(long, help = "Remote host to forward to")]
    pub remote_host: Option<String>,

    #[arg(long, help = "Remote port to forward to")]
    pub remote_port: Option<u16>,

    #[arg(short, long, help = "Local port to try first")]
    pub port: Option<u16>,

    #[arg(long, help = "Listen backlog")]
    pub backlog: Option<u32>,

    #[arg(long, help = "Bytes read per readiness event")]
    pub chunk_size: Option<usize>,

    #[arg(long, help = "Termination channel socket path")]
    pub control_socket: Option<PathBuf>,

    #[arg(long, help = "Termination secret")]
    pub secret: Option<String>,

    #[arg(long, help = "Open a termination channel with a generated path and secret")]
    pub terminable: bool,

    #[arg(long, help = "Write the termination credential JSON to this file")]
    pub credential_out: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct TerminateArgs {
    #[arg(long, conflicts_with_all = ["socket", "secret"], help = "Credential JSON file")]
    pub credential: Option<PathBuf>,

    #[arg(long, requires = "secret", help = "Termination channel socket path")]
    pub socket: Option<PathBuf>,

    #[arg(long, requires = "socket", help = "Termination secret")]
    pub secret: Option<String>,

    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    #[arg(long)]
    pub port: u16,

    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    match args.command {
        Command::Serve(serve_args) => {
            let config = load_config(serve_args)?;
            init_tracing(args.verbose, args.log_level.as_deref(), &config.logging.level)?;
            serve(config).await
        }
        Command::Terminate(terminate_args) => {
            init_tracing(args.verbose, args.log_level.as_deref(), "info")?;
            terminate(terminate_args)
        }
        Command::Probe(probe_args) => {
            init_tracing(args.verbose, args.log_level.as_deref(), "warn")?;
            let open = util::port_is_open(&probe_args.host, probe_args.port, probe_args.timeout);
            println!("{}", if open { "open" } else { "closed" });
            std::process::exit(if open { 0 } else { 1 });
        }
    }
}

/// Runs before logging is set up, since the config picks the log level
fn load_config(args: ServeArgs) -> Result<Config> {
    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = match &args.config {
        Some(path) if path.exists() => ConfigManager::load_from_file(path)?,
        _ => ConfigManager::load_from_env()?,
    };

    config.merge_with_cli_args(&ConfigOverrides {
        local_addr: args.local,
        remote_host: args.remote_host,
        remote_port: args.remote_port,
        preferred_port: args.port,
        backlog: args.backlog,
        chunk_size: args.chunk_size,
        control_socket: args.control_socket,
        secret: args.secret,
        credential_file: args.credential_out,
        terminable: args.terminable,
    });

    config
        .validate()
        .context("Final configuration validation failed")?;

    Ok(config)
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting RustForward v{}", env!("CARGO_PKG_VERSION"));

    let listener =
        ForwardingListener::start(&config.forwarding).context("Failed to start forwarding")?;
    println!("{}", listener.listening_port());

    let channel = if config.termination.enabled {
        let channel = TerminationChannel::from_config(&config.termination, &listener)
            .context("Failed to open termination channel")?;
        let credential = channel.credential();
        match &config.termination.credential_file {
            Some(path) => {
                credential.save(path)?;
                info!("Termination credential written to {}", path.display());
            }
            None => println!("{}", credential.to_json()?),
        }
        Some(channel)
    } else {
        None
    };

    info!(
        "Forwarding {} -> {}",
        listener.local_addr(),
        listener.remote()
    );
    info!("Press Ctrl+C or send SIGTERM/SIGINT to shutdown gracefully");

    let coordinator = Arc::new(ShutdownCoordinator::new(config.forwarding.drain_timeout));
    let shutdown_rx = coordinator.subscribe();

    let signals = Arc::clone(&coordinator);
    tokio::spawn(async move {
        if let Err(e) = signals.listen_for_signals().await {
            error!("Error setting up signal handlers: {}", e);
        }
    });

    match shutdown::wait_for_shutdown(shutdown_rx).await {
        ShutdownCause::Requested => {
            info!("Initiating graceful shutdown...");
            if let Some(channel) = &channel {
                if let Err(e) = channel.shutdown() {
                    warn!("Failed to close termination channel: {}", e);
                }
            }
            if let Err(e) = listener.shutdown() {
                warn!("Failed to close forwarding listener: {}", e);
            }
            coordinator.drain().await;
        }
        ShutdownCause::LoopExited => {
            info!("Forwarder stopped, no connections left");
        }
    }

    let stats = listener.stats();
    info!(
        accepted = stats.accepted,
        failed_connects = stats.failed_connects,
        bytes_upstream = stats.bytes_upstream,
        bytes_downstream = stats.bytes_downstream,
        "Shutdown complete"
    );

    Ok(())
}

fn terminate(args: TerminateArgs) -> Result<()> {
    let credential = match (args.credential, args.socket, args.secret) {
        (Some(path), _, _) => Credential::load(&path)?,
        (None, Some(socket), Some(secret)) => Credential::new(socket, secret.into_bytes()),
        _ => bail!("either --credential or both --socket and --secret are required"),
    };

    send_termination(&credential, args.timeout)
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool, cli_level: Option<&str>, configured_level: &str) -> Result<()> {
    let log_level = if verbose {
        "debug"
    } else {
        cli_level.unwrap_or(configured_level)
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    // stdout carries the listening port and credential
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
