//! Modbus/TCP responder daemon entry point.
//!
//! Wires configuration, logging and signal handling around the
//! holding register server and runs until asked to stop.

mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use mbtcp_common::config::ResponderConfig;
use mbtcp_server::Server;
use std::net::IpAddr;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::signals::SignalHandler;

/// How often the main loop checks for signals.
const MAIN_LOOP_POLL: Duration = Duration::from_millis(50);

/// Interval between periodic status lines.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Modbus/TCP responder command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "mbtcp-daemon",
    about = "Modbus/TCP responder - serves holding registers over TCP",
    version,
    long_about = None
)]
struct Args {
    /// Path to a configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Interface address to bind (overrides config file).
    #[arg(long, value_name = "ADDR")]
    bind: Option<IpAddr>,

    /// TCP port (overrides config file).
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Number of holding registers (overrides config file).
    #[arg(long, short = 'r')]
    registers: Option<usize>,

    /// Send exception replies without the MBAP prefix.
    #[arg(long)]
    bare_exceptions: bool,

    /// Validate the configuration, print it as TOML and exit.
    #[arg(long)]
    check_config: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Modbus/TCP responder");

    let mut config = load_config(&args)?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    if args.check_config {
        print!("{}", config.to_toml().context("Failed to render configuration")?);
        return Ok(());
    }

    info!(
        addr = %config.server.socket_addr(),
        registers = config.registers.size,
        preload_blocks = config.registers.preload.len(),
        bare_exceptions = config.compat.bare_exception_frames,
        "Configuration loaded"
    );

    let signal_handler = SignalHandler::install().context("Failed to set up signal handlers")?;

    run_daemon(&config, &signal_handler)
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("mbtcp_daemon={level},mbtcp_server={level},mbtcp_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `MBTCP_CONFIG_PATH` environment variable
/// 3. `/etc/mbtcp/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<ResponderConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return ResponderConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()));
    }

    if let Ok(env_path) = std::env::var("MBTCP_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from MBTCP_CONFIG_PATH");
            return ResponderConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from MBTCP_CONFIG_PATH={env_path}")
            });
        }
        warn!(
            path = %env_path,
            "MBTCP_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for candidate in ["/etc/mbtcp/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(candidate);
        if config_path.exists() {
            info!(?config_path, "Loading config file");
            return ResponderConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {candidate}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(ResponderConfig::default())
}

/// Command-line flags win over file values.
fn apply_overrides(config: &mut ResponderConfig, args: &Args) {
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(registers) = args.registers {
        config.registers.size = registers;
    }
    if args.bare_exceptions {
        config.compat.bare_exception_frames = true;
    }
}

/// Run the server until a shutdown signal arrives.
fn run_daemon(config: &ResponderConfig, signal_handler: &SignalHandler) -> Result<()> {
    let mut server = Server::from_config(config).context("Failed to create server")?;
    server.start().context("Failed to start server")?;

    let started = Instant::now();
    let mut last_status = Instant::now();

    let cause = loop {
        if let Some(cause) = signal_handler.shutdown_requested() {
            break cause;
        }

        if signal_handler.take_reload_request() {
            warn!("Reload signal received; configuration reload is not supported, keeping current settings");
        }

        if last_status.elapsed() >= STATUS_INTERVAL {
            let stats = server.stats();
            info!(
                active_sessions = stats.sessions_active,
                requests = stats.requests,
                exceptions = stats.exceptions,
                "Periodic status"
            );
            last_status = Instant::now();
        }

        thread::sleep(MAIN_LOOP_POLL);
    };

    info!(cause = %cause, "Shutting down...");
    server.shutdown();

    let stats = server.stats();
    info!(
        sessions = stats.sessions_accepted,
        rejected = stats.sessions_rejected,
        requests = stats.requests,
        exceptions = stats.exceptions,
        framing_errors = stats.framing_errors,
        signals = signal_handler.signal_count(),
        uptime_secs = started.elapsed().as_secs(),
        final_state = %server.state(),
        "Daemon shutdown complete"
    );

    Ok(())
}
