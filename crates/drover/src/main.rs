use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use drover::Controller;
use droverconf::{DbBackendKind, DroverConfig, Scheme};

/// The Drover controller
///
/// Brokers work between clients and a pool of engines over ZeroMQ: direct
/// and load-balanced execution channels, control, I/O broadcast, heartbeat
/// liveness, and a queryable request ledger.
///
/// Configuration is loaded from (in order, later wins):
/// 1. Compiled defaults
/// 2. /etc/drover/config.toml
/// 3. ~/.config/drover/config.toml
/// 4. ./drover.toml (or --config path)
/// 5. Environment variables (DROVER_*)
/// 6. Command line flags below
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (overrides ./drover.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Interface to bind every channel on
    #[arg(long)]
    ip: Option<String>,

    /// Task assignment policy
    #[arg(long, value_parser = parse_scheme)]
    scheme: Option<Scheme>,

    /// Heartbeat period in milliseconds
    #[arg(long)]
    ping: Option<u64>,

    /// Registration port (0 = random)
    #[arg(long)]
    regport: Option<u16>,

    /// Client query port (0 = random)
    #[arg(long)]
    client: Option<u16>,

    /// Registration notification port (0 = random)
    #[arg(long)]
    notice: Option<u16>,

    /// Monitor bus port (0 = random)
    #[arg(long)]
    monitor: Option<u16>,

    /// Heartbeat ports: beacon, echo
    #[arg(long, num_args = 2, value_names = ["PING", "PONG"])]
    hb: Option<Vec<u16>>,

    /// MUX queue ports: client side, engine side
    #[arg(long, num_args = 2, value_names = ["CLIENT", "ENGINE"])]
    mux: Option<Vec<u16>>,

    /// Task queue ports: client side, engine side
    #[arg(long, num_args = 2, value_names = ["CLIENT", "ENGINE"])]
    task: Option<Vec<u16>>,

    /// Control queue ports: client side, engine side
    #[arg(long, num_args = 2, value_names = ["CLIENT", "ENGINE"])]
    control: Option<Vec<u16>>,

    /// IOPub relay ports: client side, engine side
    #[arg(long, num_args = 2, value_names = ["CLIENT", "ENGINE"])]
    iopub: Option<Vec<u16>>,

    /// Record storage backend
    #[arg(long, value_parser = parse_db)]
    db: Option<DbBackendKind>,

    /// Signing key file; created when missing
    #[arg(long)]
    exec_key: Option<PathBuf>,

    /// Show the loaded configuration and exit
    #[arg(long)]
    show_config: bool,
}

fn parse_scheme(s: &str) -> Result<Scheme, String> {
    s.parse().map_err(|e| format!("{}", e))
}

fn parse_db(s: &str) -> Result<DbBackendKind, String> {
    s.parse().map_err(|e| format!("{}", e))
}

fn pair(ports: &Option<Vec<u16>>) -> Option<[u16; 2]> {
    ports.as_ref().map(|p| [p[0], p[1]])
}

fn apply_cli(config: &mut DroverConfig, cli: &Cli) {
    if let Some(ip) = &cli.ip {
        config.net.bind_ip = ip.clone();
    }
    if let Some(port) = cli.regport {
        config.net.registration_port = port;
    }
    if let Some(port) = cli.client {
        config.net.query_port = port;
    }
    if let Some(port) = cli.notice {
        config.net.notification_port = port;
    }
    if let Some(port) = cli.monitor {
        config.net.monitor_port = port;
    }
    if let Some(ports) = pair(&cli.hb) {
        config.net.heartbeat_ports = ports;
    }
    if let Some(ports) = pair(&cli.mux) {
        config.net.mux_ports = ports;
    }
    if let Some(ports) = pair(&cli.task) {
        config.net.task_ports = ports;
    }
    if let Some(ports) = pair(&cli.control) {
        config.net.control_ports = ports;
    }
    if let Some(ports) = pair(&cli.iopub) {
        config.net.iopub_ports = ports;
    }
    if let Some(scheme) = cli.scheme {
        config.controller.scheme = scheme;
    }
    if let Some(ping) = cli.ping {
        config.controller.heartbeat_period_ms = ping;
    }
    if let Some(db) = cli.db {
        config.controller.db_backend = db;
    }
    if let Some(key) = &cli.exec_key {
        config.controller.exec_key = key.clone();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = DroverConfig::load_with_override(cli.config.as_deref())?;
    apply_cli(&mut config, &cli);

    if cli.show_config {
        println!("{}", toml::to_string_pretty(&config)?);
        if !sources.files.is_empty() {
            println!("# loaded from:");
            for file in &sources.files {
                println!("#   {}", file.display());
            }
        }
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.controller.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let controller = Controller::start(config).await?;
    let endpoints = controller.endpoints();
    info!(
        registration = %endpoints.registration,
        query = %endpoints.query,
        notification = %endpoints.notification,
        "drover controller running; ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("interrupted, shutting down");
    controller.shutdown();
    controller.join().await;
    Ok(())
}
