//! fclink - MSP link daemon
//!
//! Opens the serial lines to a flight controller, runs the link engine,
//! drives its timer and reports connection state and traffic counters.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fclink_core::protocol::{
    list_ports, open_port, CommandResponse, CommandToken, ConnectionState, Engine, EngineConfig,
    EngineObserver, FcClient, Function, Message, SerialLink, WireVersion, DEFAULT_BAUD_RATE,
};

/// Opcode used for the reset issued at startup
const STARTUP_RESET: u32 = 1;

#[derive(Parser)]
#[command(name = "fclink")]
#[command(about = "MSP link daemon for flight controllers")]
#[command(version)]
struct Cli {
    /// Engine config file (JSON); built-in defaults when omitted
    #[arg(short, long, env = "FCLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Serial port for each line, in line order (repeat for more lines)
    #[arg(short, long = "port")]
    ports: Vec<String>,

    /// Baud rate for every line
    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,

    /// Override the configured outgoing wire version
    #[arg(long, value_enum)]
    wire: Option<WireArg>,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Request MSP_STATUS once the connection is up
    #[arg(long)]
    status_check: bool,

    /// Seconds between telemetry reports
    #[arg(long, default_value_t = 10)]
    report_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum WireArg {
    V1,
    V2,
}

impl From<WireArg> for WireVersion {
    fn from(arg: WireArg) -> Self {
        match arg {
            WireArg::V1 => WireVersion::V1,
            WireArg::V2 => WireVersion::V2,
        }
    }
}

/// Logs engine events and publishes the connection state
struct DaemonObserver {
    state: watch::Sender<ConnectionState>,
}

impl EngineObserver for DaemonObserver {
    fn command_complete(&self, token: CommandToken, response: CommandResponse) {
        match response {
            CommandResponse::Ok => info!(opcode = token.opcode, seq = token.seq, "Reset complete"),
            CommandResponse::ExecutionError => {
                warn!(opcode = token.opcode, seq = token.seq, "Reset failed")
            }
        }
    }

    fn state_changed(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if let Some(wire) = cli.wire {
        config.wire_version = wire.into();
    }
    if !cli.ports.is_empty() {
        config.lines = cli.ports.len();
        config.disabled_lines.retain(|&line| line < config.lines);
    }
    config.validate()?;
    Ok(config)
}

/// Ports named on the command line, or the first detected ones
fn select_ports(cli: &Cli, lines: usize) -> Result<Vec<String>> {
    if !cli.ports.is_empty() {
        return Ok(cli.ports.clone());
    }
    let found: Vec<String> = list_ports().into_iter().map(|p| p.name).collect();
    if found.len() < lines {
        bail!(
            "{} serial line(s) configured but only {} port(s) found; use --port",
            lines,
            found.len()
        );
    }
    Ok(found.into_iter().take(lines).collect())
}

async fn request_status(client: Arc<FcClient>) {
    match client.request(Message::new(Function::MSP_STATUS)).await {
        Ok(reply) => info!(
            bytes = reply.message.payload_size(),
            "MSP_STATUS reply received"
        ),
        Err(e) => warn!(error = %e, "MSP_STATUS request failed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.list_ports {
        for port in list_ports() {
            match (&port.product, port.vid, port.pid) {
                (Some(product), Some(vid), Some(pid)) => {
                    println!("{}  {:04x}:{:04x}  {}", port.name, vid, pid, product)
                }
                _ => println!("{}", port.name),
            }
        }
        return Ok(());
    }

    let config = load_config(&cli)?;
    let names = select_ports(&cli, config.lines)?;
    let ports = names
        .iter()
        .map(|name| open_port(name, cli.baud))
        .collect::<Result<Vec<_>, _>>()?;
    info!(ports = ?names, baud = cli.baud, wire = ?config.wire_version, "Serial lines open");

    let (state_tx, mut state_rx) = watch::channel(ConnectionState::NotConnected);
    let link = SerialLink::new(ports);
    let engine = Engine::new(
        config.clone(),
        link.clone(),
        Arc::new(DaemonObserver { state: state_tx }),
    )?;
    link.start(engine.clone())?;

    let client = Arc::new(FcClient::attach(&engine));
    engine.reset(Some(CommandToken {
        opcode: STARTUP_RESET,
        seq: 0,
    }));

    let mut tick = tokio::time::interval(config.tick_interval());
    let mut report = tokio::time::interval(Duration::from_secs(cli.report_secs.max(1)));

    loop {
        tokio::select! {
            _ = tick.tick() => engine.on_tick(Instant::now()),
            _ = report.tick() => {
                match serde_json::to_string(&engine.telemetry()) {
                    Ok(json) => info!(telemetry = %json, "Link report"),
                    Err(e) => error!(error = %e, "Failed to serialize telemetry"),
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Ok => {
                        let meta = engine.metadata();
                        info!(
                            target_name = meta.target_name.as_deref().unwrap_or("?"),
                            "Flight controller connected"
                        );
                        if cli.status_check {
                            tokio::spawn(request_status(client.clone()));
                        }
                    }
                    ConnectionState::NotConnected => info!("Connecting"),
                    other => warn!(state = ?other, "Connection failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    link.stop();
    Ok(())
}
