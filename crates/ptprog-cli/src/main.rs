//! ptprog - discover and configure ProtoThrottle receivers from the command line.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ptprog_core::config::{SessionConfig, TransportSelection};
use ptprog_core::protocol::{
    list_bridges, list_ports, Address, DeviceRecord, Escaping, Session, UsbOptions,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// ProtoThrottle receiver programmer
#[derive(Parser, Debug)]
#[command(name = "ptprog", author, version, about)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use this serial port instead of raw USB
    #[arg(short, long, global = true)]
    port: Option<String>,

    /// Override the configured baud rate
    #[arg(short, long, global = true)]
    baud: Option<u32>,

    /// Coordinator uses escaped API mode (AP=2)
    #[arg(long, global = true)]
    escaped: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports and attached USB bridges
    Ports,

    /// Broadcast node discovery and list the receivers that answer
    Discover(DiscoverArgs),

    /// Send a configuration command to one receiver
    Send(SendArgs),

    /// Broadcast a text message to every receiver
    Broadcast(BroadcastArgs),

    /// Write the effective configuration to a file
    SaveConfig {
        /// Destination path
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
struct DiscoverArgs {
    /// Number of discovery scans to merge
    #[arg(short, long, default_value_t = 1)]
    scans: u32,
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Hardware address of the receiver (16 hex digits)
    mac: String,

    /// Single-character command code
    code: char,

    /// Numeric parameter, sent as ASCII digits
    value: Option<u32>,

    /// Discovery scans to try before giving up on the receiver
    #[arg(short, long, default_value_t = 3)]
    scans: u32,
}

#[derive(Args, Debug)]
struct BroadcastArgs {
    /// Message text
    text: String,
}

fn init_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to init logging: {e}"))
}

fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };

    if let Some(port) = &cli.port {
        config.transport = TransportSelection::Serial { port: port.clone() };
    }
    if let Some(baud) = cli.baud {
        config.baud_rate = baud;
    }
    if cli.escaped {
        config.escaping = Escaping::ApiMode2;
    }

    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;
    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Ports => run_ports(&cli, &config),
        Commands::Discover(args) => run_discover(&cli, config, args),
        Commands::Send(args) => run_send(&cli, config, args),
        Commands::Broadcast(args) => run_broadcast(config, args),
        Commands::SaveConfig { path } => {
            config.save(path)?;
            info!("Wrote {}", path.display());
            Ok(())
        }
    }
}

fn connect(config: SessionConfig) -> Result<Session> {
    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    // Ctrl-C only needs to break the USB permission wait; afterwards every
    // operation is bounded by its own timeout.
    std::thread::spawn(move || {
        let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        else {
            return;
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                handler_token.cancel();
            }
        });
    });

    let session = Session::connect(config, &cancel).context("opening coordinator")?;
    Ok(session)
}

fn run_ports(cli: &Cli, config: &SessionConfig) -> Result<()> {
    let ports = list_ports();
    let usb_options = match &config.transport {
        TransportSelection::Usb(options) => options.clone(),
        TransportSelection::Serial { .. } => UsbOptions::default(),
    };
    let bridges = match list_bridges(&usb_options) {
        Ok(b) => b,
        Err(e) => {
            warn!("USB enumeration unavailable: {e}");
            Vec::new()
        }
    };

    if cli.json {
        let ports: Vec<_> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "cp210x": p.is_cp210x(),
                    "product": p.product,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({ "ports": ports, "usb": bridges }))?
        );
        return Ok(());
    }

    println!("Serial ports:");
    for p in &ports {
        let marker = if p.is_cp210x() { " [CP210x]" } else { "" };
        println!(
            "  {}{} {}",
            p.name,
            marker,
            p.product.as_deref().unwrap_or("")
        );
    }
    println!("USB bridges:");
    for b in &bridges {
        println!(
            "  bus {:03} device {:03} {} {}",
            b.bus_number,
            b.device_address,
            b.serial_number.as_deref().unwrap_or("-"),
            b.product.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn print_records(cli: &Cli, records: &[DeviceRecord]) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }
    if records.is_empty() {
        println!("No receivers answered.");
    }
    for r in records {
        println!("{}  {:<20}  -{} dBm", r.mac(), r.node_name(), r.signal_strength());
    }
    Ok(())
}

fn run_discover(cli: &Cli, config: SessionConfig, args: &DiscoverArgs) -> Result<()> {
    let mut session = connect(config)?;
    let mut found = Vec::new();
    for scan in 1..=args.scans.max(1) {
        let added = session.discover_into(&mut found)?;
        info!("Scan {}: {} new, {} total", scan, added, found.len());
    }

    let counters = session.counters();
    if counters.frames_dropped > 0 {
        warn!("{} malformed responses were dropped", counters.frames_dropped);
    }
    print_records(cli, &found)
}

fn run_send(cli: &Cli, config: SessionConfig, args: &SendArgs) -> Result<()> {
    let address = Address::parse(&args.mac)?;
    if !args.code.is_ascii() {
        bail!("command code must be a single ASCII character");
    }

    let mut session = connect(config)?;
    let mut found = Vec::new();
    let mut target = None;
    for _ in 0..args.scans.max(1) {
        session.discover_into(&mut found)?;
        target = found.iter().find(|r| *r.address() == address).cloned();
        if target.is_some() {
            break;
        }
    }
    let Some(record) = target else {
        bail!("receiver {} did not answer discovery", address);
    };

    let params = args
        .value
        .map(ptprog_core::protocol::ascii_param)
        .unwrap_or_default();
    let reply = session.send_command(&record, args.code as u8, &params)?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "target": record,
                "reply": reply.as_bytes(),
            }))?
        );
    } else {
        println!(
            "Sent '{}' to {} ({}); reply {} bytes: {:02X?}",
            args.code,
            record.mac(),
            record.node_name(),
            reply.len(),
            reply.as_bytes()
        );
    }
    Ok(())
}

fn run_broadcast(config: SessionConfig, args: &BroadcastArgs) -> Result<()> {
    let mut session = connect(config)?;
    session.send_broadcast_text(&args.text)?;
    info!("Broadcast {} bytes", args.text.len());
    Ok(())
}
