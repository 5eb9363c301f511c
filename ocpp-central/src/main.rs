//! OCPP central system
//!
//! Accepts charge points over WebSocket and answers BootHandshake, StatusReport
//! and KeepAlive.
//!
//! # Usage
//!
//! ```bash
//! # Listen on 0.0.0.0:9000, 3 s keep-alive
//! ocpp-central
//!
//! # Only accept one vendor, longer keep-alive, log frames to a file
//! ocpp-central --accept-vendor someVendor --keep-alive-interval 30 \
//!     --log-level debug --log-file logs/ocpp-messages.log
//!
//! # Settings from a JSON file, flags still win
//! ocpp-central --config central.json --bind 127.0.0.1:9100
//! ```

use std::fs::{self, File};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::Parser;
use ocpp_engine::{reference_router, serve, CentralConfig};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// OCPP central system
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep-alive interval handed to booting stations, in seconds
    #[arg(long)]
    keep_alive_interval: Option<u64>,

    /// Accept only this vendor at boot (can be repeated)
    #[arg(long)]
    accept_vendor: Vec<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => CentralConfig::from_file(path)?,
        None => CentralConfig::default(),
    };
    if let Some(bind) = args.bind {
        config = config.with_bind_addr(bind);
    }
    if let Some(secs) = args.keep_alive_interval {
        config = config.with_keep_alive_interval(secs);
    }
    for vendor in &args.accept_vendor {
        config = config.with_accepted_vendor(vendor);
    }
    if args.log_file.is_some() {
        config.log_file = args.log_file.clone();
    }
    config.validate()?;

    init_logging(&args.log_level, config.log_file.as_deref())?;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                  OCPP Central System                         ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Listen:     {:<48} ║", config.bind_addr);
    println!("║  Keep-alive: {:<48} ║", format!("{}s", config.keep_alive_interval_secs));
    println!("║  Vendors:    {:<48} ║", vendors(&config));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let router = Arc::new(reference_router(&config)?);
    let listener = TcpListener::bind(config.bind_addr).await?;

    tokio::select! {
        result = serve(listener, router, config) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}

fn init_logging(level: &str, log_file: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let file_layer = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)?;
            }
            let file = File::options().create(true).append(true).open(path)?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()?;
    Ok(())
}

fn vendors(config: &CentralConfig) -> String {
    match &config.accepted_vendors {
        Some(list) => list.join(", "),
        None => "any".to_string(),
    }
}
