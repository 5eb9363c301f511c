//! Charge-point simulator
//!
//! Connects to a central system, boots, keeps the link alive and reports every
//! connector as available.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: ws://localhost:9000, station CP1111
//! ocpp-simulator
//!
//! # Two connectors, tagged keep-alives
//! ocpp-simulator --station CP2222 --connectors 2 --vendor-tag CP2222
//! ```

use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use ocpp_engine::{
    connect, BootHandshakeRequest, BootReason, ChargePointConfig, ClientSession, ConnectorStatus,
    EngineConfig, KeepAlivePolicy, OcppError, RegistrationStatus, StatusReportRequest,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// OCPP charge-point simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Central system WebSocket URL
    #[arg(short, long, default_value = "ws://localhost:9000")]
    url: String,

    /// Station id (last URL path segment)
    #[arg(short, long, default_value = "CP1111")]
    station: String,

    /// Vendor name
    #[arg(long, default_value = "someVendor")]
    vendor: String,

    /// Model name
    #[arg(long, default_value = "someModel")]
    model: String,

    /// Boot reason
    #[arg(long, default_value = "Unknown")]
    reason: BootReason,

    /// Sent as customData.vendorId with every keep-alive
    #[arg(long)]
    vendor_tag: Option<String>,

    /// Number of connectors to report
    #[arg(long, default_value = "1")]
    connectors: u32,

    /// Call timeout in seconds
    #[arg(long, default_value = "30")]
    call_timeout: u64,

    /// Consecutive keep-alive timeouts before the keep-alive loop gives up
    #[arg(long, default_value = "3")]
    max_keep_alive_failures: u32,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()?;

    let mut config = ChargePointConfig::new(&args.url, &args.station)
        .with_vendor(&args.vendor, &args.model)
        .with_boot_reason(args.reason)
        .with_connector_count(args.connectors)
        .with_engine(
            EngineConfig::default()
                .with_call_timeout(Duration::from_secs(args.call_timeout))
                .with_keep_alive(
                    KeepAlivePolicy::default()
                        .with_max_consecutive_failures(args.max_keep_alive_failures),
                ),
        );
    if let Some(tag) = &args.vendor_tag {
        config = config.with_vendor_tag(tag);
    }

    let link = connect(&config).await?;
    let session = link.session.clone();

    tokio::select! {
        result = simulate(&session, &config) => {
            if let Err(e) = result {
                error!("Simulation stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }

    drop(session);
    link.shutdown("simulator stopping").await;
    Ok(())
}

/// Boot, report connectors, then stay up until the link closes
async fn simulate(session: &ClientSession, config: &ChargePointConfig) -> Result<(), OcppError> {
    let boot = session
        .boot(&BootHandshakeRequest {
            model: config.model.clone(),
            vendor_name: config.vendor.clone(),
            reason: config.boot_reason,
        })
        .await?;
    info!(
        "Boot {:?} at {}, keep-alive interval: {}s",
        boot.status, boot.accepted_at, boot.keep_alive_interval_seconds
    );

    if boot.status == RegistrationStatus::Accepted {
        for connector_id in 1..=config.connector_count {
            session
                .status_report(&StatusReportRequest {
                    timestamp: Utc::now(),
                    connector_status: ConnectorStatus::Available,
                    evse_id: 1,
                    connector_id: connector_id as i32,
                })
                .await?;
            info!(connector_id, "StatusReport acknowledged");
        }
    } else {
        warn!("Not accepted, waiting for the central system to close the link");
    }

    session.closed().await;
    info!("Connection closed");
    Ok(())
}
