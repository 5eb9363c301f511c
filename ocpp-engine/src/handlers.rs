//! Reference handlers for the central system
//!
//! Plain registered handlers; the router knows nothing about them.

use chrono::Utc;
use tracing::{debug, info};

use crate::config::CentralConfig;
use crate::error::OcppError;
use crate::ocpp::{
    BootHandshakeRequest, BootHandshakeResponse, KeepAliveRequest, KeepAliveResponse,
    RegistrationStatus, StatusReportRequest, StatusReportResponse, BOOT_HANDSHAKE, KEEP_ALIVE,
    STATUS_REPORT,
};
use crate::rpc::{typed, ActionHandler, Router};

/// Decides whether a booting station is accepted
pub type BootPolicy = Box<dyn Fn(&BootHandshakeRequest) -> RegistrationStatus + Send + Sync>;

pub fn accept_all(_: &BootHandshakeRequest) -> RegistrationStatus {
    RegistrationStatus::Accepted
}

/// Accept only the listed vendors
pub fn vendor_allowlist(vendors: Vec<String>) -> BootPolicy {
    Box::new(move |req: &BootHandshakeRequest| {
        if vendors.iter().any(|v| *v == req.vendor_name) {
            RegistrationStatus::Accepted
        } else {
            RegistrationStatus::Rejected
        }
    })
}

/// BootHandshake: registers the station and hands out the keep-alive interval
pub fn boot_handshake<P>(keep_alive_interval_secs: u64, policy: P) -> impl ActionHandler
where
    P: Fn(&BootHandshakeRequest) -> RegistrationStatus + Send + Sync + 'static,
{
    typed(move |req: BootHandshakeRequest| {
        let status = policy(&req);
        info!(
            model = %req.model,
            vendor = %req.vendor_name,
            reason = ?req.reason,
            "BootHandshake {:?}, keep-alive interval: {}s",
            status,
            keep_alive_interval_secs
        );

        Ok(BootHandshakeResponse {
            accepted_at: Utc::now(),
            keep_alive_interval_seconds: keep_alive_interval_secs,
            status,
        })
    })
}

/// StatusReport: logged and acknowledged with an empty payload
pub fn status_report() -> impl ActionHandler {
    typed(|req: StatusReportRequest| {
        info!(
            connector_status = ?req.connector_status,
            evse_id = req.evse_id,
            connector_id = req.connector_id,
            timestamp = %req.timestamp,
            "StatusReport received"
        );
        Ok(StatusReportResponse {})
    })
}

/// KeepAlive: answered with the server clock
pub fn keep_alive() -> impl ActionHandler {
    typed(|req: KeepAliveRequest| {
        if let Some(custom) = &req.custom_data {
            debug!(vendor_id = %custom.vendor_id, "KeepAlive received");
        } else {
            debug!("KeepAlive received");
        }
        Ok(KeepAliveResponse {
            server_time: Utc::now(),
        })
    })
}

/// Router with the three reference actions registered
pub fn reference_router(config: &CentralConfig) -> Result<Router, OcppError> {
    let policy: BootPolicy = match &config.accepted_vendors {
        Some(vendors) => vendor_allowlist(vendors.clone()),
        None => Box::new(accept_all),
    };

    Router::new()
        .with_handler(
            BOOT_HANDSHAKE,
            boot_handshake(config.keep_alive_interval_secs, policy),
        )?
        .with_handler(STATUS_REPORT, status_report())?
        .with_handler(KEEP_ALIVE, keep_alive())
}
