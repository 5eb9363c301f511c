//! Payload types for the reference actions
//!
//! Only the three actions a charging point needs to get on the air:
//! - BootHandshake (registration, negotiates the keep-alive interval)
//! - StatusReport (connector status)
//! - KeepAlive (liveness)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const BOOT_HANDSHAKE: &str = "BootHandshake";
pub const STATUS_REPORT: &str = "StatusReport";
pub const KEEP_ALIVE: &str = "KeepAlive";

// ============================================================================
// Enumerations
// ============================================================================

/// Connector status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorStatus {
    Available,
    Occupied,
    Reserved,
    Unavailable,
    Faulted,
}

/// Registration status for BootHandshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

/// Boot reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootReason {
    ApplicationReset,
    FirmwareUpdate,
    LocalReset,
    PowerUp,
    RemoteReset,
    ScheduledReset,
    Triggered,
    Unknown,
    Watchdog,
}

impl std::str::FromStr for BootReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown boot reason: {}", s))
    }
}

// ============================================================================
// Requests
// ============================================================================

/// BootHandshake request (CP -> CSMS)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootHandshakeRequest {
    pub model: String,
    pub vendor_name: String,
    pub reason: BootReason,
}

/// StatusReport request (CP -> CSMS)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReportRequest {
    pub timestamp: DateTime<Utc>,
    pub connector_status: ConnectorStatus,
    pub evse_id: i32,
    pub connector_id: i32,
}

/// Vendor tag carried on KeepAlive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomData {
    pub vendor_id: String,
}

/// KeepAlive request (CP -> CSMS)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepAliveRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<CustomData>,
}

impl KeepAliveRequest {
    pub fn tagged(vendor_id: Option<String>) -> Self {
        Self {
            custom_data: vendor_id.map(|vendor_id| CustomData { vendor_id }),
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// BootHandshake response (CSMS -> CP)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootHandshakeResponse {
    pub accepted_at: DateTime<Utc>,
    pub keep_alive_interval_seconds: u64,
    pub status: RegistrationStatus,
}

/// StatusReport response (CSMS -> CP)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusReportResponse {}

/// KeepAlive response (CSMS -> CP)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepAliveResponse {
    pub server_time: DateTime<Utc>,
}
