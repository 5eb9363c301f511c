//! Configuration for the engine, the central system and the charge point
//!
//! The central system can also be configured from a JSON file; anything missing
//! from the file keeps its default.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::OcppError;
use crate::ocpp::BootReason;

/// How outbound correlation ids are generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageIdStrategy {
    /// Random v4 UUIDs
    #[default]
    Uuid,
    /// 1, 2, 3, ... per session
    Sequential,
}

/// Keep-alive loop tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAlivePolicy {
    /// Timeout for each keep-alive call. Capped to the negotiated interval.
    pub call_timeout: Option<Duration>,

    /// Consecutive timeouts after which the loop gives up
    pub max_consecutive_failures: u32,

    /// Negotiated intervals above this are clamped down to it
    pub max_interval: Duration,
}

impl Default for KeepAlivePolicy {
    fn default() -> Self {
        Self {
            call_timeout: None,
            max_consecutive_failures: 3,
            max_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl KeepAlivePolicy {
    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures;
        self
    }

    /// Effective per-call timeout for a given interval
    pub fn timeout_for(&self, interval: Duration) -> Duration {
        match self.call_timeout {
            Some(timeout) => timeout.min(interval),
            None => interval,
        }
    }
}

/// Per-session engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default timeout for outbound calls
    pub call_timeout: Duration,

    pub keep_alive: KeepAlivePolicy,

    pub message_ids: MessageIdStrategy,

    /// Capacity of the outbound frame queue
    pub outbound_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            keep_alive: KeepAlivePolicy::default(),
            message_ids: MessageIdStrategy::Uuid,
            outbound_buffer: 64,
        }
    }
}

impl EngineConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_message_ids(mut self, strategy: MessageIdStrategy) -> Self {
        self.message_ids = strategy;
        self
    }

    pub fn with_keep_alive(mut self, policy: KeepAlivePolicy) -> Self {
        self.keep_alive = policy;
        self
    }
}

/// Central system (server) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CentralConfig {
    /// Listen address
    pub bind_addr: SocketAddr,

    /// Keep-alive interval handed out in BootHandshake results
    pub keep_alive_interval_secs: u64,

    /// If set, only these vendors are accepted at boot
    pub accepted_vendors: Option<Vec<String>>,

    /// Capacity of each connection's outbound frame queue
    pub outbound_buffer: usize,

    /// Optional log file, in addition to stdout
    pub log_file: Option<PathBuf>,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            keep_alive_interval_secs: 3,
            accepted_vendors: None,
            outbound_buffer: 64,
            log_file: None,
        }
    }
}

impl CentralConfig {
    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OcppError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            OcppError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            OcppError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), OcppError> {
        if self.keep_alive_interval_secs == 0 {
            return Err(OcppError::Config(
                "keepAliveIntervalSecs must be at least 1".into(),
            ));
        }
        if self.outbound_buffer == 0 {
            return Err(OcppError::Config("outboundBuffer must be at least 1".into()));
        }
        Ok(())
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_keep_alive_interval(mut self, secs: u64) -> Self {
        self.keep_alive_interval_secs = secs;
        self
    }

    pub fn with_accepted_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.accepted_vendors
            .get_or_insert_with(Vec::new)
            .push(vendor.into());
        self
    }
}

/// Charge point (client) configuration
#[derive(Debug, Clone)]
pub struct ChargePointConfig {
    /// CSMS WebSocket URL (without station ID)
    pub csms_url: String,

    /// Station ID (appended to URL)
    pub station_id: String,

    /// Vendor name for BootHandshake
    pub vendor: String,

    /// Model name for BootHandshake
    pub model: String,

    pub boot_reason: BootReason,

    /// Sent as `customData.vendorId` on every KeepAlive
    pub vendor_tag: Option<String>,

    /// Number of connectors to report after boot
    pub connector_count: u32,

    pub engine: EngineConfig,
}

impl Default for ChargePointConfig {
    fn default() -> Self {
        Self {
            csms_url: "ws://localhost:9000".to_string(),
            station_id: "CP1111".to_string(),
            vendor: "someVendor".to_string(),
            model: "someModel".to_string(),
            boot_reason: BootReason::Unknown,
            vendor_tag: None,
            connector_count: 1,
            engine: EngineConfig::default(),
        }
    }
}

impl ChargePointConfig {
    pub fn new(csms_url: impl Into<String>, station_id: impl Into<String>) -> Self {
        Self {
            csms_url: csms_url.into(),
            station_id: station_id.into(),
            ..Default::default()
        }
    }

    /// Set vendor info
    pub fn with_vendor(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self.model = model.into();
        self
    }

    pub fn with_boot_reason(mut self, reason: BootReason) -> Self {
        self.boot_reason = reason;
        self
    }

    pub fn with_vendor_tag(mut self, tag: impl Into<String>) -> Self {
        self.vendor_tag = Some(tag.into());
        self
    }

    pub fn with_connector_count(mut self, count: u32) -> Self {
        self.connector_count = count;
        self
    }

    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_charge_point_builder() {
        let config = ChargePointConfig::new("ws://localhost:9000", "CP2222")
            .with_vendor("EK", "EK3")
            .with_vendor_tag("CP2222")
            .with_connector_count(2);

        assert_eq!(config.station_id, "CP2222");
        assert_eq!(config.vendor, "EK");
        assert_eq!(config.model, "EK3");
        assert_eq!(config.vendor_tag.as_deref(), Some("CP2222"));
        assert_eq!(config.connector_count, 2);
        assert_eq!(config.boot_reason, BootReason::Unknown);
    }

    #[test]
    fn test_keep_alive_timeout_capped_to_interval() {
        let interval = Duration::from_secs(3);

        assert_eq!(KeepAlivePolicy::default().timeout_for(interval), interval);

        let policy = KeepAlivePolicy {
            call_timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        assert_eq!(policy.timeout_for(interval), interval);

        let policy = KeepAlivePolicy {
            call_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        assert_eq!(policy.timeout_for(interval), Duration::from_secs(1));
    }

    #[test]
    fn test_engine_keep_alive_policy() {
        let engine = EngineConfig::default()
            .with_keep_alive(KeepAlivePolicy::default().with_max_consecutive_failures(5));

        assert_eq!(engine.keep_alive.max_consecutive_failures, 5);
        assert_eq!(engine.keep_alive.max_interval, Duration::from_secs(86400));
        assert_eq!(engine.keep_alive.call_timeout, None);
    }

    #[test]
    fn test_central_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"bindAddr": "127.0.0.1:9100", "keepAliveIntervalSecs": 10, "acceptedVendors": ["someVendor"]}}"#
        )
        .unwrap();

        let config = CentralConfig::from_file(file.path()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9100".parse::<SocketAddr>().unwrap());
        assert_eq!(config.keep_alive_interval(), Duration::from_secs(10));
        assert_eq!(config.accepted_vendors, Some(vec!["someVendor".to_string()]));
        // Not in the file, so default
        assert_eq!(config.outbound_buffer, 64);
    }

    #[test]
    fn test_central_config_rejects_zero_interval() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"keepAliveIntervalSecs": 0}}"#).unwrap();

        assert!(matches!(
            CentralConfig::from_file(file.path()),
            Err(OcppError::Config(_))
        ));
    }

    #[test]
    fn test_central_config_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");

        assert!(matches!(
            CentralConfig::from_file(&missing),
            Err(OcppError::Config(msg)) if msg.contains("failed to read")
        ));
    }
}
