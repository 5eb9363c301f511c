//! # OCPP Engine
//!
//! Bidirectional call/result engine for OCPP-J style links between a central
//! system and its charge points.
//!
//! ## Architecture
//!
//! ```text
//!  Charge point (client role)              Central system (server role)
//! ┌──────────────────────────┐            ┌──────────────────────────┐
//! │ ClientSession            │            │ ServerSession            │
//! │  ┌────────────┐          │  [2,...]   │          ┌────────────┐  │
//! │  │ Correlator │──────────┼───────────►┼─────────►│   Router   │  │
//! │  └────────────┘◄─────────┼◄───────────┼──────────└────────────┘  │
//! │  ┌────────────┐          │ [3|4,...]  │           handlers       │
//! │  │ KeepAlive  │          │            │                          │
//! │  └────────────┘          │            │                          │
//! └──────────────────────────┘            └──────────────────────────┘
//!            envelope codec on both ends, WebSocket underneath
//! ```
//!
//! ## Envelopes
//!
//! | Type | Shape |
//! |------|-------|
//! | CALL | `[2, id, action, payload]` |
//! | CALLRESULT | `[3, id, payload]` |
//! | CALLERROR | `[4, id, code, description, details]` |
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_engine::{connect, BootHandshakeRequest, BootReason, ChargePointConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ChargePointConfig::new("ws://localhost:9000", "CP1111");
//!     let link = connect(&config).await?;
//!
//!     let response = link
//!         .session
//!         .boot(&BootHandshakeRequest {
//!             model: config.model.clone(),
//!             vendor_name: config.vendor.clone(),
//!             reason: BootReason::PowerUp,
//!         })
//!         .await?;
//!     println!("Boot {:?}", response.status);
//!
//!     link.shutdown("done").await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod ocpp;
pub mod rpc;
pub mod session;
pub mod transport;

pub use config::{CentralConfig, ChargePointConfig, EngineConfig, KeepAlivePolicy, MessageIdStrategy};
pub use error::OcppError;
pub use handlers::reference_router;
pub use session::{ClientSession, Role, ServerSession, SessionState, TransportEvent};
pub use transport::{connect, serve, ClientConnection};

// Re-export key types
pub use ocpp::{
    decode, encode, BootHandshakeRequest, BootHandshakeResponse, BootReason, Call, CallError,
    CallResult, ConnectorStatus, DecodeError, Envelope, ErrorCode, KeepAliveRequest,
    RegistrationStatus, StatusReportRequest,
};
pub use rpc::{ActionHandler, Correlator, HandlerError, KeepAliveScheduler, KeepAliveState, Router};
