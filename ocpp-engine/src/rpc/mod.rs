//! Call/result exchange
//!
//! - `router`: server side, action name -> handler
//! - `correlator`: client side, outbound calls matched to their responses
//! - `keepalive`: periodic KeepAlive after an accepted handshake

pub mod correlator;
pub mod keepalive;
pub mod router;

pub use correlator::Correlator;
pub use keepalive::{KeepAliveScheduler, KeepAliveState};
pub use router::{
    typed, ActionHandler, DispatchError, HandlerError, PayloadValidator, Router, TypedHandler,
};
