//! OCPP-J wire layer
//!
//! - `messages`: envelope framing (CALL, CALLRESULT, CALLERROR)
//! - `types`: payloads for the reference actions

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
