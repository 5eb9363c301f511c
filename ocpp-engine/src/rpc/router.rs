//! Server-side action dispatch
//!
//! A `Router` is a table of action name -> handler, filled once at startup and then
//! shared read-only (`Arc<Router>`) by every session. Every CALL it sees is answered:
//! unknown actions get a `NotImplemented` CALLERROR so the caller's correlation
//! still resolves.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::OcppError;
use crate::ocpp::{Call, CallError, CallResult, Envelope, ErrorCode};

/// Error returned by a handler, sent back verbatim as a CALLERROR
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {description}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl HandlerError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    fn into_call_error(self, message_id: &str) -> CallError {
        CallError::new(message_id, self.code, self.description).with_details(self.details)
    }
}

/// Why a CALL did not produce a result
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error("No handler for action {0}")]
    NotImplemented(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl DispatchError {
    /// Build the CALLERROR answering `call`
    pub fn to_call_error(&self, call: &Call) -> CallError {
        match self {
            DispatchError::NotImplemented(action) => CallError::new(
                &call.message_id,
                ErrorCode::NotImplemented,
                format!("Action {} is not implemented", action),
            ),
            DispatchError::Handler(e) => e.clone().into_call_error(&call.message_id),
        }
    }
}

/// Maps a CALL payload to a CALLRESULT payload
pub trait ActionHandler: Send + Sync {
    fn handle(&self, payload: Value) -> Result<Value, HandlerError>;
}

impl<F> ActionHandler for F
where
    F: Fn(Value) -> Result<Value, HandlerError> + Send + Sync,
{
    fn handle(&self, payload: Value) -> Result<Value, HandlerError> {
        self(payload)
    }
}

/// Handler working on typed request/response structs.
///
/// A payload that does not deserialize into `Req` is answered with `FormatViolation`.
pub struct TypedHandler<Req, Resp, F> {
    f: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

/// Wrap a typed closure as an [`ActionHandler`]
pub fn typed<Req, Resp, F>(f: F) -> TypedHandler<Req, Resp, F>
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: Fn(Req) -> Result<Resp, HandlerError> + Send + Sync,
{
    TypedHandler {
        f,
        _types: PhantomData,
    }
}

impl<Req, Resp, F> ActionHandler for TypedHandler<Req, Resp, F>
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: Fn(Req) -> Result<Resp, HandlerError> + Send + Sync,
{
    fn handle(&self, payload: Value) -> Result<Value, HandlerError> {
        let request: Req = serde_json::from_value(payload)
            .map_err(|e| HandlerError::new(ErrorCode::FormatViolation, e.to_string()))?;

        let response = (self.f)(request)?;

        serde_json::to_value(response)
            .map_err(|e| HandlerError::new(ErrorCode::InternalError, e.to_string()))
    }
}

/// Hook for payload schema checks, run before the handler
pub trait PayloadValidator: Send + Sync {
    fn validate(&self, action: &str, payload: &Value) -> Result<(), HandlerError>;
}

/// Action routing table
#[derive(Default)]
pub struct Router {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
    validator: Option<Arc<dyn PayloadValidator>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut actions: Vec<_> = self.actions().collect();
        actions.sort_unstable();
        f.debug_struct("Router")
            .field("actions", &actions)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for an action. Each action can be registered once.
    pub fn register_handler(
        &mut self,
        action: impl Into<String>,
        handler: impl ActionHandler + 'static,
    ) -> Result<(), OcppError> {
        let action = action.into();
        if self.handlers.contains_key(&action) {
            return Err(OcppError::DuplicateAction(action));
        }

        debug!("Registered handler for {}", action);
        self.handlers.insert(action, Arc::new(handler));
        Ok(())
    }

    /// Builder-style registration
    pub fn with_handler(
        mut self,
        action: impl Into<String>,
        handler: impl ActionHandler + 'static,
    ) -> Result<Self, OcppError> {
        self.register_handler(action, handler)?;
        Ok(self)
    }

    pub fn with_validator(mut self, validator: impl PayloadValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Registered action names
    pub fn actions(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Run the handler registered for `call.action`
    pub fn dispatch(&self, call: &Call) -> Result<Value, DispatchError> {
        let handler = self
            .handlers
            .get(&call.action)
            .ok_or_else(|| DispatchError::NotImplemented(call.action.clone()))?;

        if let Some(validator) = &self.validator {
            validator.validate(&call.action, &call.payload)?;
        }

        Ok(handler.handle(call.payload.clone())?)
    }

    /// Answer a CALL with either a CALLRESULT or a CALLERROR carrying the same id
    pub fn handle(&self, call: &Call) -> Envelope {
        match self.dispatch(call) {
            Ok(payload) => Envelope::CallResult(CallResult::new(&call.message_id, payload)),
            Err(e) => {
                warn!(
                    id = %call.message_id,
                    action = %call.action,
                    "Answering with CALLERROR: {}", e
                );
                Envelope::CallError(e.to_call_error(call))
            }
        }
    }
}
