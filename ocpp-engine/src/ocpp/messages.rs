//! OCPP-J envelope framing
//!
//! Every frame on the wire is a JSON array whose first element is the message type:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Decoding only checks this structural shape. Payloads are carried as raw JSON and
//! interpreted by whoever handles the action.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl TryFrom<i64> for MessageType {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(MessageType::Call),
            3 => Ok(MessageType::CallResult),
            4 => Ok(MessageType::CallError),
            other => Err(other),
        }
    }
}

/// OCPP error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    FormatViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl ErrorCode {
    /// Parse a wire error code; `None` for codes this side does not know
    pub fn from_wire(code: &str) -> Option<Self> {
        serde_json::from_value(Value::String(code.to_string())).ok()
    }
}

/// A frame that could not be read as an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        reason: String,
        /// The frame as received, for diagnostics
        raw: String,
    },
}

impl DecodeError {
    fn malformed(reason: impl Into<String>, bytes: &[u8]) -> Self {
        DecodeError::MalformedEnvelope {
            reason: reason.into(),
            raw: String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            DecodeError::MalformedEnvelope { reason, .. } => reason,
        }
    }

    pub fn raw(&self) -> &str {
        match self {
            DecodeError::MalformedEnvelope { raw, .. } => raw,
        }
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    pub fn new(message_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            action: action.into(),
            payload,
        }
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            payload,
        }
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a CALLERROR with empty details
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }
}

/// Any of the three envelope kinds
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Envelope {
    /// Get the correlation id
    pub fn message_id(&self) -> &str {
        match self {
            Envelope::Call(c) => &c.message_id,
            Envelope::CallResult(r) => &r.message_id,
            Envelope::CallError(e) => &e.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Envelope::Call(_) => MessageType::Call,
            Envelope::CallResult(_) => MessageType::CallResult,
            Envelope::CallError(_) => MessageType::CallError,
        }
    }
}

impl From<Call> for Envelope {
    fn from(call: Call) -> Self {
        Envelope::Call(call)
    }
}

impl From<CallResult> for Envelope {
    fn from(result: CallResult) -> Self {
        Envelope::CallResult(result)
    }
}

impl From<CallError> for Envelope {
    fn from(error: CallError) -> Self {
        Envelope::CallError(error)
    }
}

/// Encode an envelope into its JSON array form.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let array = match envelope {
        Envelope::Call(c) => serde_json::json!([
            MessageType::Call as i32,
            &c.message_id,
            &c.action,
            &c.payload
        ]),
        Envelope::CallResult(r) => serde_json::json!([
            MessageType::CallResult as i32,
            &r.message_id,
            &r.payload
        ]),
        Envelope::CallError(e) => serde_json::json!([
            MessageType::CallError as i32,
            &e.message_id,
            e.error_code.to_string(),
            &e.error_description,
            &e.error_details
        ]),
    };
    // A `Value` always renders; there is no failure path here.
    array.to_string().into_bytes()
}

/// Decode one transport frame into an envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| DecodeError::malformed(format!("invalid JSON: {}", e), bytes))?;

    let Value::Array(array) = value else {
        return Err(DecodeError::malformed("not a JSON array", bytes));
    };

    let type_id = array
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| DecodeError::malformed("missing integer message type", bytes))?;

    let msg_type = MessageType::try_from(type_id)
        .map_err(|t| DecodeError::malformed(format!("unknown message type {}", t), bytes))?;

    let expected_len = match msg_type {
        MessageType::Call => 4,
        MessageType::CallResult => 3,
        MessageType::CallError => 5,
    };
    if array.len() != expected_len {
        return Err(DecodeError::malformed(
            format!(
                "{:?} expects {} elements, got {}",
                msg_type,
                expected_len,
                array.len()
            ),
            bytes,
        ));
    }

    let message_id = non_empty_str(&array[1])
        .ok_or_else(|| DecodeError::malformed("missing message id", bytes))?
        .to_string();

    let envelope = match msg_type {
        MessageType::Call => {
            let action = non_empty_str(&array[2])
                .ok_or_else(|| DecodeError::malformed("missing action", bytes))?;

            Envelope::Call(Call {
                message_id,
                action: action.to_string(),
                payload: array[3].clone(),
            })
        }
        MessageType::CallResult => Envelope::CallResult(CallResult {
            message_id,
            payload: array[2].clone(),
        }),
        MessageType::CallError => {
            let raw_code = array[2]
                .as_str()
                .ok_or_else(|| DecodeError::malformed("error code is not a string", bytes))?;

            let error_description = array[3]
                .as_str()
                .ok_or_else(|| DecodeError::malformed("error description is not a string", bytes))?
                .to_string();

            // Unknown codes read as GenericError; the peer's code survives in the details
            let (error_code, error_details) = match ErrorCode::from_wire(raw_code) {
                Some(code) => (code, array[4].clone()),
                None => (
                    ErrorCode::GenericError,
                    details_with_code(raw_code, array[4].clone()),
                ),
            };

            Envelope::CallError(CallError {
                message_id,
                error_code,
                error_description,
                error_details,
            })
        }
    };

    Ok(envelope)
}

/// Key under which an unrecognized error code is kept in the details
pub const UNKNOWN_ERROR_CODE_KEY: &str = "unknownErrorCode";

fn details_with_code(raw_code: &str, details: Value) -> Value {
    let mut map = match details {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("details".to_string(), other);
            map
        }
    };
    map.insert(
        UNKNOWN_ERROR_CODE_KEY.to_string(),
        Value::String(raw_code.to_string()),
    );
    Value::Object(map)
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| !s.is_empty())
}
