//! RPC wire protocol.
//!
//! Outer framing: ASCII decimal payload length, a newline, then exactly
//! that many payload bytes; replies are framed identically. The payload is
//! the `cplane-config-leader-v1` protocol: a JSON `{method, args}` pair in,
//! `{"ok": ...}` or `{"err": {"code", "message"}}` out.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mutator::MutatorError;
use crate::schema::SchemaError;

/// Framing cap: a length prefix above this terminates the peer before any
/// buffer is allocated.
pub const MAX_PAYLOAD_LEN: usize = 100_000_000;

/// Protocol identifier spoken over the control socket.
pub const PROTOCOL: &str = "cplane-config-leader-v1";

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("schema mismatch: leader serves `{expected}`, request names `{got}`")]
    SchemaMismatch { expected: String, got: String },

    #[error("length prefix {len} exceeds the framing cap")]
    LengthOverflow { len: u64 },

    #[error("malformed length prefix")]
    BadLength,

    #[error("short read")]
    ShortRead,

    #[error("short write")]
    ShortWrite,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    pub fn code(&self) -> &'static str {
        match self {
            RpcError::Parse(_) => "parse_error",
            RpcError::SchemaMismatch { .. } => "schema_mismatch",
            RpcError::LengthOverflow { .. } => "length_overflow",
            RpcError::BadLength => "bad_length",
            RpcError::ShortRead => "short_read",
            RpcError::ShortWrite => "short_write",
            RpcError::Io(_) => "io_error",
        }
    }
}

/// An RPC request: `{method, args}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "kebab-case")]
pub enum Request {
    Describe,
    GetConfig {
        schema: String,
        path: String,
    },
    SetConfig {
        schema: String,
        path: String,
        config: String,
    },
    AddConfig {
        schema: String,
        path: String,
        config: String,
    },
    RemoveConfig {
        schema: String,
        path: String,
    },
}

impl Request {
    /// Schema named by the request, for the leader's mutation assertion.
    pub fn schema(&self) -> Option<&str> {
        match self {
            Request::Describe => None,
            Request::GetConfig { schema, .. }
            | Request::SetConfig { schema, .. }
            | Request::AddConfig { schema, .. }
            | Request::RemoveConfig { schema, .. } => Some(schema),
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Request::SetConfig { .. } | Request::AddConfig { .. } | Request::RemoveConfig { .. }
        )
    }
}

/// An RPC response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Ok { ok: ResponsePayload },
    Err { err: ErrorPayload },
}

impl Response {
    pub fn ok(payload: ResponsePayload) -> Self {
        Response::Ok { ok: payload }
    }

    pub fn err(error: impl Into<ErrorPayload>) -> Self {
        Response::Err { err: error.into() }
    }
}

/// Method-specific results. Untagged: the field set identifies the variant,
/// with the empty mutation ack last.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    Describe { native_schema: String },
    Config { config: String },
    Empty {},
}

impl ResponsePayload {
    pub fn empty() -> Self {
        ResponsePayload::Empty {}
    }
}

/// Error response payload with a stable machine-readable code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: &str, message: String) -> Self {
        ErrorPayload {
            code: code.to_string(),
            message,
        }
    }
}

impl From<RpcError> for ErrorPayload {
    fn from(e: RpcError) -> Self {
        ErrorPayload::new(e.code(), e.to_string())
    }
}

impl From<MutatorError> for ErrorPayload {
    fn from(e: MutatorError) -> Self {
        ErrorPayload::new(e.code(), e.to_string())
    }
}

impl From<SchemaError> for ErrorPayload {
    fn from(e: SchemaError) -> Self {
        ErrorPayload::new("unknown_schema", e.to_string())
    }
}

/// Wrap a payload in the outer frame.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = payload.len().to_string().into_bytes();
    out.push(b'\n');
    out.extend_from_slice(payload);
    out
}

/// Decode a request payload.
pub fn decode_request(payload: &[u8]) -> Result<Request, RpcError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Encode a response and wrap it in the outer frame.
pub fn encode_response(response: &Response) -> Vec<u8> {
    let payload =
        serde_json::to_vec(response).expect("response serialization is infallible");
    frame(&payload)
}
