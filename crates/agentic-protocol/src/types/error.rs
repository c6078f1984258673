//! Error types and JSON-RPC error codes for the protocol engine.

use std::time::Duration;

use serde_json::Value;

use agentic_jsonrpc::{CodecError, JsonRpcError, JsonRpcErrorObject, RequestId, JSONRPC_VERSION};

pub use agentic_jsonrpc::error_codes;

/// Codes used only for local rejections; never written to the wire.
pub mod local_error_codes {
    /// The caller (or a dropped future) cancelled the request.
    pub const REQUEST_CANCELLED: i32 = -32800;
}

/// All errors surfaced by the engine.
#[derive(thiserror::Error, Debug)]
pub enum McpError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Request timed out after {}ms", .elapsed.as_millis())]
    RequestTimeout { elapsed: Duration },

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// Error response received from the peer.
    #[error("MCP error {code}: {message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    #[error("Capability not supported: {0}")]
    CapabilityNotSupported(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(String),

    #[error("Request cannot be cancelled: {0}")]
    NotCancellable(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    pub fn code(&self) -> i32 {
        use error_codes::*;
        use local_error_codes::*;
        match self {
            McpError::ParseError(_) => PARSE_ERROR,
            McpError::InvalidRequest(_) => INVALID_REQUEST,
            McpError::MethodNotFound(_) => METHOD_NOT_FOUND,
            McpError::InvalidParams(_) => INVALID_PARAMS,
            McpError::InternalError(_) => INTERNAL_ERROR,
            McpError::ConnectionClosed | McpError::NotConnected => CONNECTION_CLOSED,
            McpError::RequestTimeout { .. } => REQUEST_TIMEOUT,
            McpError::Cancelled(_) => REQUEST_CANCELLED,
            McpError::Rpc { code, .. } => *code,
            McpError::CapabilityNotSupported(_)
            | McpError::UnsupportedProtocolVersion(_)
            | McpError::NotCancellable(_) => INVALID_REQUEST,
            McpError::AlreadyConnected | McpError::Transport(_) | McpError::Io(_) => {
                INTERNAL_ERROR
            }
            McpError::Json(_) => PARSE_ERROR,
        }
    }

    /// Structured data attached by the peer, if any.
    pub fn data(&self) -> Option<&Value> {
        match self {
            McpError::Rpc { data, .. } => data.as_ref(),
            _ => None,
        }
    }

    pub fn to_json_rpc_error(&self, id: RequestId) -> JsonRpcError {
        let (message, data) = match self {
            McpError::Rpc { message, data, .. } => (message.clone(), data.clone()),
            other => (other.to_string(), None),
        };
        JsonRpcError {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error: JsonRpcErrorObject {
                code: self.code(),
                message,
                data,
            },
        }
    }
}

impl From<JsonRpcErrorObject> for McpError {
    fn from(e: JsonRpcErrorObject) -> Self {
        McpError::Rpc {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

impl From<CodecError> for McpError {
    fn from(e: CodecError) -> Self {
        McpError::ParseError(e.to_string())
    }
}

pub type McpResult<T> = Result<T, McpError>;
