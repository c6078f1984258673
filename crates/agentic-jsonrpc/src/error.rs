//! Codec errors and the reserved JSON-RPC error codes.

/// Reserved error codes shared by both peers.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    /// The connection closed before the request settled.
    pub const CONNECTION_CLOSED: i32 = -32000;
    /// The request did not settle before its deadline.
    pub const REQUEST_TIMEOUT: i32 = -32001;
}

/// Errors raised while decoding or encoding wire messages.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("Empty message")]
    Empty,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unsupported jsonrpc version: {0}")]
    InvalidVersion(String),
}

impl CodecError {
    /// Every codec failure is reported as a parse error.
    pub fn code(&self) -> i32 {
        error_codes::PARSE_ERROR
    }
}

/// Convenience result type.
pub type CodecResult<T> = Result<T, CodecError>;
