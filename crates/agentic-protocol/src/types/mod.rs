//! Data types shared by the engine, its handlers, and its transports.

pub mod capabilities;
pub mod error;
pub mod notification;
pub mod request;

pub use agentic_jsonrpc::{
    JsonRpcError, JsonRpcErrorObject, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId, JSONRPC_VERSION,
};
pub use capabilities::*;
pub use error::*;
pub use notification::*;
pub use request::*;
