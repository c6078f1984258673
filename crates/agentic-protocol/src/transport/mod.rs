//! Transport abstraction: a bidirectional pipe for whole JSON-RPC messages.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::types::{JsonRpcMessage, McpError, McpResult};

pub mod memory;
#[cfg(feature = "stdio")]
pub mod stdio;

pub use memory::InMemoryTransport;
#[cfg(feature = "stdio")]
pub use stdio::StdioTransport;

/// What a transport reports upward after [`Transport::start`].
#[derive(Debug)]
pub enum TransportEvent {
    /// One decoded JSON value, not yet classified.
    Message(Value),
    /// A non-fatal fault, e.g. an undecodable line.
    Error(McpError),
    /// The underlying channel is gone. Sent at most once.
    Closed,
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// A message pipe owned by one engine for the lifetime of a connection.
///
/// Implementations deliver inbound messages in arrival order.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin delivering inbound traffic to `events`.
    async fn start(&self, events: TransportEvents) -> McpResult<()>;

    async fn send(&self, message: JsonRpcMessage) -> McpResult<()>;

    async fn close(&self) -> McpResult<()>;

    /// Identifier of the transport session, if the transport has one.
    fn session_id(&self) -> Option<String> {
        None
    }
}
