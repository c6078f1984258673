//! AgenticProtocol: a bidirectional JSON-RPC 2.0 engine for MCP peers.
//!
//! One [`Protocol`] drives one connection over one [`Transport`], as either
//! the initiating client or the responding server.

pub mod config;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;

pub use config::ProtocolOptions;
pub use protocol::{
    CancellationToken, ConnectionState, Protocol, RequestContext, RequestOptions, Role,
};
pub use transport::{InMemoryTransport, Transport, TransportEvent};
#[cfg(feature = "stdio")]
pub use transport::StdioTransport;
pub use types::{Capabilities, Implementation, McpError, McpResult};
