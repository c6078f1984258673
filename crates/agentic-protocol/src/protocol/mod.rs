//! The protocol engine: request correlation, handler dispatch, cancellation,
//! progress, timeouts, and capability negotiation.

pub mod cancellation;
mod dispatch;
pub mod engine;
pub mod handler;
pub mod negotiation;
pub mod tracker;

pub use cancellation::CancellationToken;
pub use engine::{CloseCallback, ConnectionState, ErrorCallback, Protocol};
pub use handler::{BoxFuture, RequestContext};
pub use negotiation::{CapabilityNegotiator, PeerInfo, Role};
pub use tracker::{ProgressCallback, RequestOptions, RequestTracker};
