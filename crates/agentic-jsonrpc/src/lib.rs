//! AgenticJsonRpc: JSON-RPC 2.0 wire shapes, strict message classification, and line framing.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{classify, decode_line, frame_message, parse_line};
pub use error::{error_codes, CodecError, CodecResult};
pub use message::*;
