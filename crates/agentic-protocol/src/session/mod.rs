//! Per-session state kept by a responder.

pub mod levels;

pub use levels::LogLevelRegistry;
