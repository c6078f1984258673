//! Typed notification descriptors and the notification payloads the engine itself uses.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use agentic_jsonrpc::RequestId;

use super::request::EmptyParams;

/// A notification method together with its parameter schema.
pub trait Notification: Send + 'static {
    const METHOD: &'static str;
    type Params: Serialize + DeserializeOwned + Send + 'static;
}

/// Caller-chosen tag correlating progress notifications to one in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    String(String),
    Number(i64),
}

impl std::fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressToken::String(s) => write!(f, "{s}"),
            ProgressToken::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<i64> for ProgressToken {
    fn from(n: i64) -> Self {
        ProgressToken::Number(n)
    }
}

impl From<&str> for ProgressToken {
    fn from(s: &str) -> Self {
        ProgressToken::String(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    pub progress_token: ProgressToken,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Syslog severities, least severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingMessageParams {
    pub level: LogLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logger: Option<String>,
    pub data: Value,
}

/// `notifications/initialized`: closes the handshake.
pub struct Initialized;

impl Notification for Initialized {
    const METHOD: &'static str = "notifications/initialized";
    type Params = EmptyParams;
}

/// `notifications/cancelled`: asks the peer to stop work on a request.
pub struct Cancelled;

impl Notification for Cancelled {
    const METHOD: &'static str = "notifications/cancelled";
    type Params = CancelledParams;
}

/// `notifications/progress`: progress for a request carrying a progress token.
pub struct Progress;

impl Notification for Progress {
    const METHOD: &'static str = "notifications/progress";
    type Params = ProgressParams;
}

/// `notifications/message`: a log record forwarded to the peer.
pub struct LoggingMessage;

impl Notification for LoggingMessage {
    const METHOD: &'static str = "notifications/message";
    type Params = LoggingMessageParams;
}
