//! Typed request descriptors and the request-side payloads the engine itself uses.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::capabilities::{InitializeParams, InitializeResult};
use super::notification::{LogLevel, ProgressToken};

/// A request method together with its parameter and result schemas.
///
/// The serde types act as the schema: inbound params that fail to decode
/// become InvalidParams, results that fail to decode reject the call.
pub trait Request: Send + 'static {
    const METHOD: &'static str;
    type Params: Serialize + DeserializeOwned + Send + 'static;
    type Result: Serialize + DeserializeOwned + Send + 'static;
}

/// Reserved `_meta` sub-field of request params.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_token: Option<ProgressToken>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RequestMeta {
    /// Extract `_meta` from raw request params, if present and well-formed.
    pub fn from_params(params: Option<&Value>) -> Option<Self> {
        params
            .and_then(|p| p.get("_meta"))
            .and_then(|meta| serde_json::from_value(meta.clone()).ok())
    }
}

/// Params for methods that carry none.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyParams {}

/// Result for methods that return nothing beyond success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmptyResult {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetLevelParams {
    pub level: LogLevel,
}

/// `initialize`: opens the handshake.
pub struct Initialize;

impl Request for Initialize {
    const METHOD: &'static str = "initialize";
    type Params = InitializeParams;
    type Result = InitializeResult;
}

/// `ping`: liveness check, always answered with an empty result.
pub struct Ping;

impl Request for Ping {
    const METHOD: &'static str = "ping";
    type Params = EmptyParams;
    type Result = EmptyResult;
}

/// `logging/setLevel`: sets the minimum severity the responder forwards.
pub struct SetLevel;

impl Request for SetLevel {
    const METHOD: &'static str = "logging/setLevel";
    type Params = SetLevelParams;
    type Result = EmptyResult;
}
