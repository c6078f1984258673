//! Capability sets and initialization types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Newest protocol revision this engine speaks.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// Every revision this engine accepts, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &["2025-06-18", "2025-03-26", "2024-11-05", "2024-10-07"];

pub const SERVER_NAME: &str = "agentic-protocol";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Sparse mapping from capability name to an open options object.
///
/// Unknown capability names and option keys are kept verbatim so a set
/// received from one peer can be forwarded to another without loss.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities(Map<String, Value>);

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a capability with an options object.
    pub fn with(mut self, name: impl Into<String>, options: Value) -> Self {
        self.0.insert(name.into(), options);
        self
    }

    /// Declare a capability with no options.
    pub fn enable(self, name: impl Into<String>) -> Self {
        self.with(name, Value::Object(Map::new()))
    }

    /// Declared with a non-null options value.
    pub fn supports(&self, name: &str) -> bool {
        self.0.get(name).is_some_and(|options| !options.is_null())
    }

    /// True when `name` is declared and its options carry `flag: true`.
    pub fn supports_flag(&self, name: &str, flag: &str) -> bool {
        self.0
            .get(name)
            .and_then(|options| options.get(flag))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Capabilities advertised by the bundled responder binary.
    pub fn server_defaults() -> Self {
        Self::new().enable("logging")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: Capabilities,
    pub client_info: Implementation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub capabilities: Capabilities,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_keys_round_trip() {
        let raw = json!({
            "tools": {"listChanged": true},
            "experimental": {"x-vendor": {"depth": 3}},
            "futureThing": {"nested": [1, 2]}
        });
        let caps: Capabilities = serde_json::from_value(raw.clone()).unwrap();
        assert!(caps.supports("futureThing"));
        assert_eq!(serde_json::to_value(&caps).unwrap(), raw);
    }

    #[test]
    fn test_flags() {
        let caps = Capabilities::new()
            .with("resources", json!({"subscribe": true, "listChanged": false}))
            .enable("logging");
        assert!(caps.supports_flag("resources", "subscribe"));
        assert!(!caps.supports_flag("resources", "listChanged"));
        assert!(!caps.supports_flag("logging", "anything"));
        assert!(!caps.supports("tools"));
        assert_eq!(caps.names().count(), 2);
    }

    #[test]
    fn test_null_options_are_not_declared() {
        let caps: Capabilities =
            serde_json::from_value(json!({"logging": null, "tools": {}})).unwrap();
        assert!(!caps.supports("logging"));
        assert!(caps.supports("tools"));
    }

    #[test]
    fn test_initialize_params_camel_case() {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: Capabilities::new().enable("sampling"),
            client_info: Implementation::new("test-client", "1.0"),
        };
        let value = serde_json::to_value(params).unwrap();
        assert_eq!(value["protocolVersion"], LATEST_PROTOCOL_VERSION);
        assert_eq!(value["clientInfo"]["name"], "test-client");
        assert_eq!(value["capabilities"]["sampling"], json!({}));
    }
}
