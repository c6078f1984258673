//! Engine configuration loading and resolution.

use std::time::Duration;

use crate::types::SUPPORTED_PROTOCOL_VERSIONS;

/// Timeout applied to outbound requests that do not set their own.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub const REQUEST_TIMEOUT_ENV: &str = "AGENTIC_REQUEST_TIMEOUT_MS";
pub const STRICT_CAPABILITIES_ENV: &str = "AGENTIC_STRICT_CAPABILITIES";

/// Per-connection engine options.
#[derive(Debug, Clone)]
pub struct ProtocolOptions {
    /// Enforce peer capabilities for every outbound request, not only for
    /// requests the peer must have opted into.
    pub enforce_strict_capabilities: bool,
    pub request_timeout: Duration,
    /// Accepted protocol revisions, newest first. The first entry is proposed
    /// during the handshake.
    pub supported_protocol_versions: Vec<String>,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            enforce_strict_capabilities: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            supported_protocol_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
        }
    }
}

impl ProtocolOptions {
    /// Defaults overridden by the environment.
    pub fn from_env() -> Self {
        Self {
            enforce_strict_capabilities: resolve_strict_capabilities(None),
            request_timeout: resolve_request_timeout(None),
            ..Self::default()
        }
    }

    pub fn with_strict_capabilities(mut self, strict: bool) -> Self {
        self.enforce_strict_capabilities = strict;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_supported_versions<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_protocol_versions = versions.into_iter().map(Into::into).collect();
        self
    }

    /// Version proposed by an initiator.
    pub fn latest_version(&self) -> &str {
        self.supported_protocol_versions
            .first()
            .map(String::as_str)
            .unwrap_or(crate::types::LATEST_PROTOCOL_VERSION)
    }
}

/// Resolve the default request timeout.
pub fn resolve_request_timeout(explicit_ms: Option<u64>) -> Duration {
    if let Some(ms) = explicit_ms {
        return Duration::from_millis(ms);
    }

    if let Ok(raw) = std::env::var(REQUEST_TIMEOUT_ENV) {
        match raw.trim().parse::<u64>() {
            Ok(ms) => return Duration::from_millis(ms),
            Err(e) => tracing::warn!("Ignoring {REQUEST_TIMEOUT_ENV}={raw}: {e}"),
        }
    }

    DEFAULT_REQUEST_TIMEOUT
}

/// Resolve whether strict capability enforcement is on.
pub fn resolve_strict_capabilities(explicit: Option<bool>) -> bool {
    if let Some(strict) = explicit {
        return strict;
    }

    std::env::var(STRICT_CAPABILITIES_ENV)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = ProtocolOptions::default();
        assert!(!options.enforce_strict_capabilities);
        assert_eq!(options.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(options.latest_version(), crate::types::LATEST_PROTOCOL_VERSION);
    }

    #[test]
    fn test_explicit_values_win() {
        assert_eq!(resolve_request_timeout(Some(250)), Duration::from_millis(250));
        assert!(resolve_strict_capabilities(Some(true)));
        assert!(!resolve_strict_capabilities(Some(false)));
    }

    #[test]
    fn test_latest_version_follows_list_order() {
        let options = ProtocolOptions::default().with_supported_versions(["2024-11-05"]);
        assert_eq!(options.latest_version(), "2024-11-05");
    }
}
