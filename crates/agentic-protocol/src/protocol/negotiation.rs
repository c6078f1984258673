//! Capability negotiation: local and peer capability sets, method gating,
//! and protocol-version agreement.

use parking_lot::Mutex;

use crate::config::ProtocolOptions;
use crate::types::{
    Capabilities, Implementation, InitializeParams, InitializeResult, McpError, McpResult,
};

/// Which end of the connection this engine plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiator: sends `initialize`.
    Client,
    /// Responder: answers `initialize`.
    Server,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Role::Client => "Client",
            Role::Server => "Server",
        }
    }
}

/// What the peer told us during the handshake.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub capabilities: Capabilities,
    pub implementation: Implementation,
    pub protocol_version: String,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Requirement {
    capability: &'static str,
    flag: Option<&'static str>,
}

const fn needs(capability: &'static str) -> Option<Requirement> {
    Some(Requirement {
        capability,
        flag: None,
    })
}

/// Capability the receiving role must declare to serve `method`.
fn request_requirement(receiver: Role, method: &str) -> Option<Requirement> {
    match (receiver, method) {
        (Role::Server, "logging/setLevel") => needs("logging"),
        (Role::Server, "prompts/get" | "prompts/list") => needs("prompts"),
        (Role::Server, "resources/subscribe" | "resources/unsubscribe") => Some(Requirement {
            capability: "resources",
            flag: Some("subscribe"),
        }),
        (Role::Server, "resources/list" | "resources/templates/list" | "resources/read") => {
            needs("resources")
        }
        (Role::Server, "tools/call" | "tools/list") => needs("tools"),
        (Role::Server, "completion/complete") => needs("completions"),
        (Role::Client, "sampling/createMessage") => needs("sampling"),
        (Role::Client, "roots/list") => needs("roots"),
        (Role::Client, "elicitation/create") => needs("elicitation"),
        _ => None,
    }
}

/// Capability the sending role must declare to emit `method`.
fn notification_requirement(sender: Role, method: &str) -> Option<Requirement> {
    match (sender, method) {
        (Role::Client, "notifications/roots/list_changed") => Some(Requirement {
            capability: "roots",
            flag: Some("listChanged"),
        }),
        (Role::Server, "notifications/message") => needs("logging"),
        (Role::Server, "notifications/resources/updated" | "notifications/resources/list_changed") => {
            needs("resources")
        }
        (Role::Server, "notifications/tools/list_changed") => needs("tools"),
        (Role::Server, "notifications/prompts/list_changed") => needs("prompts"),
        _ => None,
    }
}

fn satisfied(caps: &Capabilities, req: Requirement) -> bool {
    match req.flag {
        Some(flag) => caps.supports_flag(req.capability, flag),
        None => caps.supports(req.capability),
    }
}

fn describe(req: Requirement) -> String {
    match req.flag {
        Some(flag) => format!("{}.{}", req.capability, flag),
        None => req.capability.to_string(),
    }
}

/// Holds the local capability set (fixed) and the peer's (known only after
/// the handshake) and answers every gating question about them.
#[derive(Debug)]
pub struct CapabilityNegotiator {
    role: Role,
    local: Capabilities,
    strict: bool,
    supported_versions: Vec<String>,
    peer: Mutex<Option<PeerInfo>>,
}

impl CapabilityNegotiator {
    pub fn new(role: Role, local: Capabilities, options: &ProtocolOptions) -> Self {
        Self {
            role,
            local,
            strict: options.enforce_strict_capabilities,
            supported_versions: options.supported_protocol_versions.clone(),
            peer: Mutex::new(None),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local(&self) -> &Capabilities {
        &self.local
    }

    pub fn peer(&self) -> Option<PeerInfo> {
        self.peer.lock().clone()
    }

    pub fn peer_capabilities(&self) -> Option<Capabilities> {
        self.peer.lock().as_ref().map(|p| p.capabilities.clone())
    }

    pub fn record_peer(&self, info: PeerInfo) {
        tracing::info!(
            "Negotiated protocol {} with {} {} v{}",
            info.protocol_version,
            self.role.peer().label().to_lowercase(),
            info.implementation.name,
            info.implementation.version
        );
        *self.peer.lock() = Some(info);
    }

    pub fn is_supported_version(&self, version: &str) -> bool {
        self.supported_versions.iter().any(|v| v == version)
    }

    /// Responder side: echo a supported request, otherwise propose our latest.
    pub fn negotiate_version(&self, requested: &str) -> String {
        if self.is_supported_version(requested) {
            return requested.to_string();
        }
        let latest = self
            .supported_versions
            .first()
            .cloned()
            .unwrap_or_else(|| crate::types::LATEST_PROTOCOL_VERSION.to_string());
        tracing::warn!("Peer requested protocol version {requested}, proposing {latest}");
        latest
    }

    /// Initiator side: the responder's choice must be one we support.
    pub fn accept_version(&self, proposed: &str) -> McpResult<()> {
        if self.is_supported_version(proposed) {
            Ok(())
        } else {
            Err(McpError::UnsupportedProtocolVersion(proposed.to_string()))
        }
    }

    /// Responder side of `initialize`: agree on a version and remember the peer.
    pub fn accept_initialize(
        &self,
        params: InitializeParams,
        server_info: Implementation,
        instructions: Option<String>,
    ) -> InitializeResult {
        let protocol_version = self.negotiate_version(&params.protocol_version);
        self.record_peer(PeerInfo {
            capabilities: params.capabilities,
            implementation: params.client_info,
            protocol_version: protocol_version.clone(),
            instructions: None,
        });

        InitializeResult {
            protocol_version,
            capabilities: self.local.clone(),
            server_info,
            instructions,
        }
    }

    /// Gate an outbound request on the peer's declared capabilities.
    ///
    /// Requests the responder sends are always gated because the initiator
    /// must opt into serving them. Requests the initiator sends are gated
    /// only in strict mode; otherwise a violation is logged and allowed.
    pub fn assert_can_send_request(&self, method: &str) -> McpResult<()> {
        let Some(req) = request_requirement(self.role.peer(), method) else {
            return Ok(());
        };
        let enforced = self.strict || self.role == Role::Server;
        let peer_label = self.role.peer().label();

        let violation = match self.peer.lock().as_ref() {
            None => Some(format!(
                "{peer_label} capabilities not yet negotiated (required for {method})"
            )),
            Some(peer) if !satisfied(&peer.capabilities, req) => Some(format!(
                "{peer_label} does not support {} (required for {method})",
                describe(req)
            )),
            Some(_) => None,
        };

        match violation {
            Some(message) if enforced => Err(McpError::CapabilityNotSupported(message)),
            Some(message) => {
                tracing::warn!("{message}; sending anyway");
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Gate an outbound notification on our own declared capabilities.
    pub fn assert_can_send_notification(&self, method: &str) -> McpResult<()> {
        match notification_requirement(self.role, method) {
            Some(req) if !satisfied(&self.local, req) => {
                Err(McpError::CapabilityNotSupported(format!(
                    "{} does not declare {} (required for {method})",
                    self.role.label(),
                    describe(req)
                )))
            }
            _ => Ok(()),
        }
    }

    /// Gate handler registration on our own declared capabilities.
    pub fn assert_can_handle_request(&self, method: &str) -> McpResult<()> {
        match request_requirement(self.role, method) {
            Some(req) if !self.local.supports(req.capability) => {
                Err(McpError::CapabilityNotSupported(format!(
                    "{} does not declare {} (required for handling {method})",
                    self.role.label(),
                    req.capability
                )))
            }
            _ => Ok(()),
        }
    }
}
