//! Error taxonomy for tunnels and transports

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while creating or running a tunnel
#[derive(Error, Debug)]
pub enum TunnelError {
    /// The local listener could not bind to the candidate port
    #[error("Access to local port {} denied: {source}", .endpoint.port())]
    PortAccessDenied {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The relay endpoint refused to relay to the target
    #[error("Relay access denied: {0}")]
    RelayAccessDenied(String),

    /// The network stream closed while the relay session was set up
    #[error("Network stream closed: {0}")]
    NetworkStreamClosed(String),

    /// The transport channel (for example a proxy) refused the connection
    #[error("Connection denied: {0}")]
    ConnectionDenied(String),

    /// The protocol or transport policy does not permit this target
    #[error("Policy {policy} does not permit {target}")]
    PolicyDenied { policy: String, target: String },

    /// The requested local endpoint cannot be used for this tunnel
    #[error("Invalid local endpoint {0}")]
    InvalidEndpoint(SocketAddr),

    /// Creation did not complete in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Creation was cancelled by the caller
    #[error("Cancelled")]
    Cancelled,

    /// Other I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Whether the error is a local port conflict that warrants another port
    pub fn is_port_access_denied(&self) -> bool {
        matches!(self, TunnelError::PortAccessDenied { .. })
    }

    /// Map a bind error for `endpoint` into the taxonomy
    pub fn from_bind(endpoint: SocketAddr, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied => {
                TunnelError::PortAccessDenied { endpoint, source }
            }
            _ => TunnelError::Io(source),
        }
    }
}

/// Remediation hint attached to a failed transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelpTopic {
    /// The user lacks permission to tunnel to the instance
    IapAccess,
    /// A firewall rule for the IAP range is missing
    CreateIapFirewallRule,
    /// The proxy rejected or interfered with the connection
    ProxyConfiguration,
    /// No local port could be bound
    LocalPortAccess,
    /// No specific remediation
    General,
}

impl HelpTopic {
    /// Stable identifier for UI lookups
    pub fn id(&self) -> &'static str {
        match self {
            HelpTopic::IapAccess => "iap-access",
            HelpTopic::CreateIapFirewallRule => "create-iap-firewall-rule",
            HelpTopic::ProxyConfiguration => "proxy-configuration",
            HelpTopic::LocalPortAccess => "local-port-access",
            HelpTopic::General => "general",
        }
    }

    /// Classify a tunnel error
    pub fn for_error(error: &TunnelError) -> Self {
        match error {
            TunnelError::RelayAccessDenied(_) => HelpTopic::IapAccess,
            TunnelError::NetworkStreamClosed(_) => HelpTopic::CreateIapFirewallRule,
            TunnelError::ConnectionDenied(_) => HelpTopic::ProxyConfiguration,
            TunnelError::PortAccessDenied { .. } => HelpTopic::LocalPortAccess,
            TunnelError::PolicyDenied { .. }
            | TunnelError::InvalidEndpoint(_)
            | TunnelError::Timeout(_)
            | TunnelError::Cancelled
            | TunnelError::Io(_) => HelpTopic::General,
        }
    }
}

impl fmt::Display for HelpTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// The single error kind returned when a transport cannot be created
#[derive(Error, Debug)]
#[error("Transport failed [{topic}]: {source}")]
pub struct TransportFailed {
    topic: HelpTopic,
    #[source]
    source: TunnelError,
}

impl TransportFailed {
    pub fn new(source: TunnelError) -> Self {
        Self {
            topic: HelpTopic::for_error(&source),
            source,
        }
    }

    /// Remediation hint for the UI
    pub fn help_topic(&self) -> HelpTopic {
        self.topic
    }

    /// Underlying cause
    pub fn reason(&self) -> &TunnelError {
        &self.source
    }

    pub fn into_reason(self) -> TunnelError {
        self.source
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.source, TunnelError::Cancelled)
    }
}

impl From<TunnelError> for TransportFailed {
    fn from(source: TunnelError) -> Self {
        Self::new(source)
    }
}

/// Invalid tunnel profile input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    /// Port outside 1-65535
    #[error("Invalid target port: {0}")]
    InvalidPort(u16),

    /// Unparseable instance locator
    #[error("Invalid instance locator: {0}")]
    InvalidLocator(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
