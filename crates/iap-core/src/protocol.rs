//! Protocol and transport policy capabilities
//!
//! Both traits are deliberately narrow: a stable identity that takes part in
//! pooling equivalence, and a verdict on whether a target is permitted.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;

use crate::types::InstanceLocator;

/// Application-level protocol carried over a tunnel
pub trait Protocol: Send + Sync + fmt::Debug {
    /// Stable identifier, used as part of the pooling key
    fn id(&self) -> &str;

    /// Whether this protocol may be used against the given target
    fn is_permitted(&self, target: &InstanceLocator, port: u16) -> bool;
}

/// Decides which tunnels may be created and who may use them
pub trait TransportPolicy: Send + Sync + fmt::Debug {
    /// Stable identifier, used as part of the pooling key
    fn id(&self) -> &str;

    /// Whether a tunnel to the given target may be created
    fn is_permitted(&self, target: &InstanceLocator, port: u16) -> bool;

    /// Whether a local client connecting from `peer` may use the tunnel
    fn is_client_allowed(&self, peer: SocketAddr) -> bool {
        peer.ip().is_loopback()
    }
}

/// Remote Desktop Protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rdp;

impl Rdp {
    /// Default RDP port
    pub const DEFAULT_PORT: u16 = 3389;
}

impl Protocol for Rdp {
    fn id(&self) -> &str {
        "rdp"
    }

    fn is_permitted(&self, _target: &InstanceLocator, port: u16) -> bool {
        port != 0
    }
}

/// Secure Shell
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ssh;

impl Ssh {
    /// Default SSH port
    pub const DEFAULT_PORT: u16 = 22;
}

impl Protocol for Ssh {
    fn id(&self) -> &str {
        "ssh"
    }

    fn is_permitted(&self, _target: &InstanceLocator, port: u16) -> bool {
        port != 0
    }
}

/// Permits every target; local clients must still be on loopback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllowAllPolicy;

impl TransportPolicy for AllowAllPolicy {
    fn id(&self) -> &str {
        "allow-all"
    }

    fn is_permitted(&self, _target: &InstanceLocator, _port: u16) -> bool {
        true
    }
}

/// Permits only an explicit set of target ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAllowListPolicy {
    id: String,
    ports: BTreeSet<u16>,
}

impl PortAllowListPolicy {
    /// Create a policy permitting the given ports
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        let ports: BTreeSet<u16> = ports.into_iter().collect();
        let id = format!(
            "ports:{}",
            ports
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(",")
        );
        Self { id, ports }
    }
}

impl TransportPolicy for PortAllowListPolicy {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_permitted(&self, _target: &InstanceLocator, port: u16) -> bool {
        self.ports.contains(&port)
    }
}
