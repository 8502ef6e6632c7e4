//! Tunnel profiles and their pooling key

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::ProfileError;
use crate::protocol::{Protocol, TransportPolicy};
use crate::types::InstanceLocator;

/// Immutable description of a desired tunnel
#[derive(Clone)]
pub struct TunnelProfile {
    protocol: Arc<dyn Protocol>,
    policy: Arc<dyn TransportPolicy>,
    target_instance: InstanceLocator,
    target_port: u16,
    local_endpoint: Option<SocketAddr>,
}

/// Equivalence key for pooling.
///
/// Two profiles share a tunnel iff their keys are equal. The preferred local
/// endpoint is not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProfileKey {
    /// Protocol identity
    pub protocol: String,
    /// Policy identity
    pub policy: String,
    /// Target instance
    pub instance: InstanceLocator,
    /// Target port
    pub port: u16,
}

impl TunnelProfile {
    /// Create a new profile, rejecting port 0
    pub fn new(
        protocol: Arc<dyn Protocol>,
        policy: Arc<dyn TransportPolicy>,
        target_instance: InstanceLocator,
        target_port: u16,
        local_endpoint: Option<SocketAddr>,
    ) -> Result<Self, ProfileError> {
        if target_port == 0 {
            return Err(ProfileError::InvalidPort(target_port));
        }

        Ok(Self {
            protocol,
            policy,
            target_instance,
            target_port,
            local_endpoint,
        })
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    pub fn policy(&self) -> &Arc<dyn TransportPolicy> {
        &self.policy
    }

    pub fn target_instance(&self) -> &InstanceLocator {
        &self.target_instance
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    /// Preferred local endpoint, if the caller asked for one
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.local_endpoint
    }

    /// Pooling key for this profile
    pub fn key(&self) -> ProfileKey {
        ProfileKey {
            protocol: self.protocol.id().to_string(),
            policy: self.policy.id().to_string(),
            instance: self.target_instance.clone(),
            port: self.target_port,
        }
    }

    /// Whether both protocol and policy permit this target
    pub fn is_permitted(&self) -> bool {
        self.protocol
            .is_permitted(&self.target_instance, self.target_port)
            && self
                .policy
                .is_permitted(&self.target_instance, self.target_port)
    }
}

impl fmt::Debug for TunnelProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelProfile")
            .field("protocol", &self.protocol.id())
            .field("policy", &self.policy.id())
            .field("target_instance", &self.target_instance)
            .field("target_port", &self.target_port)
            .field("local_endpoint", &self.local_endpoint)
            .finish()
    }
}

impl fmt::Display for TunnelProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} ({}, {})",
            self.target_instance,
            self.target_port,
            self.protocol.id(),
            self.policy.id()
        )
    }
}
