//! Transport configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Configuration for tunnel and transport creation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Default timeout for creating a tunnel, in seconds
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// How many local ports to try before giving up on a port conflict
    pub port_retry_attempts: u32,

    /// Candidate range for ephemeral local ports
    pub ephemeral_ports: PortRange,

    /// Pump buffer size per relay direction, in bytes
    pub relay_buffer_size: usize,

    /// Only bind and accept on loopback. When false, tunnels without a
    /// preferred local port listen on all interfaces and the transport
    /// policy alone decides which clients are admitted.
    pub loopback_only: bool,

    /// Instances reachable through the direct relay, keyed by instance path
    pub direct_targets: BTreeMap<String, DirectTarget>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            port_retry_attempts: 5,
            ephemeral_ports: PortRange::default(),
            relay_buffer_size: 16 * 1024,
            loopback_only: true,
            direct_targets: BTreeMap::new(),
        }
    }
}

impl TransportConfig {
    /// Check values that would make tunnel creation impossible
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "port_retry_attempts must be at least 1".into(),
            ));
        }
        if self.relay_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "relay_buffer_size must be non-zero".into(),
            ));
        }
        self.ephemeral_ports.validate()
    }
}

/// Inclusive range of local port numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

impl PortRange {
    pub fn new(first: u16, last: u16) -> Self {
        Self { first, last }
    }

    /// Number of ports in the range
    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            usize::from(self.last - self.first) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last < self.first
    }

    pub fn as_range(&self) -> RangeInclusive<u16> {
        self.first..=self.last
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.first == 0 || self.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "ephemeral port range {}-{} is empty or includes port 0",
                self.first, self.last
            )));
        }
        Ok(())
    }
}

impl Default for PortRange {
    /// IANA dynamic port range
    fn default() -> Self {
        Self {
            first: 49152,
            last: 65535,
        }
    }
}

/// Address of an instance reachable without the IAP relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectTarget {
    /// Host name or IP address
    pub host: String,
}
