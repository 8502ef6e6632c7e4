//! Tunnel creation with local port retry

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use iap_core::config::{PortRange, TransportConfig};
use iap_core::{TunnelError, TunnelProfile};

use super::listener::{ListenerBinder, RelayListener, TcpBinder, DEFAULT_BUFFER_SIZE};
use super::{Tunnel, TunnelFlags};
use crate::relay::{RelayClient, RelayTarget};

/// Default number of ports tried before a port conflict is reported
pub const DEFAULT_PORT_RETRY_ATTEMPTS: u32 = 5;

/// Random draws before falling back to a linear scan for a free candidate
const RANDOM_CANDIDATE_DRAWS: usize = 32;

/// Creates tunnels for profiles
#[async_trait]
pub trait TunnelFactory: Send + Sync {
    /// Create a live tunnel for `profile`, verifying the relay within `timeout`
    async fn create_tunnel(
        &self,
        profile: &TunnelProfile,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<Tunnel>, TunnelError>;
}

/// Creates tunnels that relay through targets supplied by a `RelayClient`
pub struct RelayTunnelFactory {
    client: Arc<dyn RelayClient>,
    binder: Arc<dyn ListenerBinder>,
    max_attempts: u32,
    ephemeral_ports: PortRange,
    buffer_size: usize,
    flags: TunnelFlags,
}

impl RelayTunnelFactory {
    /// Create a factory with default settings
    pub fn new(client: Arc<dyn RelayClient>) -> Self {
        Self {
            client,
            binder: Arc::new(TcpBinder),
            max_attempts: DEFAULT_PORT_RETRY_ATTEMPTS,
            ephemeral_ports: PortRange::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            flags: TunnelFlags::default(),
        }
    }

    /// Create a factory from configuration
    pub fn from_config(client: Arc<dyn RelayClient>, config: &TransportConfig) -> Self {
        Self {
            client,
            binder: Arc::new(TcpBinder),
            max_attempts: config.port_retry_attempts.max(1),
            ephemeral_ports: config.ephemeral_ports,
            buffer_size: config.relay_buffer_size,
            flags: TunnelFlags {
                loopback_only: config.loopback_only,
            },
        }
    }

    /// Replace the socket binder
    pub fn with_binder(mut self, binder: Arc<dyn ListenerBinder>) -> Self {
        self.binder = binder;
        self
    }

    pub fn with_ephemeral_ports(mut self, ports: PortRange) -> Self {
        self.ephemeral_ports = ports;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_flags(mut self, flags: TunnelFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Bind a local listener for `profile` and start relaying to `target`.
    ///
    /// Port conflicts are retried on other ephemeral ports, each attempt
    /// using a port not tried before. Other errors propagate immediately.
    pub fn create_tunnel_for_target(
        &self,
        profile: &TunnelProfile,
        target: Arc<dyn RelayTarget>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        let socket = self.bind_with_retry(profile, cancel)?;
        let listener = RelayListener::new(socket, target, Arc::clone(profile.policy()), self.flags)?
            .with_buffer_size(self.buffer_size);

        Ok(Tunnel::start(listener, profile.clone(), self.flags))
    }

    fn bind_with_retry(
        &self,
        profile: &TunnelProfile,
        cancel: &CancellationToken,
    ) -> Result<TcpListener, TunnelError> {
        let preferred = profile.local_endpoint();
        let default_ip = if self.flags.loopback_only {
            Ipv4Addr::LOCALHOST
        } else {
            Ipv4Addr::UNSPECIFIED
        };
        let ip = preferred
            .map(|endpoint| endpoint.ip())
            .unwrap_or(IpAddr::V4(default_ip));

        if self.flags.loopback_only && !ip.is_loopback() {
            if let Some(endpoint) = preferred {
                return Err(TunnelError::InvalidEndpoint(endpoint));
            }
        }

        let mut candidates = PortCandidates::new(self.ephemeral_ports);
        let mut endpoint = match preferred {
            Some(endpoint) if endpoint.port() != 0 => endpoint,
            _ => SocketAddr::new(ip, candidates.next_port().ok_or_else(no_free_port)?),
        };

        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(TunnelError::Cancelled);
            }

            candidates.exclude(endpoint.port());
            match self.binder.bind(endpoint) {
                Ok(socket) => {
                    if attempt > 1 {
                        tracing::info!(
                            "Bound {} on attempt {}/{}",
                            endpoint,
                            attempt,
                            self.max_attempts
                        );
                    }
                    return Ok(socket);
                }
                Err(e) if e.is_port_access_denied() && attempt < self.max_attempts => {
                    tracing::warn!(
                        "Local port {} unavailable (attempt {}/{}): {}",
                        endpoint.port(),
                        attempt,
                        self.max_attempts,
                        e
                    );
                    match candidates.next_port() {
                        Some(port) => endpoint = SocketAddr::new(ip, port),
                        None => return Err(e),
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl TunnelFactory for RelayTunnelFactory {
    async fn create_tunnel(
        &self,
        profile: &TunnelProfile,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        let target = self
            .client
            .relay_target(profile.target_instance(), profile.target_port())?;
        let tunnel = self.create_tunnel_for_target(profile, Arc::clone(&target), cancel)?;

        let probe = tokio::select! {
            result = target.probe(timeout) => result,
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
        };

        if let Err(e) = probe {
            tracing::warn!("Probing {} failed: {}", profile, e);
            tunnel.close().await;
            return Err(e);
        }

        Ok(tunnel)
    }
}

fn no_free_port() -> TunnelError {
    TunnelError::Io(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "no untried port left in the ephemeral range",
    ))
}

/// Hands out ports from a range, never the same port twice
struct PortCandidates {
    range: PortRange,
    tried: HashSet<u16>,
}

impl PortCandidates {
    fn new(range: PortRange) -> Self {
        Self {
            range,
            tried: HashSet::new(),
        }
    }

    fn exclude(&mut self, port: u16) {
        self.tried.insert(port);
    }

    fn next_port(&mut self) -> Option<u16> {
        if self.range.is_empty() {
            return None;
        }

        let mut rng = rand::thread_rng();
        for _ in 0..RANDOM_CANDIDATE_DRAWS {
            let port = rng.gen_range(self.range.as_range());
            if port != 0 && !self.tried.contains(&port) {
                return Some(port);
            }
        }

        self.range
            .as_range()
            .find(|port| *port != 0 && !self.tried.contains(port))
    }
}
