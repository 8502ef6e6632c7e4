//! Direct relay over plain TCP
//!
//! Connects straight to a configured host instead of going through the IAP
//! relay endpoint. Useful for instances reachable on a private network and
//! for local testing.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;

use iap_core::config::DirectTarget;
use iap_core::{InstanceLocator, ProfileError, TunnelError};

use super::{BoxRelayStream, RelayClient, RelayTarget};

/// Relay client backed by a static instance-to-host table
#[derive(Debug, Clone, Default)]
pub struct DirectRelayClient {
    hosts: BTreeMap<InstanceLocator, String>,
}

impl DirectRelayClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `direct_targets` config table
    pub fn from_config(targets: &BTreeMap<String, DirectTarget>) -> Result<Self, ProfileError> {
        let mut client = Self::new();
        for (instance, target) in targets {
            client.insert(instance.parse()?, target.host.clone());
        }
        Ok(client)
    }

    /// Route `instance` to `host`
    pub fn insert(&mut self, instance: InstanceLocator, host: impl Into<String>) {
        self.hosts.insert(instance, host.into());
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl RelayClient for DirectRelayClient {
    fn relay_target(
        &self,
        instance: &InstanceLocator,
        port: u16,
    ) -> Result<Arc<dyn RelayTarget>, TunnelError> {
        let host = self.hosts.get(instance).ok_or_else(|| {
            TunnelError::RelayAccessDenied(format!("{} is not a known direct target", instance))
        })?;

        Ok(Arc::new(DirectRelayTarget {
            instance: instance.clone(),
            host: host.clone(),
            port,
        }))
    }
}

/// A single host:port reached over TCP
#[derive(Debug, Clone)]
pub struct DirectRelayTarget {
    instance: InstanceLocator,
    host: String,
    port: u16,
}

#[async_trait]
impl RelayTarget for DirectRelayTarget {
    fn instance(&self) -> &InstanceLocator {
        &self.instance
    }

    fn port(&self) -> u16 {
        self.port
    }

    async fn connect(&self) -> Result<BoxRelayStream, TunnelError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| classify_connect_error(&self.host, self.port, e))?;
        stream.set_nodelay(true)?;

        tracing::debug!("Opened direct relay to {}:{}", self.host, self.port);
        Ok(Box::new(stream))
    }
}

fn classify_connect_error(host: &str, port: u16, error: io::Error) -> TunnelError {
    match error.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => {
            TunnelError::NetworkStreamClosed(format!("{}:{}: {}", host, port, error))
        }
        io::ErrorKind::PermissionDenied => {
            TunnelError::RelayAccessDenied(format!("{}:{}: {}", host, port, error))
        }
        _ => TunnelError::Io(error),
    }
}
