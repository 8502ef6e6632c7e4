//! Relay targets
//!
//! A relay target is the authenticated remote side of a tunnel. Every local
//! client accepted by a tunnel gets its own relay stream from the target.

mod direct;

pub use direct::{DirectRelayClient, DirectRelayTarget};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use iap_core::{InstanceLocator, TunnelError};

/// Byte stream to the remote target
pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RelayStream for T {}

/// Boxed relay stream
pub type BoxRelayStream = Box<dyn RelayStream>;

/// Remote endpoint a tunnel relays to
#[async_trait]
pub trait RelayTarget: Send + Sync {
    /// Instance this target relays to
    fn instance(&self) -> &InstanceLocator;

    /// Port on the instance
    fn port(&self) -> u16;

    /// Open a new relay stream
    async fn connect(&self) -> Result<BoxRelayStream, TunnelError>;

    /// Open and immediately drop one relay stream
    async fn probe(&self, timeout: Duration) -> Result<(), TunnelError> {
        match tokio::time::timeout(timeout, self.connect()).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TunnelError::Timeout(timeout)),
        }
    }
}

/// Produces relay targets, supplying whatever credentials they need
pub trait RelayClient: Send + Sync {
    fn relay_target(
        &self,
        instance: &InstanceLocator,
        port: u16,
    ) -> Result<Arc<dyn RelayTarget>, TunnelError>;
}
