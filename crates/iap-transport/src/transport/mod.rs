//! Transports: caller-facing handles to pooled tunnels

mod factory;

pub use factory::TransportFactory;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use iap_core::{InstanceLocator, Protocol};

use crate::tunnel::Tunnel;

/// One logical use of a (possibly shared) tunnel.
///
/// Disposing a transport closes its tunnel, including for any other
/// transport sharing it.
pub struct Transport {
    tunnel: Arc<Tunnel>,
    protocol: Arc<dyn Protocol>,
    target: InstanceLocator,
    disposed: AtomicBool,
}

impl Transport {
    pub fn new(tunnel: Arc<Tunnel>, protocol: Arc<dyn Protocol>, target: InstanceLocator) -> Self {
        Self {
            tunnel,
            protocol,
            target,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    /// Instance that requested this transport
    pub fn target(&self) -> &InstanceLocator {
        &self.target
    }

    /// Local endpoint to point the RDP/SSH client at
    pub fn endpoint(&self) -> SocketAddr {
        self.tunnel.local_endpoint()
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    /// Close the underlying tunnel. Idempotent.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.tunnel.dispose();
        }
    }

    /// Close the underlying tunnel and wait for its relay loop to stop
    pub async fn close(self) {
        self.disposed.store(true, Ordering::Release);
        self.tunnel.close().await;
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("protocol", &self.protocol.id())
            .field("target", &self.target)
            .field("endpoint", &self.endpoint())
            .field("tunnel", &self.tunnel.id())
            .finish()
    }
}
