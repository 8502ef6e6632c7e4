//! Tunnels: a loopback listener bound to one relay target
//!
//! A tunnel is live while its relay loop runs. `dispose` is the single
//! teardown path: it cancels the loop, releases the listening socket and
//! notifies close handlers, exactly once no matter how often or from where it
//! is called (`close`, `Drop`, relay fault).

mod factory;
mod listener;

pub use factory::{RelayTunnelFactory, TunnelFactory};
pub use listener::{ListenerBinder, RelayListener, TcpBinder, DEFAULT_BUFFER_SIZE};

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use iap_core::{InstanceLocator, NetworkStatistics, Protocol, TransportPolicy, TunnelProfile};

/// Unique identifier for a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelId(Uuid);

impl TunnelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TunnelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Behavioral toggles for a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelFlags {
    /// Bind on loopback and accept loopback clients only.
    ///
    /// When cleared, tunnels without a preferred endpoint bind on all
    /// interfaces and client admission is left to
    /// `TransportPolicy::is_client_allowed`, which still defaults to
    /// loopback peers.
    pub loopback_only: bool,
}

impl Default for TunnelFlags {
    fn default() -> Self {
        Self {
            loopback_only: true,
        }
    }
}

type CloseHandler = Box<dyn FnOnce(&Tunnel) + Send>;

/// An established relay session exposing a local endpoint
pub struct Tunnel {
    id: TunnelId,
    profile: TunnelProfile,
    flags: TunnelFlags,
    listener: Arc<RelayListener>,
    cancel: CancellationToken,
    closed: AtomicBool,
    close_handlers: Mutex<Vec<CloseHandler>>,
    /// Cancelled once the relay task has finished
    stopped: CancellationToken,
}

impl Tunnel {
    /// Start relaying on `listener`. Must be called within a tokio runtime.
    pub fn start(listener: RelayListener, profile: TunnelProfile, flags: TunnelFlags) -> Arc<Self> {
        let tunnel = Arc::new(Self {
            id: TunnelId::new(),
            profile,
            flags,
            listener: Arc::new(listener),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            close_handlers: Mutex::new(Vec::new()),
            stopped: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&tunnel);
        let listener = Arc::clone(&tunnel.listener);
        let cancel = tunnel.cancel.clone();
        let stopped = tunnel.stopped.clone();
        let id = tunnel.id;

        tokio::spawn(async move {
            let _stopped = stopped.drop_guard();

            if let Err(e) = listener.listen(cancel).await {
                tracing::error!("Relay loop of tunnel {} failed: {}", id, e);
            }

            // The loop also ends on listener faults; converge on dispose.
            if let Some(tunnel) = weak.upgrade() {
                tunnel.dispose();
            }
        });

        tracing::info!(
            "Opened tunnel {} on {} for {}",
            tunnel.id,
            tunnel.local_endpoint(),
            tunnel.profile
        );
        tunnel
    }

    pub fn id(&self) -> TunnelId {
        self.id
    }

    /// Profile this tunnel was created for
    pub fn profile(&self) -> &TunnelProfile {
        &self.profile
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        self.profile.protocol()
    }

    pub fn policy(&self) -> &Arc<dyn TransportPolicy> {
        self.profile.policy()
    }

    pub fn target_instance(&self) -> &InstanceLocator {
        self.profile.target_instance()
    }

    pub fn target_port(&self) -> u16 {
        self.profile.target_port()
    }

    pub fn flags(&self) -> TunnelFlags {
        self.flags
    }

    /// Loopback endpoint clients connect to
    pub fn local_endpoint(&self) -> SocketAddr {
        self.listener.local_endpoint()
    }

    /// Live byte counters
    pub fn statistics(&self) -> &NetworkStatistics {
        self.listener.statistics()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register a handler that runs once when the tunnel closes.
    ///
    /// If the tunnel is already closed the handler runs immediately.
    pub fn on_closed(&self, handler: impl FnOnce(&Tunnel) + Send + 'static) {
        {
            let mut handlers = lock(&self.close_handlers);
            if !self.is_closed() {
                handlers.push(Box::new(handler));
                return;
            }
        }
        handler(self);
    }

    /// Stop relaying and wait for the relay loop to finish
    pub async fn close(&self) {
        self.dispose();
        self.stopped.cancelled().await;
    }

    /// Stop relaying without waiting. Idempotent.
    pub fn dispose(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.cancel.cancel();
        self.listener.shutdown();
        tracing::info!("Closed tunnel {} for {}", self.id, self.profile);

        let handlers = std::mem::take(&mut *lock(&self.close_handlers));
        for handler in handlers {
            handler(self);
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("profile", &self.profile)
            .field("local_endpoint", &self.local_endpoint())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
