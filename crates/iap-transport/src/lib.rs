//! iap-transport: Pooled loopback tunnels to cloud instances
//!
//! Callers ask a [`TransportFactory`] for a transport to an instance and
//! port. The factory reuses a healthy pooled [`Tunnel`] when one matches,
//! otherwise it creates one through a [`TunnelFactory`], which binds a
//! loopback listener (retrying on port conflicts) and relays every accepted
//! client through a [`RelayTarget`]. Lifecycle changes are published as
//! [`TunnelEvent`]s.

pub mod events;
pub mod relay;
pub mod transport;
pub mod tunnel;

pub use events::{EventQueue, EventReceiver, EventSink, TunnelEvent};
pub use relay::{BoxRelayStream, DirectRelayClient, RelayClient, RelayStream, RelayTarget};
pub use transport::{Transport, TransportFactory};
pub use tunnel::{
    ListenerBinder, RelayListener, RelayTunnelFactory, TcpBinder, Tunnel, TunnelFactory,
    TunnelFlags, TunnelId,
};
