//! Shared helpers for transport integration tests

#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use iap_core::{AllowAllPolicy, InstanceLocator, Rdp, TunnelError, TunnelProfile};
use iap_transport::{
    BoxRelayStream, EventSink, ListenerBinder, RelayClient, RelayListener, RelayTarget, TcpBinder,
    Tunnel, TunnelEvent, TunnelFactory, TunnelFlags, TunnelId,
};

pub const SAMPLE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn sample_instance() -> InstanceLocator {
    InstanceLocator::new("project-1", "zone-1", "instance-1")
}

pub fn sample_profile(port: u16) -> TunnelProfile {
    TunnelProfile::new(
        Arc::new(Rdp),
        Arc::new(AllowAllPolicy),
        sample_instance(),
        port,
        None,
    )
    .unwrap()
}

/// What the remote side of a scripted relay does
#[derive(Debug, Clone)]
pub enum Remote {
    /// Echo everything back
    Echo,
    /// Read `expect` bytes, then answer with `reply` and close
    Reply { expect: usize, reply: Vec<u8> },
    /// Hand the remote end of every relay stream to the test
    Forward(mpsc::UnboundedSender<DuplexStream>),
    /// Fail every connect
    Deny(fn() -> TunnelError),
}

/// Relay target backed by in-memory duplex streams
pub struct ScriptedTarget {
    instance: InstanceLocator,
    port: u16,
    remote: Remote,
    connects: AtomicUsize,
}

impl ScriptedTarget {
    pub fn new(remote: Remote) -> Arc<Self> {
        Arc::new(Self {
            instance: sample_instance(),
            port: 3389,
            remote,
            connects: AtomicUsize::new(0),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayTarget for ScriptedTarget {
    fn instance(&self) -> &InstanceLocator {
        &self.instance
    }

    fn port(&self) -> u16 {
        self.port
    }

    async fn connect(&self) -> Result<BoxRelayStream, TunnelError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let (local, mut remote) = tokio::io::duplex(1024);
        match self.remote.clone() {
            Remote::Echo => {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = tokio::io::split(remote);
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
            Remote::Reply { expect, reply } => {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; expect];
                    if remote.read_exact(&mut buf).await.is_ok() {
                        let _ = remote.write_all(&reply).await;
                        let _ = remote.shutdown().await;
                    }
                });
            }
            Remote::Forward(streams) => {
                let _ = streams.send(remote);
            }
            Remote::Deny(error) => return Err(error()),
        }

        Ok(Box::new(local))
    }
}

/// Relay client that always hands out the same target
pub struct StaticRelayClient(pub Arc<dyn RelayTarget>);

impl RelayClient for StaticRelayClient {
    fn relay_target(
        &self,
        _instance: &InstanceLocator,
        _port: u16,
    ) -> Result<Arc<dyn RelayTarget>, TunnelError> {
        Ok(Arc::clone(&self.0))
    }
}

/// Binder that reports every port as taken and records what was tried
#[derive(Default)]
pub struct DeniedBinder {
    pub probed_ports: Mutex<Vec<u16>>,
    /// Number of attempts to deny before binding for real; `None` denies all
    pub deny_first: Option<usize>,
}

impl ListenerBinder for DeniedBinder {
    fn bind(&self, endpoint: std::net::SocketAddr) -> Result<tokio::net::TcpListener, TunnelError> {
        let attempt = {
            let mut ports = self.probed_ports.lock().unwrap();
            ports.push(endpoint.port());
            ports.len()
        };

        match self.deny_first {
            Some(limit) if attempt > limit => TcpBinder.bind("127.0.0.1:0".parse().unwrap()),
            _ => Err(TunnelError::PortAccessDenied {
                endpoint,
                source: io::Error::new(io::ErrorKind::AddrInUse, "mock"),
            }),
        }
    }
}

/// Start a real tunnel on an ephemeral loopback port
pub fn start_tunnel(profile: &TunnelProfile, target: Arc<dyn RelayTarget>) -> Arc<Tunnel> {
    let socket = TcpBinder.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = RelayListener::new(
        socket,
        target,
        Arc::clone(profile.policy()),
        TunnelFlags::default(),
    )
    .unwrap();
    Tunnel::start(listener, profile.clone(), TunnelFlags::default())
}

/// How a scripted tunnel factory responds
#[derive(Clone, Copy)]
pub enum Outcome {
    Succeed,
    Fail(fn() -> TunnelError),
    Pending,
    /// Succeed once `release` is called, one call per release, in call order
    Gated,
}

/// Tunnel factory with a fixed outcome that counts invocations
pub struct ScriptedTunnelFactory {
    outcome: Outcome,
    calls: AtomicUsize,
    gate: Notify,
}

impl ScriptedTunnelFactory {
    pub fn new(outcome: Outcome) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            calls: AtomicUsize::new(0),
            gate: Notify::new(),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Let the oldest gated call complete
    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl TunnelFactory for ScriptedTunnelFactory {
    async fn create_tunnel(
        &self,
        profile: &TunnelProfile,
        _timeout: Duration,
        _cancel: &CancellationToken,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.outcome {
            Outcome::Succeed => Ok(start_tunnel(profile, ScriptedTarget::new(Remote::Echo))),
            Outcome::Fail(error) => Err(error()),
            Outcome::Pending => std::future::pending().await,
            Outcome::Gated => {
                self.gate.notified().await;
                Ok(start_tunnel(profile, ScriptedTarget::new(Remote::Echo)))
            }
        }
    }
}

/// Which lifecycle event was published
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Created,
    Closed,
}

/// Event sink that records everything published to it
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(Kind, TunnelId)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, kind: Kind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: TunnelEvent) {
        let entry = match &event {
            TunnelEvent::Created(tunnel) => (Kind::Created, tunnel.id()),
            TunnelEvent::Closed(tunnel) => (Kind::Closed, tunnel.id()),
        };
        self.events.lock().unwrap().push(entry);
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
