//! Loopback listener and relay loop
//!
//! The listener accepts local clients and pumps bytes between each client and
//! a fresh relay stream to the remote target. The underlying socket lives in
//! a slot so that shutdown releases the port synchronously, even while the
//! accept loop is parked.

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::task::Poll;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;

use iap_core::{NetworkStatistics, TransportPolicy, TunnelError};

use super::{lock, TunnelFlags};
use crate::relay::RelayTarget;

/// Backlog for the loopback listener
const LISTEN_BACKLOG: u32 = 32;

/// Default pump buffer size per direction
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Opens the local listening socket for a tunnel
pub trait ListenerBinder: Send + Sync {
    /// Bind and listen on `endpoint`.
    ///
    /// A port conflict must be reported as `TunnelError::PortAccessDenied`.
    fn bind(&self, endpoint: SocketAddr) -> Result<TcpListener, TunnelError>;
}

/// Binds real TCP sockets without address reuse, so conflicts surface
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpBinder;

impl ListenerBinder for TcpBinder {
    fn bind(&self, endpoint: SocketAddr) -> Result<TcpListener, TunnelError> {
        let socket = if endpoint.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        socket
            .bind(endpoint)
            .map_err(|e| TunnelError::from_bind(endpoint, e))?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| TunnelError::from_bind(endpoint, e))
    }
}

/// Accepts local clients and relays them to a remote target
pub struct RelayListener {
    socket: Mutex<Option<TcpListener>>,
    local_endpoint: SocketAddr,
    target: Arc<dyn RelayTarget>,
    policy: Arc<dyn TransportPolicy>,
    statistics: Arc<NetworkStatistics>,
    flags: TunnelFlags,
    buffer_size: usize,
}

impl RelayListener {
    /// Wrap a bound listener
    pub fn new(
        socket: TcpListener,
        target: Arc<dyn RelayTarget>,
        policy: Arc<dyn TransportPolicy>,
        flags: TunnelFlags,
    ) -> io::Result<Self> {
        let local_endpoint = socket.local_addr()?;
        Ok(Self {
            socket: Mutex::new(Some(socket)),
            local_endpoint,
            target,
            policy,
            statistics: Arc::new(NetworkStatistics::new()),
            flags,
            buffer_size: DEFAULT_BUFFER_SIZE,
        })
    }

    /// Use `size` bytes per pump direction
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Share an existing statistics instance
    pub fn with_statistics(mut self, statistics: Arc<NetworkStatistics>) -> Self {
        self.statistics = statistics;
        self
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.local_endpoint
    }

    pub fn statistics(&self) -> &Arc<NetworkStatistics> {
        &self.statistics
    }

    /// Release the listening socket. Returns false if already released.
    pub(crate) fn shutdown(&self) -> bool {
        lock(&self.socket).take().is_some()
    }

    fn is_client_allowed(&self, peer: SocketAddr) -> bool {
        if self.flags.loopback_only && !peer.ip().is_loopback() {
            return false;
        }
        self.policy.is_client_allowed(peer)
    }

    /// Next client, or `None` once the socket has been released
    async fn accept(&self) -> Option<io::Result<(TcpStream, SocketAddr)>> {
        poll_fn(|cx| match lock(&self.socket).as_ref() {
            Some(socket) => socket.poll_accept(cx).map(Some),
            None => Poll::Ready(None),
        })
        .await
    }

    /// Run the accept loop until cancelled or the socket is released
    pub async fn listen(self: Arc<Self>, cancel: CancellationToken) -> Result<(), TunnelError> {
        tracing::debug!(
            "Listening on {} for {}:{}",
            self.local_endpoint,
            self.target.instance(),
            self.target.port()
        );

        loop {
            let accepted = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = self.accept() => accepted,
            };

            let (client, peer) = match accepted {
                None => break,
                Some(Ok(accepted)) => accepted,
                Some(Err(e)) if is_transient(&e) => {
                    tracing::debug!("Transient accept error on {}: {}", self.local_endpoint, e);
                    continue;
                }
                Some(Err(e)) => {
                    tracing::error!("Listener on {} failed: {}", self.local_endpoint, e);
                    return Err(e.into());
                }
            };

            if cancel.is_cancelled() {
                break;
            }

            if !self.is_client_allowed(peer) {
                tracing::warn!(
                    "Rejecting client {} on {}: not permitted by policy {}",
                    peer,
                    self.local_endpoint,
                    self.policy.id()
                );
                continue;
            }

            let relay = Arc::clone(&self);
            let token = cancel.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!("Relay for {} cancelled", peer);
                    }
                    result = relay.relay_client(client, peer) => {
                        if let Err(e) = result {
                            tracing::warn!("Relay for {} ended with error: {}", peer, e);
                        }
                    }
                }
            });
        }

        tracing::debug!("Stopped listening on {}", self.local_endpoint);
        Ok(())
    }

    async fn relay_client(&self, client: TcpStream, peer: SocketAddr) -> Result<(), TunnelError> {
        client.set_nodelay(true)?;
        let remote = self.target.connect().await?;
        tracing::debug!(
            "Relaying {} -> {}:{}",
            peer,
            self.target.instance(),
            self.target.port()
        );

        let (client_read, client_write) = client.into_split();
        let (remote_read, remote_write) = tokio::io::split(remote);

        let statistics = &self.statistics;
        let upstream = pump(client_read, remote_write, self.buffer_size, |n| {
            statistics.on_transmit_completed(n)
        });
        let downstream = pump(remote_read, client_write, self.buffer_size, |n| {
            statistics.on_receive_completed(n)
        });

        // A fault in either direction drops both halves, closing the relay stream.
        let (sent, received) = tokio::try_join!(upstream, downstream)?;
        tracing::debug!(
            "Relay for {} finished ({} bytes sent, {} bytes received)",
            peer,
            sent,
            received
        );
        Ok(())
    }
}

/// Copy `reader` into `writer` until EOF, then shut down `writer`
async fn pump<R, W, F>(mut reader: R, mut writer: W, buffer_size: usize, on_chunk: F) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = BytesMut::with_capacity(buffer_size);
    let mut total = 0u64;

    loop {
        buf.clear();
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(total);
        }

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;

        let n = n as u64;
        total += n;
        on_chunk(n);
        tracing::trace!("Relayed {} bytes", n);
    }
}

fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
