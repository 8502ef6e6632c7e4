//! Tunnel lifecycle and relay tests

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use iap_core::{InstanceLocator, NetworkStatistics, TransportPolicy, TunnelError};
use iap_transport::{ListenerBinder, RelayListener, TcpBinder, Tunnel, TunnelFlags};

use common::{sample_instance, sample_profile, start_tunnel, wait_until, Remote, ScriptedTarget};

#[tokio::test]
async fn test_statistics_are_delegated_to_listener() {
    let stats = Arc::new(NetworkStatistics::new());
    stats.on_receive_completed(1);
    stats.on_transmit_completed(3);

    let profile = sample_profile(22);
    let socket = TcpBinder.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = RelayListener::new(
        socket,
        ScriptedTarget::new(Remote::Echo),
        Arc::clone(profile.policy()),
        TunnelFlags::default(),
    )
    .unwrap()
    .with_statistics(stats);

    let tunnel = Tunnel::start(listener, profile, TunnelFlags::default());
    assert_eq!(tunnel.statistics().bytes_received(), 1);
    assert_eq!(tunnel.statistics().bytes_transmitted(), 3);
}

#[tokio::test]
async fn test_tunnel_exposes_profile_details() {
    let profile = sample_profile(22);
    let tunnel = start_tunnel(&profile, ScriptedTarget::new(Remote::Echo));

    assert!(tunnel.local_endpoint().ip().is_loopback());
    assert_ne!(tunnel.local_endpoint().port(), 0);
    assert_eq!(tunnel.target_instance(), &sample_instance());
    assert_eq!(tunnel.target_port(), 22);
    assert_eq!(tunnel.protocol().id(), "rdp");
    assert_eq!(tunnel.policy().id(), "allow-all");
    assert_eq!(tunnel.profile().key(), profile.key());
    assert!(tunnel.flags().loopback_only);
    assert!(!tunnel.is_closed());
}

#[tokio::test]
async fn test_relay_counts_bytes_in_both_directions() {
    let target = ScriptedTarget::new(Remote::Reply {
        expect: 3,
        reply: b"!".to_vec(),
    });
    let tunnel = start_tunnel(&sample_profile(3389), target.clone());

    let mut client = TcpStream::connect(tunnel.local_endpoint()).await.unwrap();
    client.write_all(b"abc").await.unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"!");

    assert!(
        wait_until(|| {
            tunnel.statistics().bytes_received() == 1
                && tunnel.statistics().bytes_transmitted() == 3
        })
        .await
    );
    assert_eq!(target.connects(), 1);
}

#[tokio::test]
async fn test_each_client_gets_its_own_relay() {
    let target = ScriptedTarget::new(Remote::Echo);
    let tunnel = start_tunnel(&sample_profile(22), target.clone());

    for message in [&b"first"[..], &b"second"[..]] {
        let mut client = TcpStream::connect(tunnel.local_endpoint()).await.unwrap();
        client.write_all(message).await.unwrap();

        let mut echoed = vec![0u8; message.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, message);
    }

    assert_eq!(target.connects(), 2);
}

#[tokio::test]
async fn test_dispose_releases_listener() {
    let tunnel = start_tunnel(&sample_profile(22), ScriptedTarget::new(Remote::Echo));
    let endpoint = tunnel.local_endpoint();

    tunnel.dispose();

    assert!(tunnel.is_closed());
    assert!(TcpStream::connect(endpoint).await.is_err());
}

#[tokio::test]
async fn test_close_waits_for_relay_loop() {
    let tunnel = start_tunnel(&sample_profile(22), ScriptedTarget::new(Remote::Echo));

    tokio::time::timeout(Duration::from_secs(5), tunnel.close())
        .await
        .expect("relay loop did not stop");
    assert!(tunnel.is_closed());

    // Closing again completes immediately.
    tokio::time::timeout(Duration::from_secs(5), tunnel.close())
        .await
        .expect("second close hung");
}

#[tokio::test]
async fn test_closed_handlers_run_exactly_once() {
    let tunnel = start_tunnel(&sample_profile(22), ScriptedTarget::new(Remote::Echo));

    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);
    tunnel.on_closed(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    tunnel.dispose();
    tunnel.dispose();
    tunnel.close().await;
    drop(tunnel);

    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_handler_registered_after_close_runs_immediately() {
    let tunnel = start_tunnel(&sample_profile(22), ScriptedTarget::new(Remote::Echo));
    tunnel.close().await;

    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);
    tunnel.on_closed(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dropping_last_reference_closes_tunnel() {
    let tunnel = start_tunnel(&sample_profile(22), ScriptedTarget::new(Remote::Echo));
    let endpoint = tunnel.local_endpoint();

    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);
    tunnel.on_closed(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    drop(tunnel);

    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(TcpStream::connect(endpoint).await.is_err());
}

#[derive(Debug)]
struct DenyClientsPolicy;

impl TransportPolicy for DenyClientsPolicy {
    fn id(&self) -> &str {
        "deny-clients"
    }

    fn is_permitted(&self, _target: &InstanceLocator, _port: u16) -> bool {
        true
    }

    fn is_client_allowed(&self, _peer: std::net::SocketAddr) -> bool {
        false
    }
}

#[tokio::test]
async fn test_clients_rejected_by_policy_are_dropped() {
    let target = ScriptedTarget::new(Remote::Echo);
    let profile = iap_core::TunnelProfile::new(
        Arc::new(iap_core::Rdp),
        Arc::new(DenyClientsPolicy),
        sample_instance(),
        3389,
        None,
    )
    .unwrap();
    let tunnel = start_tunnel(&profile, target.clone());

    let mut client = TcpStream::connect(tunnel.local_endpoint()).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("rejected client was not dropped");
    assert!(matches!(read, Ok(0)) || read.is_err());

    assert_eq!(target.connects(), 0);
    assert!(!tunnel.is_closed());
}

#[tokio::test]
async fn test_relay_failure_drops_client_but_keeps_tunnel() {
    let target = ScriptedTarget::new(Remote::Deny(|| {
        TunnelError::NetworkStreamClosed("mock".into())
    }));
    let tunnel = start_tunnel(&sample_profile(22), target.clone());

    let mut client = TcpStream::connect(tunnel.local_endpoint()).await.unwrap();
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
        .await
        .expect("client was not dropped");
    assert!(matches!(read, Ok(0)) || read.is_err());

    assert_eq!(target.connects(), 1);
    assert!(!tunnel.is_closed());
}

#[tokio::test]
async fn test_client_reset_closes_relay_stream() {
    let (streams, mut relayed) = mpsc::unbounded_channel();
    let tunnel = start_tunnel(&sample_profile(22), ScriptedTarget::new(Remote::Forward(streams)));

    let client = TcpStream::connect(tunnel.local_endpoint()).await.unwrap();
    let mut remote = tokio::time::timeout(Duration::from_secs(2), relayed.recv())
        .await
        .unwrap()
        .unwrap();

    client.set_linger(Some(Duration::ZERO)).unwrap();
    drop(client);

    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(2), remote.read_to_end(&mut buf)).await;
    assert!(matches!(read, Ok(Ok(0))));
    assert!(!tunnel.is_closed());
}
