//! End-to-end UDP forwarding and idle-session eviction.

mod common;

use fireproxy::server::ProxyServer;
use fireproxy::stats::{Forwarder, StatsSnapshot};
use std::time::Duration;
use tokio::net::UdpSocket;

#[tokio::test]
async fn forwards_udp_datagrams_round_trip() {
    let upstream_port = common::free_tcp_port().await; // just a free port number
    common::spawn_udp_echo_server(upstream_port).await;

    let local_port = common::free_tcp_port().await;

    let dir = tempfile::tempdir().unwrap();
    let rules_path = dir.path().join("rules.json");
    std::fs::write(
        &rules_path,
        serde_json::json!({
            "forward": [{
                "id": 1,
                "name": "udp-echo",
                "status": "active",
                "type": "udp",
                "localHost": "127.0.0.1",
                "targetHost": "127.0.0.1",
                "localPort": local_port,
                "targetPort": upstream_port
            }]
        })
        .to_string(),
    )
    .unwrap();

    let server = ProxyServer::start(&rules_path).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client
        .send_to(b"udp-payload", ("127.0.0.1", local_port))
        .await
        .unwrap();

    let mut buf = [0u8; 1024];
    let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("timed out waiting for udp echo")
        .unwrap();
    assert_eq!(&buf[..len], b"udp-payload");

    let snapshots = server.registry().snapshot_all();
    assert_eq!(snapshots.len(), 1);
    match &snapshots[0].1 {
        StatsSnapshot::Udp(stats) => assert!(stats.messages_forwarded >= 2),
        _ => panic!("expected udp snapshot"),
    }

    server.shutdown();
}

#[tokio::test]
async fn evicts_idle_udp_session_after_client_timeout() {
    use fireproxy::server::udp::{UdpConfig, UdpForwarder};

    let upstream_port = common::free_tcp_port().await;
    common::spawn_udp_echo_server(upstream_port).await;

    let config = UdpConfig {
        client_timeout: Duration::from_millis(300),
        cleanup_interval: Duration::from_millis(100),
        ..Default::default()
    };

    let forwarder = UdpForwarder::bind(
        "udp_idle_test",
        "127.0.0.1",
        0,
        "127.0.0.1".to_string(),
        upstream_port,
        config,
    )
    .await
    .unwrap();
    let local_addr = forwarder.local_addr().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ping", local_addr).await.unwrap();
    let mut buf = [0u8; 16];
    let _ = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
        .await
        .unwrap();

    match forwarder.snapshot() {
        StatsSnapshot::Udp(stats) => assert_eq!(stats.active_clients, 1),
        _ => panic!("expected udp snapshot"),
    }

    tokio::time::sleep(Duration::from_millis(600)).await;

    match forwarder.snapshot() {
        StatsSnapshot::Udp(stats) => assert_eq!(stats.active_clients, 0),
        _ => panic!("expected udp snapshot"),
    }

    forwarder.stop();
}
