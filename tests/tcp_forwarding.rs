//! End-to-end TCP forwarding: a single-port rule and a parallel-offset
//! port range rule, both driven through a real rules.json and a running
//! `ProxyServer`.

mod common;

use fireproxy::server::ProxyServer;
use std::time::Duration;

#[tokio::test]
async fn forwards_single_port_rule_end_to_end() {
    let upstream_port = common::free_tcp_port().await;
    common::spawn_tcp_echo_server(upstream_port).await;

    let local_port = common::free_tcp_port().await;

    let dir = tempfile::tempdir().unwrap();
    let rules_path = dir.path().join("rules.json");
    std::fs::write(
        &rules_path,
        serde_json::json!({
            "forward": [{
                "id": 1,
                "name": "single-port",
                "status": "active",
                "type": "tcp",
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
    assert_eq!(server.rule_count(), 1);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let echoed = common::echo_roundtrip(local_port, b"hello fireproxy").await;
    assert_eq!(echoed, b"hello fireproxy");

    server.shutdown();
}

#[tokio::test]
async fn forwards_parallel_port_range_rule() {
    let target_ports = common::free_consecutive_ports(3).await;
    for &port in &target_ports {
        common::spawn_tcp_echo_server(port).await;
    }
    let local_ports = common::free_consecutive_ports(3).await;

    let dir = tempfile::tempdir().unwrap();
    let rules_path = dir.path().join("rules.json");
    std::fs::write(
        &rules_path,
        serde_json::json!({
            "forward": [{
                "id": 2,
                "name": "range",
                "status": "active",
                "type": "tcp",
                "localHost": "127.0.0.1",
                "targetHost": "127.0.0.1",
                "localPortRange": [local_ports[0], local_ports[2]],
                "targetPortRange": [target_ports[0], target_ports[2]]
            }]
        })
        .to_string(),
    )
    .unwrap();

    let server = ProxyServer::start(&rules_path).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    for (i, &local_port) in local_ports.iter().enumerate() {
        let payload = format!("range-leg-{}", i);
        let echoed = common::echo_roundtrip(local_port, payload.as_bytes()).await;
        assert_eq!(echoed, payload.as_bytes());
    }

    server.shutdown();
}
