//! Raw UDP forwarder with NAT-style client sessions (component C3). Each
//! client address gets its own ephemeral upstream socket; packets are
//! forwarded byte-for-byte in both directions with no framing of any kind.

use crate::stats::{Forwarder, StatsSnapshot, UdpStats};
use crate::utils::error::{ProxyError, Result};
use dashmap::DashMap;
use socket2::SockRef;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy)]
pub struct UdpConfig {
    pub client_timeout: Duration,
    pub buffer_hint: usize,
    pub cleanup_interval: Duration,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            client_timeout: Duration::from_secs(300),
            buffer_hint: 64 * 1024,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

const DATAGRAM_BUF: usize = 65535;

struct ClientSession {
    upstream: UdpSocket,
    last_active: StdMutex<Instant>,
    cancellation: CancellationToken,
}

#[derive(Default)]
struct UdpMetrics {
    messages_forwarded: AtomicU64,
    client_connections: AtomicU64,
    errors: AtomicU64,
}

/// Forwards UDP datagrams between a bound local socket and one upstream
/// target, keyed per-client the way a NAT table would be.
pub struct UdpForwarder {
    proxy_id: String,
    target_host: String,
    target_port: u16,
    config: UdpConfig,
    socket: Arc<UdpSocket>,
    sessions: DashMap<SocketAddr, Arc<ClientSession>>,
    cancellation: CancellationToken,
    metrics: UdpMetrics,
}

impl UdpForwarder {
    pub async fn bind(
        proxy_id: impl Into<String>,
        local_host: &str,
        local_port: u16,
        target_host: impl Into<String>,
        target_port: u16,
        config: UdpConfig,
    ) -> Result<Arc<Self>> {
        let bind_addr: SocketAddr = format!("{}:{}", local_host, local_port)
            .parse()
            .map_err(|_| {
                ProxyError::Config(format!("invalid local bind address {}:{}", local_host, local_port))
            })?;

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: bind_addr,
                source: e,
            })?;

        let forwarder = Arc::new(Self {
            proxy_id: proxy_id.into(),
            target_host: target_host.into(),
            target_port,
            config,
            socket: Arc::new(socket),
            sessions: DashMap::new(),
            cancellation: CancellationToken::new(),
            metrics: UdpMetrics::default(),
        });

        tokio::spawn(Arc::clone(&forwarder).run());
        tokio::spawn(Arc::clone(&forwarder).run_cleanup());

        Ok(forwarder)
    }

    fn target_label(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; DATAGRAM_BUF];
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, client_addr)) => {
                            self.clone().handle_client_packet(client_addr, buf[..len].to_vec()).await;
                        }
                        Err(e) => {
                            self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                            warn!(proxy_id = %self.proxy_id, error = %e, "udp recv error");
                        }
                    }
                }
            }
        }
    }

    async fn handle_client_packet(self: Arc<Self>, client_addr: SocketAddr, data: Vec<u8>) {
        let session = match self.sessions.get(&client_addr).map(|e| e.value().clone()) {
            Some(session) => session,
            None => match self.clone().create_session(client_addr).await {
                Ok(session) => session,
                Err(e) => {
                    self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(proxy_id = %self.proxy_id, client = %client_addr, error = %e, "failed to open upstream session");
                    return;
                }
            },
        };

        *session.last_active.lock().unwrap() = Instant::now();

        match session.upstream.send(&data).await {
            Ok(_) => {
                self.metrics.messages_forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                let err = ProxyError::UdpSend { addr: client_addr, source: e };
                warn!(proxy_id = %self.proxy_id, client = %client_addr, error = %err, "udp send to upstream failed");
            }
        }
    }

    async fn create_session(self: Arc<Self>, client_addr: SocketAddr) -> Result<Arc<ClientSession>> {
        let target_addr = tokio::net::lookup_host((self.target_host.as_str(), self.target_port))
            .await
            .map_err(|e| ProxyError::Dial {
                addr: self.target_label(),
                source: e,
            })?
            .next()
            .ok_or_else(|| {
                ProxyError::Config(format!("no address resolved for {}", self.target_label()))
            })?;

        // Family is chosen from the target host itself (IPv6 iff it's an
        // IPv6 literal), not from whatever order the resolver returns —
        // a hostname always binds IPv4 regardless of which record wins.
        let bind_any = if self.target_host.parse::<std::net::Ipv6Addr>().is_ok() {
            "[::]:0"
        } else {
            "0.0.0.0:0"
        };
        let upstream = UdpSocket::bind(bind_any).await.map_err(|e| ProxyError::Socket {
            addr: self.target_label(),
            source: e,
        })?;
        upstream.connect(target_addr).await.map_err(|e| ProxyError::Dial {
            addr: self.target_label(),
            source: e,
        })?;
        tune_buffers(&upstream, self.config.buffer_hint);

        let session = Arc::new(ClientSession {
            upstream,
            last_active: StdMutex::new(Instant::now()),
            cancellation: self.cancellation.child_token(),
        });
        self.sessions.insert(client_addr, Arc::clone(&session));
        self.metrics.client_connections.fetch_add(1, Ordering::Relaxed);

        debug!(proxy_id = %self.proxy_id, client = %client_addr, target = %target_addr, "opened udp session");

        tokio::spawn(relay_upstream_to_client(
            Arc::clone(&self),
            client_addr,
            Arc::clone(&session),
        ));

        Ok(session)
    }

    async fn run_cleanup(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => break,
                _ = ticker.tick() => self.evict_idle_sessions(),
            }
        }
    }

    fn evict_idle_sessions(&self) {
        let now = Instant::now();
        let stale: Vec<SocketAddr> = self
            .sessions
            .iter()
            .filter(|entry| {
                now.duration_since(*entry.value().last_active.lock().unwrap()) > self.config.client_timeout
            })
            .map(|entry| *entry.key())
            .collect();

        for client_addr in stale {
            if let Some((_, session)) = self.sessions.remove(&client_addr) {
                session.cancellation.cancel();
                trace!(proxy_id = %self.proxy_id, client = %client_addr, "evicted idle udp session");
            }
        }
    }
}

async fn relay_upstream_to_client(
    forwarder: Arc<UdpForwarder>,
    client_addr: SocketAddr,
    session: Arc<ClientSession>,
) {
    let mut buf = vec![0u8; DATAGRAM_BUF];
    loop {
        tokio::select! {
            _ = session.cancellation.cancelled() => break,
            result = session.upstream.recv(&mut buf) => {
                match result {
                    Ok(len) => {
                        *session.last_active.lock().unwrap() = Instant::now();
                        match forwarder.socket.send_to(&buf[..len], client_addr).await {
                            Ok(_) => {
                                forwarder.metrics.messages_forwarded.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                forwarder.metrics.errors.fetch_add(1, Ordering::Relaxed);
                                let err = ProxyError::UdpSend { addr: client_addr, source: e };
                                warn!(proxy_id = %forwarder.proxy_id, client = %client_addr, error = %err, "udp send to client failed");
                            }
                        }
                    }
                    Err(_) => break,
                }
            }
        }
    }
}

fn tune_buffers(socket: &UdpSocket, hint: usize) {
    let sock_ref = SockRef::from(socket);
    let _ = sock_ref.set_send_buffer_size(hint);
    let _ = sock_ref.set_recv_buffer_size(hint);
}

impl Forwarder for UdpForwarder {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot::Udp(UdpStats {
            messages_forwarded: self.metrics.messages_forwarded.load(Ordering::Relaxed),
            client_connections: self.metrics.client_connections.load(Ordering::Relaxed),
            errors: self.metrics.errors.load(Ordering::Relaxed),
            active_clients: self.sessions.len(),
        })
    }

    fn stop(&self) {
        self.cancellation.cancel();
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket as StdUdpSocket;

    async fn spawn_echo_server() -> SocketAddr {
        let socket = StdUdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                if let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                    let _ = socket.send_to(&buf[..len], peer).await;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn forwards_datagram_round_trip() {
        let echo_addr = spawn_echo_server().await;
        let forwarder = UdpForwarder::bind(
            "udp_test_0",
            "127.0.0.1",
            0,
            echo_addr.ip().to_string(),
            echo_addr.port(),
            UdpConfig::default(),
        )
        .await
        .unwrap();
        let forwarder_addr = forwarder.local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", forwarder_addr).await.unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("timed out waiting for echo")
            .unwrap();
        assert_eq!(&buf[..len], b"hello");

        let snapshot = forwarder.snapshot();
        match snapshot {
            StatsSnapshot::Udp(stats) => {
                assert_eq!(stats.active_clients, 1);
                assert!(stats.messages_forwarded >= 2);
            }
            _ => panic!("expected udp snapshot"),
        }

        forwarder.stop();
    }
}
