//! Shared helpers for integration tests: loopback echo servers and free
//! port discovery.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

pub async fn free_tcp_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Find `count` ports that are simultaneously free and consecutive, by
/// trying random bases until one works. Used for port-range rule tests.
pub async fn free_consecutive_ports(count: u16) -> Vec<u16> {
    for attempt in 0..200u32 {
        let base: u16 = 20000 + ((attempt * 97) % 30000) as u16;
        let mut listeners = Vec::with_capacity(count as usize);
        let mut ok = true;
        for offset in 0..count {
            match TcpListener::bind(("127.0.0.1", base + offset)).await {
                Ok(l) => listeners.push(l),
                Err(_) => {
                    ok = false;
                    break;
                }
            }
        }
        if ok {
            return (0..count).map(|o| base + o).collect();
        }
    }
    panic!("could not find {} consecutive free ports", count);
}

pub async fn spawn_tcp_echo_server(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        loop {
            if let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        }
    });
}

pub async fn spawn_udp_echo_server(port: u16) {
    let socket = UdpSocket::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            if let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..len], peer).await;
            }
        }
    });
}

pub async fn echo_roundtrip(port: u16, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}
