//! TCP accept loop and pooled splice (component C2): accepts client
//! connections, acquires a pooled upstream, and copies bytes bidirectionally
//! until either side closes.

use crate::server::pool::ConnectionPool;
use crate::stats::{Forwarder, StatsSnapshot, TcpStats};
use crate::utils::error::{ProxyError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{self, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Default)]
struct TcpMetrics {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    errors: AtomicU64,
}

/// Accepts client connections on one local port and splices each to a
/// pooled upstream connection.
pub struct TcpForwarder {
    proxy_id: String,
    local_addr: SocketAddr,
    pool: Arc<ConnectionPool>,
    cancellation: CancellationToken,
    metrics: TcpMetrics,
}

impl TcpForwarder {
    pub async fn bind(
        proxy_id: impl Into<String>,
        local_host: &str,
        local_port: u16,
        pool: Arc<ConnectionPool>,
    ) -> Result<Arc<Self>> {
        let bind_addr: SocketAddr = format!("{}:{}", local_host, local_port)
            .parse()
            .map_err(|_| {
                ProxyError::Config(format!("invalid local bind address {}:{}", local_host, local_port))
            })?;

        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| ProxyError::Bind {
                addr: bind_addr,
                source: e,
            })?;

        let forwarder = Arc::new(Self {
            proxy_id: proxy_id.into(),
            local_addr: bind_addr,
            pool,
            cancellation: CancellationToken::new(),
            metrics: TcpMetrics::default(),
        });

        tokio::spawn(Arc::clone(&forwarder).accept_loop(listener));

        Ok(forwarder)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        info!(proxy_id = %self.proxy_id, addr = %self.local_addr, "tcp forwarder listening");
        loop {
            tokio::select! {
                _ = self.cancellation.cancelled() => {
                    info!(proxy_id = %self.proxy_id, "tcp forwarder shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, client_addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!(proxy_id = %self.proxy_id, error = %e, "failed to set TCP_NODELAY on client socket");
                            }
                            let this = Arc::clone(&self);
                            tokio::spawn(async move {
                                this.metrics.total_connections.fetch_add(1, Ordering::Relaxed);
                                this.metrics.active_connections.fetch_add(1, Ordering::Relaxed);
                                if let Err(e) = this.serve_client(stream, client_addr).await {
                                    this.metrics.errors.fetch_add(1, Ordering::Relaxed);
                                    debug!(proxy_id = %this.proxy_id, client = %client_addr, error = %e, "client session ended with error");
                                }
                                this.metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                            warn!(proxy_id = %self.proxy_id, error = %e, "accept failed");
                        }
                    }
                }
            }
        }
    }

    async fn serve_client(&self, client_stream: tokio::net::TcpStream, client_addr: SocketAddr) -> Result<()> {
        let (upstream, meta) = match self.pool.acquire().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(proxy_id = %self.proxy_id, client = %client_addr, error = %e, "no upstream connection available");
                return Err(e);
            }
        };

        let (mut client_read, client_write) = client_stream.into_split();
        let (upstream_read, mut upstream_write) = upstream.into_split();

        let mut client_write_for_download = client_write;
        let mut upstream_read_for_download = upstream_read;

        // Child of the forwarder's own token: finishing one direction (or a
        // forwarder-wide shutdown) cancels the other so neither half can
        // block forever on a half-open peer.
        let splice_cancel = self.cancellation.child_token();
        let upload_cancel = splice_cancel.clone();
        let download_cancel = splice_cancel.clone();

        let upload = tokio::spawn(async move {
            let result = tokio::select! {
                _ = upload_cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Other, "splice cancelled")),
                r = io::copy(&mut client_read, &mut upstream_write) => r,
            };
            let _ = upstream_write.shutdown().await;
            upload_cancel.cancel();
            (upstream_write, result)
        });
        let download = tokio::spawn(async move {
            let result = tokio::select! {
                _ = download_cancel.cancelled() => Err(io::Error::new(io::ErrorKind::Other, "splice cancelled")),
                r = io::copy(&mut upstream_read_for_download, &mut client_write_for_download) => r,
            };
            let _ = client_write_for_download.shutdown().await;
            download_cancel.cancel();
            (upstream_read_for_download, result)
        });

        let upload_outcome = upload.await;
        let download_outcome = download.await;

        let (upstream_write, upload_result) = match upload_outcome {
            Ok(pair) => pair,
            Err(_) => {
                self.pool.destroy(meta).await;
                return Err(ProxyError::Socket {
                    addr: client_addr.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "upload task panicked"),
                });
            }
        };
        let (upstream_read, download_result) = match download_outcome {
            Ok(pair) => pair,
            Err(_) => {
                self.pool.destroy(meta).await;
                return Err(ProxyError::Socket {
                    addr: client_addr.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::Other, "download task panicked"),
                });
            }
        };

        let clean = upload_result.is_ok() && download_result.is_ok();

        match upstream_read.reunite(upstream_write) {
            Ok(stream) if clean => {
                self.pool.release(stream, meta).await;
            }
            _ => {
                self.pool.destroy(meta).await;
            }
        }

        if !clean {
            return Err(ProxyError::Socket {
                addr: client_addr.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "splice ended with error"),
            });
        }

        Ok(())
    }
}

impl Forwarder for TcpForwarder {
    fn snapshot(&self) -> StatsSnapshot {
        let pool_stats = self.pool.stats_sync();
        StatsSnapshot::Tcp(TcpStats {
            total_connections: self.metrics.total_connections.load(Ordering::Relaxed),
            active_connections: self.metrics.active_connections.load(Ordering::Relaxed),
            errors: self.metrics.errors.load(Ordering::Relaxed),
            reconnects: pool_stats.reconnects,
            pool_size: pool_stats.total,
            idle_connections: pool_stats.idle,
            waiting_queue_size: pool_stats.waiting,
            pool_scales: pool_stats.pool_scales,
        })
    }

    fn stop(&self) {
        // Cancels the accept loop and, via child tokens, every in-flight
        // splice. The pool itself is stopped separately: `ConnectionPool::stop`
        // is idempotent, so forwarders sharing a pool (same target port
        // within a rule) can each call this without racing each other.
        self.cancellation.cancel();
        let pool = Arc::clone(&self.pool);
        tokio::spawn(async move {
            pool.stop().await;
        });
    }
}
