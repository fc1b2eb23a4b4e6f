//! Dynamic TCP connection pool (component C1).
//!
//! One `ConnectionPool` is created per upstream `(host, port)`; it hides
//! dialing, reuse, scaling, idle eviction, and waiter queuing behind a
//! single `acquire`/`release` API. Prewarming, scale ticks, and a waiter
//! FIFO are always on, not optional.

use crate::utils::error::{ProxyError, Result};
use socket2::SockRef;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub initial_pool_size: usize,
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_up_step: usize,
    pub scale_down_step: usize,
    pub connect_timeout: Duration,
    pub keep_alive_interval: Duration,
    pub idle_timeout: Duration,
    pub scale_interval: Duration,
    pub socket_buffer_hint: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: 5,
            max_pool_size: 50,
            initial_pool_size: 10,
            scale_up_threshold: 0.80,
            scale_down_threshold: 0.30,
            scale_up_step: 3,
            scale_down_step: 1,
            connect_timeout: Duration::from_secs(3),
            keep_alive_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(180),
            scale_interval: Duration::from_secs(5),
            socket_buffer_hint: 128 * 1024,
        }
    }
}

const MONITOR_INTERVAL: Duration = Duration::from_secs(10);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
const WAITER_TIMEOUT: Duration = Duration::from_secs(5);
const WAITER_ORPHAN_AGE: Duration = Duration::from_secs(10);

/// Bookkeeping handed back alongside a leased socket so `release`/`destroy`
/// can restore it to the idle set without re-scanning for identity.
#[derive(Debug, Clone, Copy)]
pub struct ConnMeta {
    created_at: Instant,
    errors: u32,
}

struct IdleConnection {
    stream: TcpStream,
    meta: ConnMeta,
    last_active: Instant,
}

enum WaiterMsg {
    Granted(TcpStream, ConnMeta),
    Unavailable,
}

struct Waiter {
    tx: oneshot::Sender<WaiterMsg>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleConnection>,
    waiters: VecDeque<Waiter>,
}

#[derive(Default)]
struct PoolMetrics {
    total_created: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU64,
    pool_scales: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    pub total_created: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub pool_scales: u64,
}

/// Dynamically scaling pool of warm upstream TCP sockets toward one target.
pub struct ConnectionPool {
    target_host: String,
    target_port: u16,
    config: PoolConfig,
    state: AsyncMutex<PoolState>,
    total: AtomicUsize,
    active: AtomicUsize,
    scaling: AtomicBool,
    last_scale: StdMutex<Instant>,
    stopped: AtomicBool,
    metrics: PoolMetrics,
}

impl ConnectionPool {
    /// Construct the pool and kick off prewarming plus the background
    /// monitor/cleanup loop. Prewarm runs once, from this constructor only.
    pub fn new(target_host: impl Into<String>, target_port: u16, config: PoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            target_host: target_host.into(),
            target_port,
            config,
            state: AsyncMutex::new(PoolState::default()),
            total: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            scaling: AtomicBool::new(false),
            last_scale: StdMutex::new(Instant::now()),
            stopped: AtomicBool::new(false),
            metrics: PoolMetrics::default(),
        });

        let prewarm_pool = Arc::clone(&pool);
        tokio::spawn(async move { prewarm_pool.prewarm().await });

        let housekeeping_pool = Arc::clone(&pool);
        tokio::spawn(async move { housekeeping_pool.run_housekeeping().await });

        pool
    }

    fn target_label(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }

    /// Dial `initial_pool_size` connections in parallel; individual
    /// failures are tolerated.
    async fn prewarm(&self) {
        let want = self.config.initial_pool_size.min(self.config.max_pool_size);
        let mut joins = JoinSet::new();

        for _ in 0..want {
            if !self.reserve_slot() {
                break;
            }
            joins.spawn(self.dial_raw());
        }

        let mut warmed = 0;
        while let Some(result) = joins.join_next().await {
            match result {
                Ok(Ok(stream)) => {
                    self.complete_new_connection(stream).await;
                    warmed += 1;
                }
                Ok(Err(_)) | Err(_) => {
                    self.total.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }

        debug!(
            target = %self.target_label(),
            warmed,
            wanted = want,
            "prewarmed connection pool"
        );
    }

    /// Reserve a slot in `total` if there is room under `max_pool_size`.
    /// Returns `false` (no reservation taken) if the pool is already full.
    fn reserve_slot(&self) -> bool {
        self.total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |t| {
                if t < self.config.max_pool_size {
                    Some(t + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    async fn dial_raw(&self) -> std::io::Result<TcpStream> {
        let addr = (self.target_host.as_str(), self.target_port);
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", self.target_label()),
                )
            })??;

        self.tune_socket(&stream);
        Ok(stream)
    }

    fn tune_socket(&self, stream: &TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(target = %self.target_label(), error = %e, "failed to set TCP_NODELAY");
        }

        let sock_ref = SockRef::from(stream);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(self.config.keep_alive_interval)
            .with_interval(self.config.keep_alive_interval);
        if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
            trace!(target = %self.target_label(), error = %e, "failed to set TCP keepalive");
        }
        if let Err(e) = sock_ref.set_send_buffer_size(self.config.socket_buffer_hint) {
            trace!(target = %self.target_label(), error = %e, "failed to set send buffer hint");
        }
        if let Err(e) = sock_ref.set_recv_buffer_size(self.config.socket_buffer_hint) {
            trace!(target = %self.target_label(), error = %e, "failed to set recv buffer hint");
        }
    }

    /// A freshly dialed connection that nobody is specifically waiting for
    /// (prewarm, scale-up): hand it straight to the oldest waiter if one
    /// exists, otherwise park it idle.
    async fn complete_new_connection(&self, stream: TcpStream) {
        self.metrics.total_created.fetch_add(1, Ordering::Relaxed);
        let meta = ConnMeta {
            created_at: Instant::now(),
            errors: 0,
        };

        let mut state = self.state.lock().await;
        if let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.send(WaiterMsg::Granted(stream, meta)).is_ok() {
                self.active.fetch_add(1, Ordering::Relaxed);
                return;
            }
            // Waiter already gave up before we could hand it off; the
            // socket falls through to the idle set below.
        }

        state.idle.push(IdleConnection {
            stream,
            meta,
            last_active: Instant::now(),
        });
    }

    /// Acquire a ready upstream socket: best idle connection first, then a
    /// direct dial if there's room and nobody is already waiting, otherwise
    /// enqueue on the waiter FIFO with a bounded timeout.
    pub async fn acquire(&self) -> Result<(TcpStream, ConnMeta)> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ProxyError::AcquireTimeout {
                addr: self.target_label(),
            });
        }

        let mut state = self.state.lock().await;

        // Step 1: best idle connection — fewest errors, tie-break newest.
        if let Some(index) = best_idle_index(&state.idle) {
            let conn = state.idle.swap_remove(index);
            drop(state);
            self.active.fetch_add(1, Ordering::Relaxed);
            return Ok((conn.stream, conn.meta));
        }

        // Step 2: dial directly if there's room and nobody is ahead of us
        // in the waiter queue.
        if state.waiters.is_empty()
            && self.total.load(Ordering::SeqCst) < self.config.max_pool_size
            && !self.scaling.load(Ordering::SeqCst)
        {
            drop(state);
            if self.reserve_slot() {
                return self.dial_for_acquirer().await;
            }
            state = self.state.lock().await;
        }

        // Step 3: enqueue as a waiter with a bounded timeout.
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Waiter {
            tx,
            enqueued_at: Instant::now(),
        });
        drop(state);

        match tokio::time::timeout(WAITER_TIMEOUT, rx).await {
            Ok(Ok(WaiterMsg::Granted(stream, meta))) => Ok((stream, meta)),
            Ok(Ok(WaiterMsg::Unavailable)) | Ok(Err(_)) | Err(_) => {
                Err(ProxyError::AcquireTimeout {
                    addr: self.target_label(),
                })
            }
        }
    }

    async fn dial_for_acquirer(&self) -> Result<(TcpStream, ConnMeta)> {
        match self.dial_raw().await {
            Ok(stream) => {
                self.metrics.total_created.fetch_add(1, Ordering::Relaxed);
                self.active.fetch_add(1, Ordering::Relaxed);
                let meta = ConnMeta {
                    created_at: Instant::now(),
                    errors: 0,
                };
                Ok((stream, meta))
            }
            Err(e) => {
                self.total.fetch_sub(1, Ordering::Relaxed);
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                Err(ProxyError::Dial {
                    addr: self.target_label(),
                    source: e,
                })
            }
        }
    }

    fn dec_active(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
    }

    fn dec_total(&self) {
        let _ = self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| Some(v.saturating_sub(1)));
    }

    /// Return a cleanly closed connection to the pool. If a waiter is
    /// queued it is woken immediately with this socket — no idle gap. A
    /// connection released after `stop()` is dropped instead of idled, so
    /// shutdown closes in-use sockets as surely as idle ones.
    pub async fn release(&self, stream: TcpStream, meta: ConnMeta) {
        self.dec_active();

        if self.stopped.load(Ordering::SeqCst) {
            self.dec_total();
            drop(stream);
            return;
        }

        let mut state = self.state.lock().await;
        if let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.send(WaiterMsg::Granted(stream, meta)).is_ok() {
                self.active.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        state.idle.push(IdleConnection {
            stream,
            meta,
            last_active: Instant::now(),
        });
    }

    /// Remove a lent connection from the pool without returning it to the
    /// idle set — used when the upstream side closed or errored while the
    /// socket was lent out.
    pub async fn destroy(&self, _meta: ConnMeta) {
        self.dec_active();
        self.dec_total();
        self.metrics.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn try_scaling_lock(&self) -> bool {
        self.scaling
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release_scaling_lock(&self) {
        self.scaling.store(false, Ordering::SeqCst);
    }

    /// Monitor tick (every 10s): grow or shrink based on the active/total
    /// ratio, gated by `scale_interval` and the scaling lock.
    async fn scale_tick(&self) {
        if !self.try_scaling_lock() {
            return;
        }

        let should_run = {
            let mut last = self.last_scale.lock().unwrap();
            let elapsed = last.elapsed();
            if elapsed >= self.config.scale_interval {
                *last = Instant::now();
                true
            } else {
                false
            }
        };

        if !should_run {
            self.release_scaling_lock();
            return;
        }

        let total = self.total.load(Ordering::SeqCst);
        let active = self.active.load(Ordering::SeqCst);
        let ratio = if total == 0 {
            0.0
        } else {
            active as f64 / total as f64
        };

        if ratio > self.config.scale_up_threshold && total < self.config.max_pool_size {
            let room = self.config.max_pool_size - total;
            let step = self.config.scale_up_step.min(room);
            let mut joins = JoinSet::new();
            for _ in 0..step {
                if !self.reserve_slot() {
                    break;
                }
                joins.spawn(self.dial_raw());
            }
            let mut grown = 0;
            while let Some(result) = joins.join_next().await {
                match result {
                    Ok(Ok(stream)) => {
                        self.complete_new_connection(stream).await;
                        grown += 1;
                    }
                    _ => {
                        self.total.fetch_sub(1, Ordering::Relaxed);
                        self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            if grown > 0 {
                self.metrics.pool_scales.fetch_add(1, Ordering::Relaxed);
                debug!(target = %self.target_label(), grown, total, active, "scaled pool up");
            }
        } else if ratio < self.config.scale_down_threshold && total > self.config.min_pool_size {
            let room = total - self.config.min_pool_size;
            let step = self.config.scale_down_step.min(room);
            let mut state = self.state.lock().await;
            let removable = step.min(state.idle.len());
            for _ in 0..removable {
                state.idle.pop();
            }
            drop(state);
            if removable > 0 {
                self.total.fetch_sub(removable, Ordering::Relaxed);
                self.metrics.pool_scales.fetch_add(1, Ordering::Relaxed);
                debug!(target = %self.target_label(), removed = removable, total, active, "scaled pool down");
            }
        }

        self.release_scaling_lock();
    }

    /// Cleanup tick (every 30s): evict idle connections past
    /// `idle_timeout`; drop waiter entries older than 10s as orphaned.
    async fn cleanup_tick(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let before = state.idle.len();
        state
            .idle
            .retain(|c| now.duration_since(c.last_active) <= self.config.idle_timeout);
        let evicted = before - state.idle.len();
        if evicted > 0 {
            self.total.fetch_sub(evicted, Ordering::Relaxed);
            trace!(target = %self.target_label(), evicted, "cleanup evicted idle connections");
        }

        let before_waiters = state.waiters.len();
        state
            .waiters
            .retain(|w| now.duration_since(w.enqueued_at) <= WAITER_ORPHAN_AGE);
        let dropped_waiters = before_waiters - state.waiters.len();
        if dropped_waiters > 0 {
            trace!(target = %self.target_label(), dropped_waiters, "cleanup dropped orphaned waiters");
        }
    }

    async fn run_housekeeping(self: Arc<Self>) {
        let mut monitor = tokio::time::interval(MONITOR_INTERVAL);
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);

        loop {
            tokio::select! {
                _ = monitor.tick() => {
                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    self.scale_tick().await;
                }
                _ = cleanup.tick() => {
                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    self.cleanup_tick().await;
                }
            }
        }
    }

    /// Close all idle sockets, unblock all waiters with the unavailable
    /// sentinel, and stop housekeeping. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut state = self.state.lock().await;
        state.idle.clear();
        while let Some(waiter) = state.waiters.pop_front() {
            let _ = waiter.tx.send(WaiterMsg::Unavailable);
        }
        self.total.store(0, Ordering::SeqCst);
        self.active.store(0, Ordering::SeqCst);
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            total: self.total.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            idle: state.idle.len(),
            waiting: state.waiters.len(),
            total_created: self.metrics.total_created.load(Ordering::Relaxed),
            errors: self.metrics.errors.load(Ordering::Relaxed),
            reconnects: self.metrics.reconnects.load(Ordering::Relaxed),
            pool_scales: self.metrics.pool_scales.load(Ordering::Relaxed),
        }
    }

    /// Non-blocking snapshot for use from synchronous contexts (the
    /// `Forwarder::snapshot` trait method). Idle/waiter counts fall back to
    /// 0 if the state lock is momentarily held elsewhere rather than
    /// blocking the caller's thread.
    pub fn stats_sync(&self) -> PoolStats {
        let (idle, waiting) = match self.state.try_lock() {
            Ok(state) => (state.idle.len(), state.waiters.len()),
            Err(_) => (0, 0),
        };
        PoolStats {
            total: self.total.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            idle,
            waiting,
            total_created: self.metrics.total_created.load(Ordering::Relaxed),
            errors: self.metrics.errors.load(Ordering::Relaxed),
            reconnects: self.metrics.reconnects.load(Ordering::Relaxed),
            pool_scales: self.metrics.pool_scales.load(Ordering::Relaxed),
        }
    }
}

/// Among idle connections, prefer fewest errors, tie-broken by newest
/// creation time.
fn best_idle_index(idle: &[IdleConnection]) -> Option<usize> {
    idle.iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            a.meta
                .errors
                .cmp(&b.meta.errors)
                .then_with(|| b.meta.created_at.cmp(&a.meta.created_at))
        })
        .map(|(index, _)| index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if let Ok((mut stream, _)) = listener.accept().await {
                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
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
        addr
    }

    #[tokio::test]
    async fn prewarms_up_to_initial_size() {
        let addr = spawn_echo_server().await;
        let config = PoolConfig {
            initial_pool_size: 4,
            min_pool_size: 2,
            max_pool_size: 10,
            ..Default::default()
        };
        let pool = ConnectionPool::new(addr.ip().to_string(), addr.port(), config);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = pool.stats().await;
        assert_eq!(stats.total, 4);
        assert_eq!(stats.idle, 4);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn acquire_then_release_returns_to_idle() {
        let addr = spawn_echo_server().await;
        let config = PoolConfig {
            initial_pool_size: 1,
            min_pool_size: 1,
            max_pool_size: 5,
            ..Default::default()
        };
        let pool = ConnectionPool::new(addr.ip().to_string(), addr.port(), config);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let (stream, meta) = pool.acquire().await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.active, 1);

        pool.release(stream, meta).await;
        let stats = pool.stats().await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn acquire_dials_when_pool_empty_and_room_remains() {
        let addr = spawn_echo_server().await;
        let config = PoolConfig {
            initial_pool_size: 0,
            min_pool_size: 0,
            max_pool_size: 5,
            ..Default::default()
        };
        let pool = ConnectionPool::new(addr.ip().to_string(), addr.port(), config);

        let (_stream, _meta) = pool.acquire().await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.active, 1);
        assert_eq!(stats.total, 1);
    }

    #[tokio::test]
    async fn acquire_fails_when_upstream_unreachable() {
        let config = PoolConfig {
            initial_pool_size: 0,
            min_pool_size: 0,
            max_pool_size: 1,
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        // TEST-NET-1 (RFC 5737): guaranteed non-routable, dial fails fast.
        let pool = ConnectionPool::new("192.0.2.1", 9999, config);

        let result = pool.acquire().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn destroy_does_not_return_to_idle() {
        let addr = spawn_echo_server().await;
        let config = PoolConfig {
            initial_pool_size: 1,
            min_pool_size: 1,
            max_pool_size: 5,
            ..Default::default()
        };
        let pool = ConnectionPool::new(addr.ip().to_string(), addr.port(), config);
        tokio::time::sleep(Duration::from_millis(150)).await;

        let (_stream, meta) = pool.acquire().await.unwrap();
        pool.destroy(meta).await;

        let stats = pool.stats().await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.total, 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_clears_state() {
        let addr = spawn_echo_server().await;
        let config = PoolConfig {
            initial_pool_size: 2,
            ..Default::default()
        };
        let pool = ConnectionPool::new(addr.ip().to_string(), addr.port(), config);
        tokio::time::sleep(Duration::from_millis(150)).await;

        pool.stop().await;
        pool.stop().await;

        let stats = pool.stats().await;
        assert_eq!(stats.total, 0);
        assert_eq!(stats.idle, 0);
    }
}
