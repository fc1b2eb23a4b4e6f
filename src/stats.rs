//! The stats surface: a capability trait shared by every forwarder plus a
//! registry that external observers (out of scope for this crate) can poll.
//! The registry holds trait objects, not concrete types, so TCP and UDP
//! forwarders can be snapshotted uniformly.

use dashmap::DashMap;
use std::sync::Arc;

/// Per-forwarder counters and gauges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsSnapshot {
    Tcp(TcpStats),
    Udp(UdpStats),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub pool_size: usize,
    pub idle_connections: usize,
    pub waiting_queue_size: usize,
    pub pool_scales: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UdpStats {
    pub messages_forwarded: u64,
    pub client_connections: u64,
    pub errors: u64,
    pub active_clients: usize,
}

/// Capability every forwarder instance exposes to the registry and to
/// lifecycle shutdown.
pub trait Forwarder: Send + Sync {
    fn snapshot(&self) -> StatsSnapshot;
    fn stop(&self);
}

/// Registers forwarder instances under ids of the form
/// `tcp_{ruleId}_{index}` / `udp_{ruleId}_{index}`.
#[derive(Default)]
pub struct StatsRegistry {
    forwarders: DashMap<String, Arc<dyn Forwarder>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, proxy_id: impl Into<String>, forwarder: Arc<dyn Forwarder>) {
        self.forwarders.insert(proxy_id.into(), forwarder);
    }

    pub fn unregister(&self, proxy_id: &str) {
        self.forwarders.remove(proxy_id);
    }

    /// Snapshot every registered forwarder without blocking any data path —
    /// each `snapshot()` call only reads atomics or takes a short lock.
    pub fn snapshot_all(&self) -> Vec<(String, StatsSnapshot)> {
        self.forwarders
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }

    /// Stop every registered forwarder (used by lifecycle shutdown).
    pub fn stop_all(&self) {
        for entry in self.forwarders.iter() {
            entry.value().stop();
        }
    }

    pub fn len(&self) -> usize {
        self.forwarders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forwarders.is_empty()
    }
}
