pub mod pool;
pub mod tcp;
pub mod udp;

use crate::config::{self, RuleConfig};
use crate::rules;
use crate::stats::StatsRegistry;
use crate::utils::error::Result;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Top-level lifecycle (component C6): loads rules, binds every active one,
/// registers its forwarders for stats, and tears everything down on
/// shutdown.
pub struct ProxyServer {
    registry: Arc<StatsRegistry>,
    rule_ids: Vec<i64>,
}

impl ProxyServer {
    /// Load the rules file and bind every active rule. Invalid or
    /// unbindable rules are logged and skipped; a rules file that fails to
    /// parse at all is a fatal `ProxyError::Config`.
    pub async fn start<P: AsRef<Path>>(rules_path: P) -> Result<Self> {
        let rules: Vec<RuleConfig> = config::load_rules(rules_path)?;
        let registry = Arc::new(StatsRegistry::new());

        let bound = rules::bind_all(&rules).await;
        let mut rule_ids = Vec::with_capacity(bound.len());

        for entry in bound {
            rule_ids.push(entry.rule_id);
            for (proxy_id, forwarder) in entry.forwarders {
                registry.register(proxy_id, forwarder);
            }
        }

        if registry.is_empty() {
            warn!("no rules produced a running forwarder; proxy is idle");
        } else {
            info!(
                rules_bound = rule_ids.len(),
                forwarders = registry.len(),
                "proxy server started"
            );
        }

        Ok(Self { registry, rule_ids })
    }

    pub fn registry(&self) -> Arc<StatsRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn rule_count(&self) -> usize {
        self.rule_ids.len()
    }

    /// Stop every registered forwarder. Idempotent: each forwarder's own
    /// `stop()` is idempotent, and calling this twice just re-stops them.
    pub fn shutdown(&self) {
        info!("shutting down proxy server");
        self.registry.stop_all();
    }
}
