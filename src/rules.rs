//! Rule binder (component C4): turns parsed `RuleConfig` entries into
//! running forwarders and wires them into the stats registry. Invalid rules
//! are logged and skipped; they never abort startup.

use crate::config::{self, PortPair, Protocol, RuleConfig, RuleStatus};
use crate::server::pool::{ConnectionPool, PoolConfig};
use crate::server::tcp::TcpForwarder;
use crate::server::udp::{UdpConfig, UdpForwarder};
use crate::stats::Forwarder;
use crate::utils::error::ProxyError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Result of binding one active rule: the forwarders it started, tagged
/// with the registry id they were registered under.
pub struct BoundRule {
    pub rule_id: i64,
    pub forwarders: Vec<(String, Arc<dyn Forwarder>)>,
}

/// Validate, expand, and bind every active rule in `rules`. Returns one
/// `BoundRule` per rule that produced at least one running forwarder;
/// rules that fail validation or whose expansion is empty are skipped
/// with a logged reason.
pub async fn bind_all(rules: &[RuleConfig]) -> Vec<BoundRule> {
    let mut bound = Vec::with_capacity(rules.len());

    for rule in rules {
        if rule.status != RuleStatus::Active {
            info!(rule_id = rule.id, "skipping inactive rule");
            continue;
        }

        match bind_rule(rule).await {
            Ok(result) => bound.push(result),
            Err(err) => config::log_invalid_rule(rule, &err.to_string()),
        }
    }

    bound
}

/// Bind a single rule: expand its ports, instantiate one forwarder per
/// pair, and deduplicate TCP upstream pools that share a target port
/// within the rule.
async fn bind_rule(rule: &RuleConfig) -> Result<BoundRule, ProxyError> {
    let pairs = rule.expand()?;
    if pairs.is_empty() {
        return Err(ProxyError::RuleValidation {
            id: rule.id,
            reason: "rule expanded to zero port pairs".to_string(),
        });
    }

    let mut forwarders: Vec<(String, Arc<dyn Forwarder>)> = Vec::with_capacity(pairs.len());

    match rule.protocol {
        Protocol::Tcp => {
            let mut pools: HashMap<u16, Arc<ConnectionPool>> = HashMap::new();

            for (index, pair) in pairs.iter().enumerate() {
                let pool = pools
                    .entry(pair.target_port)
                    .or_insert_with(|| {
                        ConnectionPool::new(rule.target_host.clone(), pair.target_port, PoolConfig::default())
                    })
                    .clone();

                let proxy_id = format!("tcp_{}_{}", rule.id, index);
                let forwarder = TcpForwarder::bind(
                    proxy_id.clone(),
                    &rule.local_host,
                    pair.local_port,
                    pool,
                )
                .await?;

                forwarders.push((proxy_id, forwarder as Arc<dyn Forwarder>));
            }
        }
        Protocol::Udp => {
            for (index, pair) in pairs.iter().enumerate() {
                let proxy_id = format!("udp_{}_{}", rule.id, index);
                let forwarder = UdpForwarder::bind(
                    proxy_id.clone(),
                    &rule.local_host,
                    pair.local_port,
                    rule.target_host.clone(),
                    pair.target_port,
                    UdpConfig::default(),
                )
                .await?;

                forwarders.push((proxy_id, forwarder as Arc<dyn Forwarder>));
            }
        }
    }

    info!(
        rule_id = rule.id,
        rule_name = rule.name.as_deref().unwrap_or(""),
        pairs = pairs.len(),
        "bound rule"
    );

    Ok(BoundRule {
        rule_id: rule.id,
        forwarders,
    })
}

#[allow(dead_code)]
fn pair_label(pair: &PortPair) -> String {
    format!("{}->{}", pair.local_port, pair.target_port)
}
