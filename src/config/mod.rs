use crate::utils::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{error, warn};

/// `active` rules get listeners bound for them; `inactive` rules are parsed
/// but otherwise ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A single port mapping, or a parallel-offset range of mappings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    Single {
        #[serde(rename = "localPort")]
        local_port: u16,
        #[serde(rename = "targetPort")]
        target_port: u16,
    },
    Range {
        #[serde(rename = "localPortRange")]
        local_port_range: [u32; 2],
        #[serde(rename = "targetPortRange")]
        target_port_range: [u32; 2],
    },
}

/// One entry of the `forward` array in the rules file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    pub status: RuleStatus,
    #[serde(rename = "type")]
    pub protocol: Protocol,
    #[serde(rename = "localHost")]
    pub local_host: String,
    #[serde(rename = "targetHost")]
    pub target_host: String,
    #[serde(flatten)]
    pub ports: PortSpec,
}

/// One expanded (localPort, targetPort) pair derived from a rule.
#[derive(Debug, Clone, Copy)]
pub struct PortPair {
    pub local_port: u16,
    pub target_port: u16,
}

impl RuleConfig {
    fn invalid(&self, reason: impl Into<String>) -> ProxyError {
        ProxyError::RuleValidation {
            id: self.id,
            reason: reason.into(),
        }
    }

    /// Validate and expand this rule into its constituent (local, target)
    /// port pairs. A single-port rule yields exactly one pair; a range rule
    /// of length 1 behaves identically to a single-port rule.
    pub fn expand(&self) -> Result<Vec<PortPair>> {
        match &self.ports {
            PortSpec::Single {
                local_port,
                target_port,
            } => {
                if *local_port == 0 || *target_port == 0 {
                    return Err(self.invalid("localPort and targetPort must be in 1..=65535"));
                }
                Ok(vec![PortPair {
                    local_port: *local_port,
                    target_port: *target_port,
                }])
            }
            PortSpec::Range {
                local_port_range,
                target_port_range,
            } => {
                let [local_start, local_end] = *local_port_range;
                let [target_start, target_end] = *target_port_range;

                if local_start > local_end {
                    return Err(self.invalid(format!(
                        "localPortRange start {} exceeds end {}",
                        local_start, local_end
                    )));
                }
                if target_start > target_end {
                    return Err(self.invalid(format!(
                        "targetPortRange start {} exceeds end {}",
                        target_start, target_end
                    )));
                }

                let local_len = local_end - local_start;
                let target_len = target_end - target_start;
                if local_len != target_len {
                    return Err(self.invalid(format!(
                        "localPortRange length {} does not match targetPortRange length {}",
                        local_len + 1,
                        target_len + 1
                    )));
                }

                if local_end > 65535 || target_end > 65535 || local_start == 0 || target_start == 0
                {
                    return Err(self.invalid("port range values must be in 1..=65535"));
                }

                let pairs = (0..=local_len)
                    .map(|offset| PortPair {
                        local_port: (local_start + offset) as u16,
                        target_port: (target_start + offset) as u16,
                    })
                    .collect();
                Ok(pairs)
            }
        }
    }
}

/// Top-level rules file: `{"forward": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesFile {
    pub forward: Vec<RuleConfig>,
}

/// Load and parse the rules file. A missing file or malformed JSON is fatal
/// (`ProxyError::Config`); a missing/non-array `forward` field is also
/// fatal. Individual rule validity is checked later by the rule binder,
/// which logs and skips invalid rules rather than aborting startup.
pub fn load_rules<P: AsRef<Path>>(path: P) -> Result<Vec<RuleConfig>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::Config(format!("failed to read rules file {}: {}", path.display(), e))
    })?;

    let value: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| ProxyError::Config(format!("invalid JSON in rules file: {}", e)))?;

    let forward = value.get("forward").ok_or_else(|| {
        ProxyError::Config("rules file is missing a top-level \"forward\" array".to_string())
    })?;

    if !forward.is_array() {
        return Err(ProxyError::Config(
            "\"forward\" must be a JSON array".to_string(),
        ));
    }

    let rules: RulesFile = serde_json::from_value(value)
        .map_err(|e| ProxyError::Config(format!("invalid rule entry: {}", e)))?;

    check_unique_ids(&rules.forward);

    Ok(rules.forward)
}

fn check_unique_ids(rules: &[RuleConfig]) {
    let mut seen = std::collections::HashSet::new();
    for rule in rules {
        if !seen.insert(rule.id) {
            warn!(rule_id = rule.id, "duplicate rule id in rules file");
        }
    }
}

/// Write a documented example rules file for the `--generate-rules`
/// convenience flag.
pub fn write_example_rules<P: AsRef<Path>>(path: P) -> Result<()> {
    let example = serde_json::json!({
        "forward": [
            {
                "id": 1,
                "name": "web",
                "status": "active",
                "type": "tcp",
                "localHost": "0.0.0.0",
                "targetHost": "127.0.0.1",
                "localPort": 8080,
                "targetPort": 80
            },
            {
                "id": 2,
                "name": "game-ports",
                "status": "active",
                "type": "udp",
                "localHost": "0.0.0.0",
                "targetHost": "10.0.0.5",
                "localPortRange": [27015, 27017],
                "targetPortRange": [7015, 7017]
            }
        ]
    });

    let content = serde_json::to_string_pretty(&example)
        .map_err(|e| ProxyError::Config(format!("failed to render example rules: {}", e)))?;

    std::fs::write(path.as_ref(), content)
        .map_err(|e| ProxyError::Config(format!("failed to write example rules file: {}", e)))?;

    Ok(())
}

/// Log-and-skip wrapper used by the rule binder when a rule fails
/// expansion or validation.
pub fn log_invalid_rule(rule: &RuleConfig, reason: &str) {
    error!(
        rule_id = rule.id,
        rule_name = rule.name.as_deref().unwrap_or(""),
        reason,
        "rejecting invalid rule"
    );
}
