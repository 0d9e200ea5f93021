use serde::Serialize;
use tabled::Tabled;

use avafleet_core::cluster::ClusterConfig;
use avafleet_coordinator::fleet::NodeStatus;
use avafleet_coordinator::local::LocalNodeStatus;
use avafleet_runtime::cloud::RuleOutcome;

/// "yes", "no", or "?" when the node could not be probed.
fn probe(value: Option<bool>) -> String {
    match value {
        Some(true) => "yes".to_string(),
        Some(false) => "no".to_string(),
        None => "?".to_string(),
    }
}

/// Display row for `cluster status`.
#[derive(Debug, Serialize, Tabled)]
pub struct NodeStatusRow {
    #[tabled(rename = "NODE")]
    pub node_id: String,
    #[tabled(rename = "CLOUD ID")]
    pub cloud_id: String,
    #[tabled(rename = "ROLE")]
    pub role: String,
    #[tabled(rename = "IP")]
    pub ip: String,
    #[tabled(rename = "BOOTSTRAPPED")]
    pub bootstrapped: String,
    #[tabled(rename = "HEALTHY")]
    pub healthy: String,
}

impl From<NodeStatus> for NodeStatusRow {
    fn from(s: NodeStatus) -> Self {
        Self {
            node_id: s.node_id,
            cloud_id: s.cloud_id,
            role: s.role.to_string(),
            ip: s.ip,
            bootstrapped: probe(s.bootstrapped),
            healthy: probe(s.healthy),
        }
    }
}

/// Display row for `local status`.
#[derive(Debug, Serialize, Tabled)]
pub struct LocalNodeRow {
    #[tabled(rename = "NODE")]
    pub node_id: String,
    #[tabled(rename = "HTTP PORT")]
    pub http_port: u16,
    #[tabled(rename = "PID")]
    pub pid: String,
    #[tabled(rename = "STATUS")]
    pub status: String,
    #[tabled(rename = "BOOTSTRAPPED")]
    pub bootstrapped: String,
    #[tabled(rename = "HEALTHY")]
    pub healthy: String,
}

impl From<LocalNodeStatus> for LocalNodeRow {
    fn from(s: LocalNodeStatus) -> Self {
        let status = match (s.running, s.pid) {
            (true, _) => "running",
            (false, Some(_)) => "stopped (stale pid)",
            (false, None) => "stopped",
        };
        Self {
            node_id: s.node_id,
            http_port: s.http_port,
            pid: s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            status: status.to_string(),
            bootstrapped: probe(s.bootstrapped),
            healthy: probe(s.healthy),
        }
    }
}

/// Display row summarizing a cluster entry.
#[derive(Debug, Serialize, Tabled)]
pub struct ClusterInfo {
    #[tabled(rename = "CLUSTER")]
    pub name: String,
    #[tabled(rename = "KIND")]
    pub kind: String,
    #[tabled(rename = "NETWORK")]
    pub network: String,
    #[tabled(rename = "NODES")]
    pub nodes: usize,
    #[tabled(rename = "SUBNETS")]
    pub subnets: String,
}

impl ClusterInfo {
    pub fn new(name: &str, config: &ClusterConfig) -> Self {
        Self {
            name: name.to_string(),
            kind: config.kind().to_string(),
            network: config.network.name(),
            nodes: config.all_node_ids().len(),
            subnets: config.subnets.join(","),
        }
    }
}

/// Display row for `validate l1`.
#[derive(Debug, Serialize, Tabled)]
pub struct ValidationRow {
    #[tabled(rename = "NODE")]
    pub node_id: String,
    #[tabled(rename = "VALIDATION ID")]
    pub validation_id: String,
}

/// Display row for `whitelist-ip`.
#[derive(Debug, Serialize, Tabled)]
pub struct WhitelistRow {
    #[tabled(rename = "TARGET")]
    pub target: String,
    #[tabled(rename = "RESULT")]
    pub result: String,
}

impl WhitelistRow {
    pub fn new(target: &str, outcome: &RuleOutcome) -> Self {
        let result = match outcome {
            RuleOutcome::Added(ports) => format!(
                "added {}",
                ports.iter().map(u16::to_string).collect::<Vec<_>>().join(",")
            ),
            RuleOutcome::AlreadyPresent => "already whitelisted".to_string(),
        };
        Self {
            target: target.to_string(),
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avafleet_core::node::NodeRole;

    #[test]
    fn test_node_status_row() {
        let row = NodeStatusRow::from(NodeStatus {
            node_id: "aws_node_i-1".to_string(),
            cloud_id: "i-1".to_string(),
            role: NodeRole::Api,
            ip: "10.0.0.1".to_string(),
            bootstrapped: Some(true),
            healthy: None,
        });
        assert_eq!(row.role, "api");
        assert_eq!(row.bootstrapped, "yes");
        assert_eq!(row.healthy, "?");
    }

    #[test]
    fn test_local_node_row_status() {
        let row = LocalNodeRow::from(LocalNodeStatus {
            node_id: "dev-node1".to_string(),
            http_port: 9650,
            pid: Some(42),
            running: false,
            bootstrapped: None,
            healthy: None,
        });
        assert_eq!(row.status, "stopped (stale pid)");
        assert_eq!(row.pid, "42");
    }

    #[test]
    fn test_whitelist_row() {
        let added = WhitelistRow::new("aws us-east-1 sg-1", &RuleOutcome::Added(vec![22, 9650]));
        assert_eq!(added.result, "added 22,9650");
        let already = WhitelistRow::new("gcp net", &RuleOutcome::AlreadyPresent);
        assert_eq!(already.result, "already whitelisted");
    }
}
