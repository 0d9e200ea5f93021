use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::FleetError;
use crate::network::NetworkIdentity;

pub const CLUSTERS_CONFIG_VERSION: &str = "1";

/// Backend a cluster's nodes run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKind {
    Cloud,
    Local,
    /// Imported from another operator; no cloud credentials for it here.
    External,
}

impl std::fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cloud => write!(f, "cloud"),
            Self::Local => write!(f, "local"),
            Self::External => write!(f, "external"),
        }
    }
}

/// Persisted cluster entry inside clusters.json.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Validator and API node IDs, in creation order.
    #[serde(rename = "nodeIDs", default)]
    pub nodes: Vec<String>,
    /// Subset of `nodes` that serve RPC and never validate.
    #[serde(rename = "apiNodeIDs", default, skip_serializing_if = "Vec::is_empty")]
    pub api_nodes: Vec<String>,
    pub network: NetworkIdentity,
    #[serde(rename = "monitoringInstance", default, skip_serializing_if = "Option::is_none")]
    pub monitoring_instance: Option<String>,
    /// Load test name -> node ID.
    #[serde(rename = "loadTestInstance", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub load_test_instance: BTreeMap<String, String>,
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub local: bool,
    #[serde(rename = "httpAccess", default)]
    pub http_access: bool,
}

impl ClusterConfig {
    pub fn new(network: NetworkIdentity, kind: ClusterKind) -> Self {
        Self {
            nodes: Vec::new(),
            api_nodes: Vec::new(),
            network,
            monitoring_instance: None,
            load_test_instance: BTreeMap::new(),
            subnets: Vec::new(),
            external: kind == ClusterKind::External,
            local: kind == ClusterKind::Local,
            http_access: false,
        }
    }

    pub fn kind(&self) -> ClusterKind {
        if self.local {
            ClusterKind::Local
        } else if self.external {
            ClusterKind::External
        } else {
            ClusterKind::Cloud
        }
    }

    pub fn is_api_node(&self, node_id: &str) -> bool {
        self.api_nodes.iter().any(|n| n == node_id)
    }

    /// Nodes that take part in validation.
    pub fn validator_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| !self.is_api_node(n))
            .cloned()
            .collect()
    }

    /// Every node ID the cluster owns: members, monitoring, load test.
    pub fn all_node_ids(&self) -> Vec<String> {
        let mut ids = self.nodes.clone();
        if let Some(ref monitor) = self.monitoring_instance {
            ids.push(monitor.clone());
        }
        ids.extend(self.load_test_instance.values().cloned());
        ids
    }

    /// Nodes with cloud instances behind them. Local clusters have none.
    pub fn cloud_ids(&self) -> Vec<String> {
        if self.local {
            return Vec::new();
        }
        self.all_node_ids()
    }

    /// Add a node ID, keeping the set ordered by first insertion.
    pub fn add_node(&mut self, node_id: &str) {
        if !self.nodes.iter().any(|n| n == node_id) {
            self.nodes.push(node_id.to_string());
        }
    }

    /// Drop a node from every role it holds.
    pub fn remove_node(&mut self, node_id: &str) {
        self.nodes.retain(|n| n != node_id);
        self.api_nodes.retain(|n| n != node_id);
        if self.monitoring_instance.as_deref() == Some(node_id) {
            self.monitoring_instance = None;
        }
        self.load_test_instance.retain(|_, n| n != node_id);
    }

    /// Keep only the given node IDs, in every role.
    pub fn retain_nodes(&mut self, keep: &[String]) {
        for id in self.all_node_ids() {
            if !keep.contains(&id) {
                self.remove_node(&id);
            }
        }
    }

    pub fn track_subnet(&mut self, subnet: &str) {
        if !self.subnets.iter().any(|s| s == subnet) {
            self.subnets.push(subnet.to_string());
        }
    }

    /// Check that every referenced node resolves.
    pub fn check_nodes_exist(&self, exists: impl Fn(&str) -> bool) -> Result<()> {
        for id in self.all_node_ids() {
            if !exists(&id) {
                return Err(FleetError::NodeNotFound(id).into());
            }
        }
        Ok(())
    }
}

/// GCP project settings shared by all clusters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcpConfig {
    #[serde(rename = "projectName", default)]
    pub project_name: String,
    #[serde(rename = "serviceAccountFilePath", default)]
    pub service_account_file_path: String,
}

/// Top-level persisted state: every known cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClustersConfig {
    pub version: String,
    /// Region -> key pair name.
    #[serde(rename = "keyPair", default)]
    pub key_pair: BTreeMap<String, String>,
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterConfig>,
    #[serde(rename = "gcpConfig", default)]
    pub gcp: GcpConfig,
}

impl Default for ClustersConfig {
    fn default() -> Self {
        Self {
            version: CLUSTERS_CONFIG_VERSION.to_string(),
            key_pair: BTreeMap::new(),
            clusters: BTreeMap::new(),
            gcp: GcpConfig::default(),
        }
    }
}

impl ClustersConfig {
    pub fn exists(&self, name: &str) -> bool {
        self.clusters.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Result<&ClusterConfig> {
        self.clusters
            .get(name)
            .ok_or_else(|| FleetError::ClusterNotFound(name.to_string()).into())
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut ClusterConfig> {
        self.clusters
            .get_mut(name)
            .ok_or_else(|| FleetError::ClusterNotFound(name.to_string()).into())
    }

    /// Member nodes of a cluster. Empty member lists are only valid for local clusters.
    pub fn get_nodes(&self, name: &str) -> Result<Vec<String>> {
        let cluster = self.get(name)?;
        if cluster.nodes.is_empty() && !cluster.local {
            return Err(FleetError::NoNodes(name.to_string()).into());
        }
        Ok(cluster.nodes.clone())
    }

    pub fn insert(&mut self, name: &str, cluster: ClusterConfig) {
        self.clusters.insert(name.to_string(), cluster);
    }

    pub fn remove(&mut self, name: &str) -> Option<ClusterConfig> {
        self.clusters.remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkIdentity;

    fn cluster_with(nodes: &[&str]) -> ClusterConfig {
        let mut c = ClusterConfig::new(NetworkIdentity::fuji().for_cluster("c1"), ClusterKind::Cloud);
        for n in nodes {
            c.add_node(n);
        }
        c
    }

    #[test]
    fn test_kind_from_flags() {
        let c = ClusterConfig::new(NetworkIdentity::local(), ClusterKind::Local);
        assert_eq!(c.kind(), ClusterKind::Local);
        assert!(c.cloud_ids().is_empty());
        let c = ClusterConfig::new(NetworkIdentity::fuji(), ClusterKind::External);
        assert_eq!(c.kind(), ClusterKind::External);
    }

    #[test]
    fn test_validator_nodes_exclude_api() {
        let mut c = cluster_with(&["a", "b", "api1"]);
        c.api_nodes.push("api1".to_string());
        assert_eq!(c.validator_nodes(), vec!["a", "b"]);
        assert!(c.is_api_node("api1"));
    }

    #[test]
    fn test_all_node_ids_include_monitor_and_loadtest() {
        let mut c = cluster_with(&["a"]);
        c.monitoring_instance = Some("mon".to_string());
        c.load_test_instance.insert("lt".to_string(), "lt-node".to_string());
        assert_eq!(c.all_node_ids(), vec!["a", "mon", "lt-node"]);
    }

    #[test]
    fn test_remove_node_clears_every_role() {
        let mut c = cluster_with(&["a", "b"]);
        c.api_nodes.push("b".to_string());
        c.monitoring_instance = Some("mon".to_string());
        c.remove_node("b");
        c.remove_node("mon");
        assert_eq!(c.nodes, vec!["a"]);
        assert!(c.api_nodes.is_empty());
        assert!(c.monitoring_instance.is_none());
    }

    #[test]
    fn test_retain_nodes_keeps_only_failures() {
        let mut c = cluster_with(&["a", "b", "c"]);
        c.monitoring_instance = Some("mon".to_string());
        c.retain_nodes(&["b".to_string()]);
        assert_eq!(c.nodes, vec!["b"]);
        assert!(c.monitoring_instance.is_none());
    }

    #[test]
    fn test_add_node_and_track_subnet_are_sets() {
        let mut c = cluster_with(&["a", "a"]);
        c.track_subnet("s1");
        c.track_subnet("s1");
        assert_eq!(c.nodes.len(), 1);
        assert_eq!(c.subnets, vec!["s1"]);
    }

    #[test]
    fn test_get_nodes_errors() {
        let mut cfg = ClustersConfig::default();
        let err = cfg.get_nodes("missing").unwrap_err();
        assert_eq!(
            FleetError::of(&err),
            Some(&FleetError::ClusterNotFound("missing".to_string()))
        );
        cfg.insert("empty", cluster_with(&[]));
        let err = cfg.get_nodes("empty").unwrap_err();
        assert!(matches!(FleetError::of(&err), Some(FleetError::NoNodes(_))));
        cfg.insert(
            "loc",
            ClusterConfig::new(NetworkIdentity::local(), ClusterKind::Local),
        );
        assert!(cfg.get_nodes("loc").unwrap().is_empty());
    }

    #[test]
    fn test_check_nodes_exist() {
        let c = cluster_with(&["a", "b"]);
        assert!(c.check_nodes_exist(|_| true).is_ok());
        let err = c.check_nodes_exist(|id| id == "a").unwrap_err();
        assert_eq!(
            FleetError::of(&err),
            Some(&FleetError::NodeNotFound("b".to_string()))
        );
    }

    #[test]
    fn test_clusters_config_roundtrip_exact() {
        let mut cfg = ClustersConfig::default();
        let mut c = cluster_with(&["i-1", "i-2"]);
        c.monitoring_instance = Some("i-m".to_string());
        c.track_subnet("2Xa");
        cfg.insert("c1", c);
        cfg.key_pair.insert("us-east-1".to_string(), "kp".to_string());
        let json = serde_json::to_string_pretty(&cfg).unwrap();
        let parsed: ClustersConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, cfg);
        let again = serde_json::to_string_pretty(&parsed).unwrap();
        assert_eq!(again, json);
        assert!(json.contains("\"nodeIDs\""));
        assert!(json.contains("\"monitoringInstance\""));
    }
}
