use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Where a node's machine lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudService {
    Aws,
    Gcp,
    /// Local process or an imported host without cloud access.
    None,
}

impl std::fmt::Display for CloudService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aws => write!(f, "aws"),
            Self::Gcp => write!(f, "gcp"),
            Self::None => write!(f, "none"),
        }
    }
}

/// What a node does in its cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    #[default]
    Validator,
    Api,
    Monitor,
    LoadTest,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validator => write!(f, "validator"),
            Self::Api => write!(f, "api"),
            Self::Monitor => write!(f, "monitor"),
            Self::LoadTest => write!(f, "loadtest"),
        }
    }
}

/// Persisted per-node record, stored at nodes/<id>/node_cloud_config.json.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(rename = "nodeID")]
    pub node_id: String,
    #[serde(rename = "cloudService")]
    pub cloud_service: CloudService,
    pub region: String,
    #[serde(rename = "instanceID")]
    pub instance_id: String,
    #[serde(rename = "elasticIP", default, skip_serializing_if = "Option::is_none")]
    pub elastic_ip: Option<String>,
    #[serde(rename = "securityGroup", default)]
    pub security_group: String,
    #[serde(default)]
    pub role: NodeRole,
    /// Cloud key pair name used at provisioning time.
    #[serde(rename = "keyPair", default, skip_serializing_if = "String::is_empty")]
    pub key_pair: String,
    /// Local path of the SSH private key for this node.
    #[serde(rename = "certPath", default, skip_serializing_if = "String::is_empty")]
    pub cert_path: String,
    /// Elastic (AWS) or static (GCP) address that must be released on teardown.
    #[serde(rename = "useStaticIP", default)]
    pub use_static_ip: bool,
    /// HTTP API port of a local node process.
    #[serde(rename = "httpPort", default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
}

impl NodeConfig {
    /// Public address the gateway should reach, if the node has one.
    pub fn public_ip(&self) -> Option<&str> {
        self.elastic_ip.as_deref().filter(|ip| !ip.is_empty())
    }

    /// Copy safe to hand to another operator: no local key paths or cloud handles.
    pub fn redacted(&self) -> Self {
        Self {
            cert_path: String::new(),
            security_group: String::new(),
            key_pair: String::new(),
            ..self.clone()
        }
    }
}

pub const DEFAULT_SSH_USER: &str = "ubuntu";
pub const DEFAULT_API_PORT: u16 = 9650;

/// A reachable machine as seen by the remote execution gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// Inventory ID: `<cloud>_node_<instance id>`.
    pub node_id: String,
    pub ip: String,
    pub ssh_user: String,
    pub ssh_private_key_path: String,
    pub ssh_common_args: String,
    /// Port of the node's HTTP API as seen from the host itself.
    pub api_port: u16,
}

impl Host {
    /// The cloud instance ID behind this host.
    pub fn cloud_id(&self) -> String {
        match parse_inventory_id(&self.node_id) {
            Ok((_, id)) => id,
            Err(_) => self.node_id.clone(),
        }
    }

    /// A host that runs commands on this machine instead of over SSH.
    pub fn is_local(&self) -> bool {
        self.node_id.starts_with("local_node_")
    }
}

/// Build an inventory ID from a cloud service and instance ID.
pub fn inventory_id(cloud: CloudService, instance_id: &str) -> String {
    match cloud {
        CloudService::Aws => format!("aws_node_{}", instance_id),
        CloudService::Gcp => format!("gcp_node_{}", instance_id),
        CloudService::None => format!("local_node_{}", instance_id),
    }
}

/// Split an inventory ID back into cloud service and instance ID.
pub fn parse_inventory_id(id: &str) -> Result<(CloudService, String)> {
    for (prefix, cloud) in [
        ("aws_node_", CloudService::Aws),
        ("gcp_node_", CloudService::Gcp),
        ("local_node_", CloudService::None),
    ] {
        if let Some(rest) = id.strip_prefix(prefix) {
            if rest.is_empty() {
                bail!("Inventory ID {:?} has no instance part", id);
            }
            return Ok((cloud, rest.to_string()));
        }
    }
    bail!("Unknown inventory ID format: {:?}", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NodeConfig {
        NodeConfig {
            node_id: "i-0abc".to_string(),
            cloud_service: CloudService::Aws,
            region: "us-east-1".to_string(),
            instance_id: "i-0abc".to_string(),
            elastic_ip: Some("3.4.5.6".to_string()),
            security_group: "avafleet-us-east-1".to_string(),
            role: NodeRole::Validator,
            key_pair: "kp".to_string(),
            cert_path: "/home/op/.ssh/kp.pem".to_string(),
            use_static_ip: true,
            http_port: None,
        }
    }

    #[test]
    fn test_node_config_json_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["nodeID"], "i-0abc");
        assert_eq!(json["cloudService"], "aws");
        assert_eq!(json["instanceID"], "i-0abc");
        assert_eq!(json["elasticIP"], "3.4.5.6");
        assert_eq!(json["securityGroup"], "avafleet-us-east-1");
        assert_eq!(json["role"], "validator");
    }

    #[test]
    fn test_node_config_minimal_json() {
        let json = r#"{"nodeID":"n1","cloudService":"gcp","region":"us-central1","instanceID":"n1"}"#;
        let node: NodeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(node.role, NodeRole::Validator);
        assert!(node.public_ip().is_none());
        assert!(!node.use_static_ip);
    }

    #[test]
    fn test_redacted_hides_local_handles() {
        let node = sample().redacted();
        assert!(node.cert_path.is_empty());
        assert!(node.security_group.is_empty());
        assert!(node.key_pair.is_empty());
        assert_eq!(node.elastic_ip.as_deref(), Some("3.4.5.6"));
    }

    #[test]
    fn test_inventory_id_roundtrip() {
        let id = inventory_id(CloudService::Gcp, "node-7");
        assert_eq!(id, "gcp_node_node-7");
        let (cloud, instance) = parse_inventory_id(&id).unwrap();
        assert_eq!(cloud, CloudService::Gcp);
        assert_eq!(instance, "node-7");
    }

    #[test]
    fn test_parse_inventory_id_rejects_unknown() {
        assert!(parse_inventory_id("azure_node_x").is_err());
        assert!(parse_inventory_id("aws_node_").is_err());
    }
}
