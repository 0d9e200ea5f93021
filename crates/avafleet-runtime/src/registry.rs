use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::{debug, info, instrument};

use avafleet_core::cluster::{ClusterConfig, ClustersConfig};
use avafleet_core::config::{CommandOptions, FleetPaths};
use avafleet_core::error::FleetError;
use avafleet_core::node::{CloudService, Host, NodeConfig, inventory_id};

use crate::inventory;
use crate::secrets::NodeSecrets;

const LOCK_FILE: &str = ".lock";

/// Persisted cluster and node state under the fleet state root.
///
/// Read-modify-write without optimistic concurrency: callers must finish all
/// per-node concurrent work before touching the cluster registry.
#[derive(Debug, Clone)]
pub struct Registry {
    paths: FleetPaths,
}

impl Registry {
    pub fn new(paths: FleetPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &FleetPaths {
        &self.paths
    }

    // -----------------------------------------------------------------------
    // Clusters
    // -----------------------------------------------------------------------

    /// Load clusters.json. A missing file is an empty registry.
    pub fn load(&self) -> Result<ClustersConfig> {
        let path = self.paths.clusters_file();
        if !path.exists() {
            return Ok(ClustersConfig::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Atomically replace clusters.json.
    pub fn save(&self, config: &ClustersConfig) -> Result<()> {
        let _lock = self.lock()?;
        self.write_clusters(config)
    }

    /// Load, mutate, save under the registry lock.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ClustersConfig) -> Result<()>,
    {
        let _lock = self.lock()?;
        let mut config = self.load()?;
        f(&mut config)?;
        self.write_clusters(&config)
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.load()?.exists(name))
    }

    pub fn cluster(&self, name: &str) -> Result<ClusterConfig> {
        Ok(self.load()?.get(name)?.clone())
    }

    /// Member node IDs; fails with NotFound when the cluster or its node list is missing.
    pub fn get_nodes(&self, name: &str) -> Result<Vec<String>> {
        self.load()?.get_nodes(name)
    }

    /// Remove a cluster entry and its inventory.
    #[instrument(skip(self))]
    pub fn remove_cluster(&self, name: &str) -> Result<()> {
        self.update(|config| {
            config.remove(name);
            Ok(())
        })?;
        let dir = self.paths.inventory_dir(name);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove {}", dir.display()))?;
        }
        info!(cluster = name, "Removed cluster from registry");
        Ok(())
    }

    fn write_clusters(&self, config: &ClustersConfig) -> Result<()> {
        let root = self.paths.root();
        std::fs::create_dir_all(root)
            .with_context(|| format!("Failed to create {}", root.display()))?;
        let json = serde_json::to_string_pretty(config)?;
        let mut tmp = tempfile::NamedTempFile::new_in(root)
            .with_context(|| format!("Failed to create temp file in {}", root.display()))?;
        tmp.write_all(json.as_bytes())?;
        tmp.persist(self.paths.clusters_file())
            .with_context(|| "Failed to replace clusters.json")?;
        debug!(clusters = config.clusters.len(), "Saved cluster registry");
        Ok(())
    }

    fn lock(&self) -> Result<std::fs::File> {
        std::fs::create_dir_all(self.paths.root())?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.paths.root().join(LOCK_FILE))
            .with_context(|| "Failed to open registry lock file")?;
        file.lock_exclusive()
            .with_context(|| "Failed to lock cluster registry")?;
        Ok(file)
    }

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    pub fn node_exists(&self, node_id: &str) -> bool {
        self.paths.node_config_file(node_id).exists()
    }

    pub fn node_dir_exists(&self, node_id: &str) -> bool {
        self.paths.node_dir(node_id).exists()
    }

    pub fn load_node(&self, node_id: &str) -> Result<NodeConfig> {
        let path = self.paths.node_config_file(node_id);
        if !path.exists() {
            return Err(FleetError::NodeNotFound(node_id.to_string()).into());
        }
        read_node_config(&path)
    }

    pub fn save_node(&self, node: &NodeConfig) -> Result<()> {
        write_node_config(&self.paths.node_dir(&node.node_id), node)
    }

    pub fn load_secrets(&self, node_id: &str) -> Result<NodeSecrets> {
        NodeSecrets::read_from(&self.paths.node_dir(node_id))
    }

    /// Delete a node's config and secret directory.
    pub fn remove_node_dir(&self, node_id: &str) -> Result<()> {
        let dir = self.paths.node_dir(node_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove node dir {}", dir.display()))?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Hosts
    // -----------------------------------------------------------------------

    /// Reachable hosts for the given node IDs of a cluster.
    ///
    /// Uses the cluster inventory when present so imported clusters keep the
    /// connection settings they were exported with.
    pub fn hosts(&self, cluster: &str, node_ids: &[String], opts: &CommandOptions) -> Result<Vec<Host>> {
        let inventory_path = self.paths.inventory_file(cluster);
        let from_inventory = if inventory_path.exists() {
            inventory::read(&inventory_path)?
        } else {
            Vec::new()
        };

        node_ids
            .iter()
            .map(|id| {
                let node = self.load_node(id)?;
                let inv_id = inventory_id(node.cloud_service, &node.instance_id);
                match from_inventory.iter().find(|h| h.node_id == inv_id) {
                    Some(host) => Ok(host.clone()),
                    None => host_for(&node, opts),
                }
            })
            .collect()
    }

    /// Regenerate the inventory file from the cluster's node records.
    pub fn write_inventory(&self, cluster: &str, opts: &CommandOptions) -> Result<()> {
        let config = self.cluster(cluster)?;
        let hosts = config
            .all_node_ids()
            .iter()
            .map(|id| self.load_node(id).and_then(|n| host_for(&n, opts)))
            .collect::<Result<Vec<_>>>()?;
        inventory::write(&self.paths.inventory_file(cluster), &hosts)
    }
}

/// Build a gateway host from a node record.
pub fn host_for(node: &NodeConfig, opts: &CommandOptions) -> Result<Host> {
    let ip = match (node.cloud_service, node.public_ip()) {
        (_, Some(ip)) => ip.to_string(),
        (CloudService::None, None) => "127.0.0.1".to_string(),
        (_, None) => anyhow::bail!("Node {} has no public IP", node.node_id),
    };
    let key = if node.cert_path.is_empty() {
        opts.ssh_private_key.clone().unwrap_or_default()
    } else {
        node.cert_path.clone()
    };
    Ok(Host {
        node_id: inventory_id(node.cloud_service, &node.instance_id),
        ip,
        ssh_user: opts.ssh_user.clone(),
        ssh_private_key_path: key,
        ssh_common_args: String::new(),
        api_port: node.http_port.unwrap_or(avafleet_core::node::DEFAULT_API_PORT),
    })
}

pub fn read_node_config(path: &Path) -> Result<NodeConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read node config {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse node config {}", path.display()))
}

/// Write node_cloud_config.json into `dir`.
pub fn write_node_config(dir: &Path, node: &NodeConfig) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create node dir {}", dir.display()))?;
    let json = serde_json::to_string_pretty(node)?;
    std::fs::write(dir.join(avafleet_core::config::NODE_CONFIG_FILE), json)
        .with_context(|| format!("Failed to write node config for {}", node.node_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use avafleet_core::cluster::ClusterKind;
    use avafleet_core::network::NetworkIdentity;
    use avafleet_core::node::NodeRole;

    fn registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let reg = Registry::new(FleetPaths::new(dir.path()));
        (dir, reg)
    }

    fn node(id: &str, ip: &str) -> NodeConfig {
        NodeConfig {
            node_id: id.to_string(),
            cloud_service: CloudService::Aws,
            region: "us-east-1".to_string(),
            instance_id: id.to_string(),
            elastic_ip: Some(ip.to_string()),
            security_group: "sg".to_string(),
            role: NodeRole::Validator,
            key_pair: String::new(),
            cert_path: String::new(),
            use_static_ip: false,
            http_port: None,
        }
    }

    #[test]
    fn test_load_missing_is_empty() {
        let (_dir, reg) = registry();
        let cfg = reg.load().unwrap();
        assert!(cfg.clusters.is_empty());
        assert!(!reg.exists("c1").unwrap());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (_dir, reg) = registry();
        let mut cfg = ClustersConfig::default();
        let mut c = ClusterConfig::new(NetworkIdentity::fuji().for_cluster("c1"), ClusterKind::Cloud);
        c.add_node("i-1");
        c.monitoring_instance = Some("i-m".to_string());
        cfg.insert("c1", c);
        reg.save(&cfg).unwrap();
        assert_eq!(reg.load().unwrap(), cfg);
        assert_eq!(reg.get_nodes("c1").unwrap(), vec!["i-1"]);
    }

    #[test]
    fn test_get_nodes_not_found() {
        let (_dir, reg) = registry();
        let err = reg.get_nodes("ghost").unwrap_err();
        assert!(matches!(
            FleetError::of(&err),
            Some(FleetError::ClusterNotFound(_))
        ));
    }

    #[test]
    fn test_update_and_remove_cluster() {
        let (_dir, reg) = registry();
        reg.update(|cfg| {
            cfg.insert(
                "c1",
                ClusterConfig::new(NetworkIdentity::fuji(), ClusterKind::Cloud),
            );
            Ok(())
        })
        .unwrap();
        std::fs::create_dir_all(reg.paths().inventory_dir("c1")).unwrap();
        reg.remove_cluster("c1").unwrap();
        assert!(!reg.exists("c1").unwrap());
        assert!(!reg.paths().inventory_dir("c1").exists());
    }

    #[test]
    fn test_failed_update_does_not_write() {
        let (_dir, reg) = registry();
        let result = reg.update(|cfg| {
            cfg.insert(
                "c1",
                ClusterConfig::new(NetworkIdentity::fuji(), ClusterKind::Cloud),
            );
            anyhow::bail!("abort")
        });
        assert!(result.is_err());
        assert!(!reg.exists("c1").unwrap());
    }

    #[test]
    fn test_node_save_load_remove() {
        let (_dir, reg) = registry();
        let n = node("i-1", "1.1.1.1");
        reg.save_node(&n).unwrap();
        assert!(reg.node_exists("i-1"));
        assert_eq!(reg.load_node("i-1").unwrap(), n);
        reg.remove_node_dir("i-1").unwrap();
        let err = reg.load_node("i-1").unwrap_err();
        assert_eq!(
            FleetError::of(&err),
            Some(&FleetError::NodeNotFound("i-1".to_string()))
        );
    }

    #[test]
    fn test_hosts_prefer_inventory() {
        let (_dir, reg) = registry();
        reg.save_node(&node("i-1", "1.1.1.1")).unwrap();
        reg.save_node(&node("i-2", "2.2.2.2")).unwrap();
        let mut imported = host_for(&node("i-2", "2.2.2.2"), &CommandOptions::default()).unwrap();
        imported.ssh_user = "admin".to_string();
        inventory::write(&reg.paths().inventory_file("c1"), &[imported]).unwrap();

        let ids = vec!["i-1".to_string(), "i-2".to_string()];
        let hosts = reg.hosts("c1", &ids, &CommandOptions::default()).unwrap();
        assert_eq!(hosts[0].ssh_user, "ubuntu");
        assert_eq!(hosts[0].node_id, "aws_node_i-1");
        assert_eq!(hosts[1].ssh_user, "admin");
    }

    #[test]
    fn test_host_for_local_and_missing_ip() {
        let mut local = node("n1", "");
        local.cloud_service = CloudService::None;
        local.elastic_ip = None;
        local.http_port = Some(9652);
        let h = host_for(&local, &CommandOptions::default()).unwrap();
        assert_eq!(h.ip, "127.0.0.1");
        assert_eq!(h.api_port, 9652);
        assert!(h.is_local());

        let mut cloud = node("i-1", "");
        cloud.elastic_ip = None;
        assert!(host_for(&cloud, &CommandOptions::default()).is_err());
    }
}
