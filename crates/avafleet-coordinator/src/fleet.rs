//! Fleet Operation Coordinator: cluster-wide operations fanned out per node.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use avafleet_core::cluster::{ClusterConfig, ClusterKind};
use avafleet_core::config::{CommandOptions, WHITELIST_PORTS};
use avafleet_core::error::FleetError;
use avafleet_core::naming::{
    gcp_network_name, gcp_whitelist_rule_name, host_cidr, parse_ipv4, validate_cluster_name,
};
use avafleet_core::network::NetworkIdentity;
use avafleet_core::node::{CloudService, Host, NodeConfig, NodeRole, inventory_id};
use avafleet_runtime::cloud::pool::RegionPool;
use avafleet_runtime::cloud::{
    CloudProvider, CreatedInstance, FirewallRule, InstanceSpec, RuleOutcome, create_instances,
};
use avafleet_runtime::gateway::{RemoteExecutor, shell_quote};
use avafleet_runtime::prober::Prober;
use avafleet_runtime::registry::{Registry, host_for};

use crate::fan_out::{FleetOperationResult, fan_out};
use crate::preflight;

/// Path of the node's main config file on a provisioned host.
pub const REMOTE_NODE_CONFIG: &str = "/home/ubuntu/.avalanchego/configs/node.json";

/// Destroy or stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Destroy,
    Stop,
}

impl Teardown {
    fn verb(self) -> &'static str {
        match self {
            Self::Destroy => "destroy",
            Self::Stop => "stop",
        }
    }

    fn done(self) -> &'static str {
        match self {
            Self::Destroy => "destroyed",
            Self::Stop => "stopped",
        }
    }

    fn already(self) -> &'static str {
        match self {
            Self::Destroy => "already destroyed",
            Self::Stop => "already stopped",
        }
    }
}

/// One row of `cluster status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: String,
    pub cloud_id: String,
    pub role: NodeRole,
    pub ip: String,
    /// None when the node could not be probed.
    pub bootstrapped: Option<bool>,
    pub healthy: Option<bool>,
}

/// Instances to provision in one region.
#[derive(Debug, Clone)]
pub struct RegionRequest {
    pub cloud: CloudService,
    /// AWS region or GCP zone.
    pub region: String,
    pub count: usize,
    pub role: NodeRole,
    pub security_group: String,
    pub key_pair: String,
    pub key_path: String,
}

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub cluster: String,
    pub network: NetworkIdentity,
    pub instance_type: String,
    pub image: String,
    pub use_static_ip: bool,
    pub regions: Vec<RegionRequest>,
}

/// Cluster-wide operations for one command invocation.
#[derive(Clone)]
pub struct Fleet {
    registry: Registry,
    pool: RegionPool,
    executor: Arc<dyn RemoteExecutor>,
    opts: CommandOptions,
}

impl Fleet {
    pub fn new(registry: Registry, pool: RegionPool, executor: Arc<dyn RemoteExecutor>, opts: CommandOptions) -> Self {
        Self {
            registry,
            pool,
            executor,
            opts,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn options(&self) -> &CommandOptions {
        &self.opts
    }

    pub fn prober(&self) -> Prober {
        Prober::new(self.executor.clone())
    }

    /// Cluster config that must not be a local cluster.
    fn cloud_cluster(&self, name: &str, operation: &str) -> Result<ClusterConfig> {
        let config = self.registry.cluster(name)?;
        if config.kind() == ClusterKind::Local {
            return Err(FleetError::NotImplementedForLocal(operation.to_string()).into());
        }
        Ok(config)
    }

    /// Hosts of the given node IDs.
    pub fn hosts(&self, cluster: &str, node_ids: &[String]) -> Result<Vec<Host>> {
        self.registry.hosts(cluster, node_ids, &self.opts)
    }

    /// Hosts of the nodes that take part in validation.
    pub fn validator_hosts(&self, cluster: &str) -> Result<Vec<Host>> {
        let nodes = self.registry.get_nodes(cluster)?;
        let config = self.registry.cluster(cluster)?;
        let ids: Vec<String> = nodes.into_iter().filter(|n| !config.is_api_node(n)).collect();
        self.hosts(cluster, &ids)
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Provision instances in every requested region and register the cluster.
    ///
    /// A failure in any region destroys what earlier regions created; the
    /// registry is only written once every instance is up.
    #[instrument(skip_all, fields(cluster = %request.cluster))]
    pub async fn create(&self, request: &CreateRequest) -> Result<ClusterConfig> {
        validate_cluster_name(&request.cluster)?;
        if self.registry.exists(&request.cluster)? && !self.opts.force {
            return Err(FleetError::ClusterExists(request.cluster.clone()).into());
        }

        let mut created: Vec<(Arc<dyn CloudProvider>, InstanceSpec, CreatedInstance)> = Vec::new();
        for region in &request.regions {
            let provider = self.pool.get(region.cloud, &region.region).await?;
            let spec = InstanceSpec {
                cluster: request.cluster.clone(),
                count: region.count,
                instance_type: request.instance_type.clone(),
                image: request.image.clone(),
                key_pair: region.key_pair.clone(),
                key_path: region.key_path.clone(),
                security_group: region.security_group.clone(),
                use_static_ip: request.use_static_ip,
                role: region.role,
            };
            match create_instances(provider.as_ref(), &spec).await {
                Ok(instances) => {
                    info!(region = %region.region, count = instances.len(), "Region provisioned");
                    created.extend(instances.into_iter().map(|i| (provider.clone(), spec.clone(), i)));
                }
                Err(e) => return Err(self.unwind_create(e, &created).await),
            }
        }

        let mut cluster = ClusterConfig::new(
            request.network.clone().for_cluster(&request.cluster),
            ClusterKind::Cloud,
        );
        for (provider, spec, instance) in &created {
            let node = spec.node_config(provider.as_ref(), instance);
            self.registry.save_node(&node)?;
            match node.role {
                NodeRole::Monitor => cluster.monitoring_instance = Some(node.node_id.clone()),
                NodeRole::LoadTest => {
                    cluster
                        .load_test_instance
                        .insert(format!("loadtest-{}", node.node_id), node.node_id.clone());
                }
                NodeRole::Api => {
                    cluster.add_node(&node.node_id);
                    cluster.api_nodes.push(node.node_id.clone());
                }
                NodeRole::Validator => cluster.add_node(&node.node_id),
            }
        }
        self.registry.update(|config| {
            config.insert(&request.cluster, cluster.clone());
            Ok(())
        })?;
        self.registry.write_inventory(&request.cluster, &self.opts)?;
        info!(nodes = created.len(), "Cluster created");
        Ok(cluster)
    }

    /// Destroy instances of regions that already succeeded, keeping the original error.
    async fn unwind_create(
        &self,
        original: anyhow::Error,
        created: &[(Arc<dyn CloudProvider>, InstanceSpec, CreatedInstance)],
    ) -> anyhow::Error {
        let (message, mut cleanup_errors) = match FleetError::of(&original) {
            Some(FleetError::ProvisioningPartialFailure {
                original,
                cleanup_errors,
            }) => (original.clone(), cleanup_errors.clone()),
            _ => (format!("{:#}", original), Vec::new()),
        };
        for (provider, spec, instance) in created {
            let node = spec.node_config(provider.as_ref(), instance);
            if instance.static_ip
                && let Err(e) = provider.release_static_ip(&node).await
            {
                cleanup_errors.push(format!("release IP of {}: {:#}", node.instance_id, e));
            }
            match provider.destroy_instance(&node).await {
                Ok(()) => {}
                Err(e) if FleetError::is_already_in_target_state(&e) => {}
                Err(e) => cleanup_errors.push(format!("destroy {}: {:#}", node.instance_id, e)),
            }
        }
        FleetError::ProvisioningPartialFailure {
            original: message,
            cleanup_errors,
        }
        .into()
    }

    // ========================================================================
    // Destroy / stop
    // ========================================================================

    /// Terminate every instance of a cluster.
    ///
    /// Per-node values are best-effort cleanup warnings.
    pub async fn destroy(&self, cluster: &str) -> Result<FleetOperationResult<Vec<String>>> {
        self.teardown(cluster, Teardown::Destroy).await
    }

    /// Stop every instance of a cluster and drop it from the registry.
    pub async fn stop(&self, cluster: &str) -> Result<FleetOperationResult<Vec<String>>> {
        self.teardown(cluster, Teardown::Stop).await
    }

    #[instrument(skip_all, fields(cluster = %cluster, op = mode.verb()))]
    async fn teardown(&self, cluster: &str, mode: Teardown) -> Result<FleetOperationResult<Vec<String>>> {
        let config = self.cloud_cluster(cluster, &format!("cluster {}", mode.verb()))?;
        if !self.opts.authorize.remove {
            anyhow::bail!(
                "Removal of cluster {} was not authorized, use --authorize-remove",
                cluster
            );
        }

        let nodes = config
            .all_node_ids()
            .iter()
            .map(|id| self.registry.load_node(id))
            .collect::<Result<Vec<NodeConfig>>>()?;
        let touch_cloud = config.kind() == ClusterKind::Cloud;
        if touch_cloud {
            let regions: BTreeSet<(CloudService, String)> = nodes
                .iter()
                .filter(|n| n.cloud_service != CloudService::None)
                .map(|n| (n.cloud_service, n.region.clone()))
                .collect();
            self.pool
                .prepare(&regions.into_iter().collect::<Vec<_>>())
                .await?;
        } else {
            info!(cluster, "Imported cluster, leaving cloud resources to their owner");
        }

        let outcome = fan_out(nodes, |n| n.node_id.clone(), |node| {
            let this = self.clone();
            async move { this.teardown_node(&node, mode, touch_cloud).await }
        })
        .await;

        // Registry writes happen only after every node task has finished.
        self.prune_cluster(cluster)?;
        let result = outcome?;
        for (node_id, note) in result.notes() {
            info!(node_id = %node_id, "{}", note);
        }
        Ok(result)
    }

    async fn teardown_node(&self, node: &NodeConfig, mode: Teardown, touch_cloud: bool) -> Result<Vec<String>> {
        let mut warnings = Vec::new();
        let mut already = None;

        if touch_cloud && node.cloud_service != CloudService::None {
            let provider = self.pool.get(node.cloud_service, &node.region).await?;
            let done = match mode {
                Teardown::Destroy => provider.destroy_instance(node).await,
                Teardown::Stop => provider.stop_instance(node).await,
            };
            match done {
                Ok(()) => info!(node_id = %node.node_id, "Node {}", mode.done()),
                Err(e) if FleetError::is_already_in_target_state(&e) => already = Some(e),
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to {} node {}", mode.verb(), node.node_id));
                }
            }

            if node.use_static_ip {
                match provider.release_static_ip(node).await {
                    Ok(()) => {}
                    Err(e) if FleetError::is_expired_credentials(&e) => return Err(e),
                    Err(e) => {
                        warn!(node_id = %node.node_id, error = %e, "Failed to release static IP");
                        warnings.push(format!("static IP not released: {:#}", e));
                    }
                }
            }

            if mode == Teardown::Destroy
                && !node.security_group.is_empty()
                && let Some(ip) = node.public_ip()
            {
                match provider.revoke_ip(&node.security_group, ip).await {
                    Ok(()) => {}
                    Err(e) if FleetError::is_expired_credentials(&e) => return Err(e),
                    Err(e) => {
                        warn!(node_id = %node.node_id, error = %e, "Failed to remove firewall rules");
                        warnings.push(format!("firewall rules not removed: {:#}", e));
                    }
                }
            }
        }

        self.registry.remove_node_dir(&node.node_id)?;
        match already {
            Some(e) => Err(e.context(mode.already())),
            None => Ok(warnings),
        }
    }

    /// Drop node IDs whose records are gone; remove the cluster when none remain.
    fn prune_cluster(&self, cluster: &str) -> Result<()> {
        let config = self.registry.cluster(cluster)?;
        let keep: Vec<String> = config
            .all_node_ids()
            .into_iter()
            .filter(|id| self.registry.node_exists(id))
            .collect();
        if keep.is_empty() {
            return self.registry.remove_cluster(cluster);
        }
        self.registry.update(|all| {
            all.get_mut(cluster)?.retain_nodes(&keep);
            Ok(())
        })?;
        self.registry.write_inventory(cluster, &self.opts)?;
        info!(cluster, remaining = keep.len(), "Cluster kept with surviving nodes");
        Ok(())
    }

    // ========================================================================
    // Update subnet
    // ========================================================================

    /// Make every node of the cluster track `subnet_id` and restart it.
    ///
    /// The subnet is recorded in the cluster only when every node succeeded.
    #[instrument(skip_all, fields(cluster = %cluster, subnet = subnet_id))]
    pub async fn update_subnet(
        &self,
        cluster: &str,
        subnet_id: &str,
        rpc_version: Option<u32>,
    ) -> Result<FleetOperationResult> {
        self.cloud_cluster(cluster, "update subnet")?;
        let nodes = self.registry.get_nodes(cluster)?;
        let hosts = self.hosts(cluster, &nodes)?;
        preflight::run(&self.prober(), &hosts, rpc_version).await?;

        let script = track_subnet_script(subnet_id);
        let result = fan_out(hosts, |h| h.node_id.clone(), |host| {
            let executor = self.executor.clone();
            let script = script.clone();
            async move {
                executor
                    .run(&host, &script)
                    .await?
                    .into_stdout(&host, "track subnet")?;
                Ok::<_, anyhow::Error>(())
            }
        })
        .await?;

        if result.is_success() {
            self.registry.update(|all| {
                all.get_mut(cluster)?.track_subnet(subnet_id);
                Ok(())
            })?;
            info!(cluster, subnet = subnet_id, "Cluster now tracks subnet");
        }
        Ok(result)
    }

    // ========================================================================
    // Whitelisting
    // ========================================================================

    /// Grant `ip` access to SSH, API, and monitoring ports on every firewall
    /// the cluster uses: each distinct AWS security group plus one GCP rule.
    #[instrument(skip_all, fields(cluster = %cluster, ip = %ip))]
    pub async fn whitelist_ip(&self, cluster: &str, ip: &str) -> Result<FleetOperationResult<RuleOutcome>> {
        parse_ipv4(ip)?;
        let config = self.cloud_cluster(cluster, "whitelist-ip")?;
        if config.kind() == ClusterKind::External {
            anyhow::bail!("Cluster {} is imported; its firewall is managed by its owner", cluster);
        }
        let nodes = config
            .all_node_ids()
            .iter()
            .map(|id| self.registry.load_node(id))
            .collect::<Result<Vec<_>>>()?;

        let cidr = host_cidr(ip);
        let ports = WHITELIST_PORTS.to_vec();
        let mut targets: Vec<(String, CloudService, String, FirewallRule)> = Vec::new();
        let aws_groups: BTreeSet<(String, String)> = nodes
            .iter()
            .filter(|n| n.cloud_service == CloudService::Aws && !n.security_group.is_empty())
            .map(|n| (n.region.clone(), n.security_group.clone()))
            .collect();
        for (region, group) in aws_groups {
            targets.push((
                format!("aws {} {}", region, group),
                CloudService::Aws,
                region,
                FirewallRule {
                    name: group.clone(),
                    group,
                    cidr: cidr.clone(),
                    ports: ports.clone(),
                },
            ));
        }
        if let Some(gcp) = nodes.iter().find(|n| n.cloud_service == CloudService::Gcp) {
            let prefix = &self.opts.gcp_network_prefix;
            let network = gcp_network_name(prefix);
            targets.push((
                format!("gcp {}", network),
                CloudService::Gcp,
                gcp.region.clone(),
                FirewallRule {
                    group: network,
                    name: gcp_whitelist_rule_name(prefix, ip),
                    cidr: cidr.clone(),
                    ports: ports.clone(),
                },
            ));
        }

        fan_out(targets, |(label, ..)| label.clone(), |(label, cloud, region, rule)| {
            let pool = self.pool.clone();
            async move {
                let provider = pool.get(cloud, &region).await?;
                let outcome = provider.ensure_firewall_rule(&rule).await?;
                match &outcome {
                    RuleOutcome::Added(ports) => info!(rule = %label, ?ports, "Firewall rule added"),
                    RuleOutcome::AlreadyPresent => info!(rule = %label, "Already whitelisted"),
                }
                Ok::<_, anyhow::Error>(outcome)
            }
        })
        .await
    }

    /// Append an SSH public key to authorized_keys on every host, once.
    #[instrument(skip_all, fields(cluster = %cluster))]
    pub async fn whitelist_ssh(&self, cluster: &str, public_key: &str) -> Result<FleetOperationResult> {
        let key = public_key.trim();
        if !(key.starts_with("ssh-") || key.starts_with("ecdsa-")) || key.contains('\n') {
            anyhow::bail!("Not an SSH public key: {:?}", key.chars().take(32).collect::<String>());
        }
        let config = self.cloud_cluster(cluster, "whitelist-ssh")?;
        let hosts = self.hosts(cluster, &config.all_node_ids())?;
        fan_out(hosts, |h| h.node_id.clone(), |host| {
            let executor = self.executor.clone();
            let script = authorize_key_script(&host.ssh_user, key);
            async move {
                executor
                    .run(&host, &script)
                    .await?
                    .into_stdout(&host, "authorize ssh key")?;
                Ok::<_, anyhow::Error>(())
            }
        })
        .await
    }

    // ========================================================================
    // SSH and status
    // ========================================================================

    /// Run a command on every host of the cluster and collect stdout.
    pub async fn ssh(&self, cluster: &str, command: &str) -> Result<FleetOperationResult<String>> {
        let config = self.registry.cluster(cluster)?;
        let hosts = self.hosts(cluster, &config.all_node_ids())?;
        fan_out(hosts, |h| h.node_id.clone(), |host| {
            let executor = self.executor.clone();
            let command = command.to_string();
            async move { executor.run(&host, &command).await?.into_stdout(&host, "command") }
        })
        .await
    }

    /// The host to open an interactive session on: a node or cloud ID of the cluster.
    pub fn shell_host(&self, cluster: &str, node: Option<&str>) -> Result<Host> {
        let config = self.registry.cluster(cluster)?;
        let ids = config.all_node_ids();
        let id = match node {
            None => ids.first().cloned().ok_or_else(|| FleetError::NoNodes(cluster.to_string()))?,
            Some(wanted) => ids
                .iter()
                .find(|id| {
                    id.as_str() == wanted
                        || self
                            .registry
                            .load_node(id)
                            .is_ok_and(|n| inventory_id(n.cloud_service, &n.instance_id) == wanted)
                })
                .cloned()
                .ok_or_else(|| FleetError::NodeNotFound(wanted.to_string()))?,
        };
        let node = self.registry.load_node(&id)?;
        host_for(&node, &self.opts)
    }

    /// Role, address, and liveness of every node.
    pub async fn status(&self, cluster: &str) -> Result<Vec<NodeStatus>> {
        let config = self.registry.cluster(cluster)?;
        let mut rows = Vec::new();
        let mut hosts = Vec::new();
        for id in config.all_node_ids() {
            let node = self.registry.load_node(&id)?;
            let host = host_for(&node, &self.opts)?;
            rows.push(NodeStatus {
                node_id: host.node_id.clone(),
                cloud_id: id.clone(),
                role: role_in(&config, &node),
                ip: host.ip.clone(),
                bootstrapped: None,
                healthy: None,
            });
            hosts.push(host);
        }

        let prober = self.prober();
        let probes = fan_out(hosts, |h| h.node_id.clone(), |host| {
            let prober = prober.clone();
            async move {
                let bootstrapped = prober.is_bootstrapped(&host).await?;
                let healthy = prober.is_healthy(&host).await?;
                Ok::<_, anyhow::Error>((bootstrapped, healthy))
            }
        })
        .await?;
        for (node_id, (bootstrapped, healthy)) in probes.values() {
            if let Some(row) = rows.iter_mut().find(|r| &r.node_id == node_id) {
                row.bootstrapped = Some(*bootstrapped);
                row.healthy = Some(*healthy);
            }
        }
        Ok(rows)
    }
}

/// Role of a node as recorded by its cluster.
pub fn role_in(config: &ClusterConfig, node: &NodeConfig) -> NodeRole {
    if config.monitoring_instance.as_deref() == Some(node.node_id.as_str()) {
        NodeRole::Monitor
    } else if config.load_test_instance.values().any(|id| id == &node.node_id) {
        NodeRole::LoadTest
    } else if config.is_api_node(&node.node_id) {
        NodeRole::Api
    } else {
        node.role
    }
}

/// Stop the node, add a subnet to `track-subnets`, start it again.
pub fn track_subnet_script(subnet_id: &str) -> String {
    format!(
        r#"set -e
CONFIG={config}
sudo systemctl stop avalanchego
tmp=$(mktemp)
jq --arg s {subnet} '.["track-subnets"] = ((.["track-subnets"] // "") | split(",") | map(select(. != "")) + [$s] | unique | join(","))' "$CONFIG" > "$tmp"
mv "$tmp" "$CONFIG"
sudo systemctl start avalanchego"#,
        config = REMOTE_NODE_CONFIG,
        subnet = shell_quote(subnet_id),
    )
}

/// Append `key` to the user's authorized_keys unless already present.
pub fn authorize_key_script(user: &str, key: &str) -> String {
    let file = format!("/home/{}/.ssh/authorized_keys", user);
    format!(
        "mkdir -p \"$(dirname {file})\" && touch {file} && (grep -qxF {key} {file} || echo {key} >> {file})",
        file = shell_quote(&file),
        key = shell_quote(key),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use avafleet_core::config::FleetPaths;
    use avafleet_runtime::mock::{FakeCloud, FakeInstanceState, MockResponse, ScriptedExecutor};

    fn node(id: &str, cloud: CloudService, region: &str, group: &str, ip: &str) -> NodeConfig {
        NodeConfig {
            node_id: id.to_string(),
            cloud_service: cloud,
            region: region.to_string(),
            instance_id: id.to_string(),
            elastic_ip: Some(ip.to_string()),
            security_group: group.to_string(),
            role: NodeRole::Validator,
            key_pair: "kp".to_string(),
            cert_path: "/keys/kp.pem".to_string(),
            use_static_ip: false,
            http_port: None,
        }
    }

    struct Setup {
        _dir: tempfile::TempDir,
        registry: Registry,
        fake: FakeCloud,
    }

    fn setup(cluster: &str, nodes: &[NodeConfig]) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(FleetPaths::new(dir.path()));
        let fake = FakeCloud::aws("us-east-1");
        let mut config = ClusterConfig::new(NetworkIdentity::fuji().for_cluster(cluster), ClusterKind::Cloud);
        for n in nodes {
            registry.save_node(n).unwrap();
            config.add_node(&n.node_id);
            fake.in_region(n.cloud_service, &n.region)
                .add_instance(&n.instance_id, FakeInstanceState::Running);
        }
        registry
            .update(|all| {
                all.insert(cluster, config);
                Ok(())
            })
            .unwrap();
        Setup {
            _dir: dir,
            registry,
            fake,
        }
    }

    fn fleet(s: &Setup, executor: Arc<dyn RemoteExecutor>) -> Fleet {
        let mut opts = CommandOptions::default();
        opts.authorize.remove = true;
        Fleet::new(s.registry.clone(), s.fake.pool(), executor, opts)
    }

    fn idle() -> Arc<dyn RemoteExecutor> {
        Arc::new(ScriptedExecutor::new(|_, _| MockResponse::empty()))
    }

    fn three_nodes() -> Vec<NodeConfig> {
        (1..=3)
            .map(|i| {
                node(
                    &format!("i-{}", i),
                    CloudService::Aws,
                    "us-east-1",
                    "sg-1",
                    &format!("10.0.0.{}", i),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_destroy_with_one_node_already_terminated() {
        let s = setup("devnet1", &three_nodes());
        s.fake.add_instance("i-2", FakeInstanceState::Terminated);

        let result = fleet(&s, idle()).destroy("devnet1").await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.success_count(), 3);
        assert_eq!(result.notes(), vec![("i-2".to_string(), "already destroyed".to_string())]);
        assert!(result.into_result("destroy").is_ok());

        assert!(!s.registry.exists("devnet1").unwrap());
        for id in ["i-1", "i-2", "i-3"] {
            assert!(!s.registry.node_dir_exists(id));
        }
        assert!(s.fake.running().is_empty());
    }

    #[tokio::test]
    async fn test_destroy_keeps_only_failed_nodes() {
        let s = setup("c1", &three_nodes());
        s.fake.fail_destroy("i-2");
        s.fake.fail_destroy("i-3");

        let result = fleet(&s, idle()).destroy("c1").await.unwrap();
        assert_eq!(result.failure_count(), 2);
        let err = result.into_result("destroy").unwrap_err();
        assert_eq!(format!("{}", err), "failed to destroy node(s) [i-2, i-3]");

        let config = s.registry.cluster("c1").unwrap();
        assert_eq!(config.nodes, vec!["i-2".to_string(), "i-3".to_string()]);
        assert!(!s.registry.node_dir_exists("i-1"));
        assert!(s.registry.node_dir_exists("i-2"));
        assert!(s.registry.paths().inventory_file("c1").exists());
    }

    #[tokio::test]
    async fn test_destroy_requires_authorization() {
        let s = setup("c1", &three_nodes());
        let mut f = fleet(&s, idle());
        f.opts.authorize.remove = false;
        let err = f.destroy("c1").await.unwrap_err();
        assert!(format!("{}", err).contains("--authorize-remove"));
        assert_eq!(s.fake.running().len(), 3);
    }

    #[tokio::test]
    async fn test_destroy_aborts_on_expired_credentials() {
        let s = setup("c1", &three_nodes());
        s.fake.expire_credentials();
        let err = fleet(&s, idle()).destroy("c1").await.unwrap_err();
        assert!(FleetError::is_expired_credentials(&err));
        assert_eq!(s.registry.cluster("c1").unwrap().nodes.len(), 3);
    }

    #[tokio::test]
    async fn test_destroy_releases_static_ips_and_revokes_rules() {
        let mut nodes = three_nodes();
        nodes[0].use_static_ip = true;
        let s = setup("c1", &nodes);
        s.fake
            .in_region(CloudService::Aws, "us-east-1")
            .add_rule("sg-1", "10.0.0.2", 22);

        fleet(&s, idle()).destroy("c1").await.unwrap();
        assert_eq!(s.fake.released_ips(), vec!["10.0.0.1".to_string()]);
        assert!(s.fake.rules().is_empty());
    }

    #[tokio::test]
    async fn test_stop_counts_stopped_node_as_already() {
        let s = setup("c1", &three_nodes());
        s.fake.add_instance("i-1", FakeInstanceState::Stopped);
        let result = fleet(&s, idle()).stop("c1").await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.notes()[0].1, "already stopped");
        assert_eq!(s.fake.state_of("i-2"), Some(FakeInstanceState::Stopped));
        assert!(!s.registry.exists("c1").unwrap());
    }

    #[tokio::test]
    async fn test_external_cluster_destroy_skips_cloud() {
        let s = setup("ext", &three_nodes());
        s.registry
            .update(|all| {
                all.get_mut("ext")?.external = true;
                Ok(())
            })
            .unwrap();
        fleet(&s, idle()).destroy("ext").await.unwrap();
        assert!(s.fake.calls().is_empty());
        assert_eq!(s.fake.running().len(), 3);
        assert!(!s.registry.exists("ext").unwrap());
    }

    #[tokio::test]
    async fn test_local_cluster_rejected() {
        let s = setup("loc", &[]);
        s.registry
            .update(|all| {
                all.get_mut("loc")?.local = true;
                Ok(())
            })
            .unwrap();
        let err = fleet(&s, idle()).update_subnet("loc", "subnet-1", None).await.unwrap_err();
        assert!(matches!(FleetError::of(&err), Some(FleetError::NotImplementedForLocal(_))));
    }

    #[tokio::test]
    async fn test_whitelist_ip_across_regions_and_clouds() {
        let nodes = vec![
            node("a", CloudService::Aws, "us-east-1", "sg-1", "10.0.0.1"),
            node("b", CloudService::Aws, "us-east-1", "sg-1", "10.0.0.2"),
            node("c", CloudService::Aws, "eu-west-1", "sg-2", "10.0.0.3"),
            node("d", CloudService::Gcp, "us-east1-b", "avafleet-network", "10.0.0.4"),
        ];
        let s = setup("mycluster", &nodes);
        s.fake
            .in_region(CloudService::Aws, "us-east-1")
            .add_rule("sg-1", "1.2.3.4", 22);

        let result = fleet(&s, idle())
            .whitelist_ip("mycluster", "1.2.3.4")
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.len(), 3);

        let rules = s.fake.rules();
        let groups: BTreeSet<_> = rules
            .iter()
            .filter(|r| r.cidr == "1.2.3.4/32")
            .map(|r| (r.service, r.region.clone(), r.group.clone()))
            .collect();
        assert_eq!(groups.len(), 3);
        assert_eq!(rules.len(), 9);
        assert_eq!(
            result.get("aws us-east-1 sg-1"),
            Some(&crate::fan_out::NodeOutcome::Done(RuleOutcome::Added(vec![9650, 3000])))
        );
    }

    #[tokio::test]
    async fn test_whitelist_ip_twice_is_already_present() {
        let s = setup("c1", &three_nodes());
        let f = fleet(&s, idle());
        f.whitelist_ip("c1", "1.2.3.4").await.unwrap();
        let again = f.whitelist_ip("c1", "1.2.3.4").await.unwrap();
        let outcomes: Vec<_> = again.values().map(|(_, o)| o.clone()).collect();
        assert_eq!(outcomes, vec![RuleOutcome::AlreadyPresent]);
    }

    #[tokio::test]
    async fn test_whitelist_ip_rejects_bad_ip() {
        let s = setup("c1", &three_nodes());
        assert!(fleet(&s, idle()).whitelist_ip("c1", "1.2.3").await.is_err());
        assert!(s.fake.calls().is_empty());
    }

    fn healthy_executor(fail_track_on: &'static str) -> Arc<ScriptedExecutor> {
        Arc::new(ScriptedExecutor::new(move |host, script| {
            if script.contains("info.isBootstrapped") {
                MockResponse::ok(r#"{"result":{"isBootstrapped":true}}"#)
            } else if script.contains("health.health") {
                MockResponse::ok(r#"{"result":{"healthy":true}}"#)
            } else if script.contains("track-subnets") && host.node_id == fail_track_on {
                MockResponse::fail(1, "jq: error")
            } else {
                MockResponse::empty()
            }
        }))
    }

    #[tokio::test]
    async fn test_update_subnet_persists_on_full_success() {
        let s = setup("c1", &three_nodes());
        let exec = healthy_executor("");
        let result = fleet(&s, exec.clone())
            .update_subnet("c1", "subnet-xyz", None)
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(s.registry.cluster("c1").unwrap().subnets, vec!["subnet-xyz".to_string()]);
        let scripts = exec.scripts_for("aws_node_i-1");
        assert!(scripts.iter().any(|s| s.contains("'subnet-xyz'") && s.contains("systemctl start")));
    }

    #[tokio::test]
    async fn test_update_subnet_partial_failure_not_persisted() {
        let s = setup("c1", &three_nodes());
        let result = fleet(&s, healthy_executor("aws_node_i-3"))
            .update_subnet("c1", "subnet-xyz", None)
            .await
            .unwrap();
        assert_eq!(result.failed().keys().cloned().collect::<Vec<_>>(), vec!["aws_node_i-3".to_string()]);
        assert!(s.registry.cluster("c1").unwrap().subnets.is_empty());
    }

    #[tokio::test]
    async fn test_whitelist_ssh_is_idempotent_script() {
        let s = setup("c1", &three_nodes());
        let exec = Arc::new(ScriptedExecutor::new(|_, _| MockResponse::empty()));
        let result = fleet(&s, exec.clone())
            .whitelist_ssh("c1", "ssh-ed25519 AAAAC3Nza op@laptop")
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(exec.calls().len(), 3);
        let script = &exec.scripts_for("aws_node_i-1")[0];
        assert!(script.contains("grep -qxF 'ssh-ed25519 AAAAC3Nza op@laptop'"));
        assert!(script.contains("/home/ubuntu/.ssh/authorized_keys"));

        assert!(fleet(&s, idle()).whitelist_ssh("c1", "not a key").await.is_err());
    }

    #[tokio::test]
    async fn test_ssh_collects_output_per_host() {
        let s = setup("c1", &three_nodes());
        let exec: Arc<dyn RemoteExecutor> = Arc::new(ScriptedExecutor::new(|host, _| {
            if host.node_id == "aws_node_i-2" {
                MockResponse::fail(2, "No such file")
            } else {
                MockResponse::ok(&format!("hello from {}", host.ip))
            }
        }));
        let result = fleet(&s, exec).ssh("c1", "uptime").await.unwrap();
        assert_eq!(result.success_count(), 2);
        let values: Vec<_> = result.values().map(|(_, v)| v.clone()).collect();
        assert_eq!(values, vec!["hello from 10.0.0.1".to_string(), "hello from 10.0.0.3".to_string()]);
        assert!(result.failed()["aws_node_i-2"].contains("No such file"));
    }

    #[tokio::test]
    async fn test_status_rows() {
        let s = setup("c1", &three_nodes());
        s.registry
            .update(|all| {
                all.get_mut("c1")?.api_nodes.push("i-3".to_string());
                Ok(())
            })
            .unwrap();
        let exec: Arc<dyn RemoteExecutor> = healthy_executor("");
        let rows = fleet(&s, exec).status("c1").await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].node_id, "aws_node_i-1");
        assert_eq!(rows[0].bootstrapped, Some(true));
        assert_eq!(rows[2].role, NodeRole::Api);
    }

    #[test]
    fn test_shell_host_lookup() {
        let s = setup("c1", &three_nodes());
        let f = fleet(&s, idle());
        assert_eq!(f.shell_host("c1", None).unwrap().ip, "10.0.0.1");
        assert_eq!(f.shell_host("c1", Some("aws_node_i-2")).unwrap().ip, "10.0.0.2");
        assert!(f.shell_host("c1", Some("i-9")).is_err());
    }

    fn create_request(count: usize) -> CreateRequest {
        CreateRequest {
            cluster: "fresh".to_string(),
            network: NetworkIdentity::fuji(),
            instance_type: "c5.2xlarge".to_string(),
            image: "ami-1".to_string(),
            use_static_ip: false,
            regions: vec![
                RegionRequest {
                    cloud: CloudService::Aws,
                    region: "us-east-1".to_string(),
                    count,
                    role: NodeRole::Validator,
                    security_group: "sg-1".to_string(),
                    key_pair: "kp".to_string(),
                    key_path: "/keys/kp.pem".to_string(),
                },
                RegionRequest {
                    cloud: CloudService::Aws,
                    region: "eu-west-1".to_string(),
                    count: 1,
                    role: NodeRole::Monitor,
                    security_group: "sg-2".to_string(),
                    key_pair: "kp".to_string(),
                    key_path: "/keys/kp.pem".to_string(),
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_create_registers_cluster() {
        let s = setup("other", &[]);
        let config = fleet(&s, idle()).create(&create_request(2)).await.unwrap();
        assert_eq!(config.nodes.len(), 2);
        assert!(config.monitoring_instance.is_some());
        assert_eq!(config.network.cluster_name(), Some("fresh"));
        let stored = s.registry.cluster("fresh").unwrap();
        assert_eq!(stored, config);
        for id in stored.all_node_ids() {
            assert!(s.registry.node_exists(&id));
        }
        assert!(s.registry.paths().inventory_file("fresh").exists());
    }

    #[tokio::test]
    async fn test_create_failure_cleans_up_every_region() {
        let s = setup("other", &[]);
        // The second region fails on its second instance after region one succeeded.
        let fake = s.fake.clone();
        let f = fleet(&s, idle());
        let mut request = create_request(1);
        request.regions[1].count = 2;
        fake.fail_launch_at(1);
        let err = f.create(&request).await.unwrap_err();
        assert!(matches!(
            FleetError::of(&err),
            Some(FleetError::ProvisioningPartialFailure { .. })
        ));
        assert!(fake.running().is_empty());
        assert!(!s.registry.exists("fresh").unwrap());
    }

    #[tokio::test]
    async fn test_create_refuses_existing_cluster() {
        let s = setup("fresh", &three_nodes());
        let err = fleet(&s, idle()).create(&create_request(1)).await.unwrap_err();
        assert!(matches!(FleetError::of(&err), Some(FleetError::ClusterExists(_))));
    }

    #[test]
    fn test_track_subnet_script_quotes_subnet() {
        let script = track_subnet_script("it's");
        assert!(script.contains(r#"--arg s 'it'\''s'"#));
        assert!(script.starts_with("set -e"));
    }
}
