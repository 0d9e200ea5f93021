//! Local clusters: avalanchego processes on this machine.
//!
//! Each node gets a working directory under the state root holding its
//! config file, pid file and log. Nodes after the first bootstrap from the
//! first node.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use avafleet_core::cluster::{ClusterConfig, ClusterKind};
use avafleet_core::config::{CommandOptions, LocalSettings};
use avafleet_core::error::FleetError;
use avafleet_core::naming::validate_cluster_name;
use avafleet_core::network::NetworkIdentity;
use avafleet_core::node::{CloudService, Host, NodeConfig, NodeRole};
use avafleet_core::retry::{PollOutcome, poll_until};
use avafleet_runtime::gateway::RemoteExecutor;
use avafleet_runtime::prober::Prober;
use avafleet_runtime::registry::{Registry, host_for};

use crate::fan_out::{FleetOperationResult, fan_out};

const NODE_CONFIG: &str = "node.json";
const NODE_PID: &str = "avalanchego.pid";
const NODE_LOG: &str = "avalanchego.log";

/// Seconds a node gets to exit on SIGTERM before SIGKILL.
const STOP_GRACE_SECS: u64 = 10;

/// One row of `local status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalNodeStatus {
    pub node_id: String,
    pub http_port: u16,
    pub pid: Option<u32>,
    pub running: bool,
    pub bootstrapped: Option<bool>,
    pub healthy: Option<bool>,
}

/// HTTP and staking port of the node at `index`.
pub fn node_ports(base: u16, index: usize) -> Result<(u16, u16)> {
    let http = u16::try_from(index)
        .ok()
        .and_then(|i| i.checked_mul(2))
        .and_then(|offset| base.checked_add(offset))
        .with_context(|| format!("Port for local node {} is out of range", index + 1))?;
    let staking = http
        .checked_add(1)
        .with_context(|| format!("Staking port for local node {} is out of range", index + 1))?;
    Ok((http, staking))
}

/// Node record ID of the `index`th node of a local cluster.
pub fn local_node_id(cluster: &str, index: usize) -> String {
    format!("{}-node{}", cluster, index + 1)
}

/// Bootstrap peer of a node: the first node's ID and staking address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub node_id: String,
    pub staking_port: u16,
}

/// avalanchego config file for one node.
pub fn node_config_json(data_dir: &Path, http_port: u16, staking_port: u16, bootstrap: Option<&BootstrapPeer>) -> Value {
    let mut config = json!({
        "network-id": "local",
        "http-host": "127.0.0.1",
        "http-port": http_port,
        "staking-port": staking_port,
        "data-dir": data_dir.join("data"),
        "log-dir": data_dir.join("logs"),
        "track-subnets": "",
    });
    if let Some(peer) = bootstrap {
        config["bootstrap-ips"] = json!(format!("127.0.0.1:{}", peer.staking_port));
        config["bootstrap-ids"] = json!(peer.node_id);
    }
    config
}

/// Add `subnet` to the config's comma-separated `track-subnets`. False if already tracked.
pub fn add_tracked_subnet(config: &mut Value, subnet: &str) -> Result<bool> {
    let obj = config
        .as_object_mut()
        .context("Node config is not a JSON object")?;
    let current = obj
        .get("track-subnets")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let mut subnets: BTreeSet<&str> = current.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    if !subnets.insert(subnet) {
        return Ok(false);
    }
    let joined = subnets.into_iter().collect::<Vec<_>>().join(",");
    obj.insert("track-subnets".to_string(), Value::String(joined));
    Ok(true)
}

/// Parse a pid file's content.
pub fn parse_pid(content: &str) -> Option<u32> {
    content.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

/// Manages the processes behind local clusters.
#[derive(Clone)]
pub struct LocalNetwork {
    registry: Registry,
    executor: Arc<dyn RemoteExecutor>,
    opts: CommandOptions,
    avalanchego_path: String,
    base_port: u16,
}

impl LocalNetwork {
    pub fn new(registry: Registry, executor: Arc<dyn RemoteExecutor>, settings: &LocalSettings, opts: CommandOptions) -> Self {
        Self {
            registry,
            executor,
            opts,
            avalanchego_path: settings.avalanchego_path.clone(),
            base_port: settings.base_http_port,
        }
    }

    fn data_dir(&self, cluster: &str, node_id: &str) -> PathBuf {
        self.registry.paths().local_data_dir(cluster, node_id)
    }

    fn local_cluster(&self, cluster: &str) -> Result<ClusterConfig> {
        let config = self.registry.cluster(cluster)?;
        if config.kind() != ClusterKind::Local {
            anyhow::bail!("Cluster {} is not a local cluster", cluster);
        }
        Ok(config)
    }

    /// Hosts of a local cluster's nodes, for probes and validator flows.
    pub fn hosts(&self, cluster: &str) -> Result<Vec<Host>> {
        let config = self.local_cluster(cluster)?;
        config
            .nodes
            .iter()
            .map(|id| self.registry.load_node(id).and_then(|n| host_for(&n, &self.opts)))
            .collect()
    }

    /// Start a local cluster. A new cluster gets `count` nodes; an existing
    /// one restarts whichever of its nodes are not running.
    #[instrument(skip_all, fields(cluster = %cluster))]
    pub async fn start(&self, cluster: &str, count: usize) -> Result<ClusterConfig> {
        validate_cluster_name(cluster)?;
        if self.registry.exists(cluster)? {
            let config = self.local_cluster(cluster)?;
            for id in &config.nodes {
                self.launch_existing(cluster, id)?;
            }
            info!(nodes = config.nodes.len(), "Restarted local cluster");
            return Ok(config);
        }
        if count == 0 {
            anyhow::bail!("A local cluster needs at least one node");
        }

        let mut config = ClusterConfig::new(NetworkIdentity::local().for_cluster(cluster), ClusterKind::Local);
        if let Err(e) = self.create_nodes(cluster, count, &mut config).await {
            for id in &config.nodes {
                let dir = self.data_dir(cluster, id);
                if let Err(stop_err) = stop_pid(&dir.join(NODE_PID)).await {
                    warn!(node_id = %id, error = %stop_err, "Failed to stop local node during cleanup");
                }
                let _ = fs::remove_dir_all(&dir);
                let _ = self.registry.remove_node_dir(id);
            }
            return Err(e);
        }

        self.registry.update(|all| {
            all.insert(cluster, config.clone());
            Ok(())
        })?;
        self.registry.write_inventory(cluster, &self.opts)?;
        Ok(config)
    }

    /// Write, register and launch `count` nodes, adding each to `config` as it is registered.
    async fn create_nodes(&self, cluster: &str, count: usize, config: &mut ClusterConfig) -> Result<()> {
        let prober = Prober::new(self.executor.clone());
        let mut bootstrap: Option<BootstrapPeer> = None;
        for index in 0..count {
            let node_id = local_node_id(cluster, index);
            if self.registry.node_dir_exists(&node_id) {
                return Err(FleetError::NodeDirExists(node_id).into());
            }
            let (http_port, staking_port) = node_ports(self.base_port, index)?;
            let dir = self.data_dir(cluster, &node_id);
            fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
            let node_config = node_config_json(&dir, http_port, staking_port, bootstrap.as_ref());
            write_json(&dir.join(NODE_CONFIG), &node_config)?;

            let node = NodeConfig {
                node_id: node_id.clone(),
                cloud_service: CloudService::None,
                region: "local".to_string(),
                instance_id: node_id.clone(),
                elastic_ip: None,
                security_group: String::new(),
                role: NodeRole::Validator,
                key_pair: String::new(),
                cert_path: String::new(),
                use_static_ip: false,
                http_port: Some(http_port),
            };
            self.registry.save_node(&node)?;
            config.add_node(&node_id);
            self.launch(&dir)?;
            info!(node_id = %node_id, http_port, "Started local node");

            if index == 0 && count > 1 {
                let host = host_for(&node, &self.opts)?;
                let peer_id = self.wait_node_id(&prober, &host).await?;
                bootstrap = Some(BootstrapPeer {
                    node_id: peer_id,
                    staking_port,
                });
            }
        }
        Ok(())
    }

    async fn wait_node_id(&self, prober: &Prober, host: &Host) -> Result<String> {
        let found = std::sync::Mutex::new(None);
        let outcome = poll_until(self.opts.primary_poll, "local bootstrap node", || async {
            match prober.node_id(host).await {
                Ok(id) => {
                    if let Ok(mut slot) = found.lock() {
                        *slot = Some(id);
                    }
                    Ok(true)
                }
                Err(_) => Ok(false),
            }
        })
        .await?;
        let id = found.into_inner().ok().flatten();
        match (outcome, id) {
            (PollOutcome::Ready, Some(id)) => Ok(id),
            _ => anyhow::bail!("Local node {} did not report its node ID in time", host.node_id),
        }
    }

    fn launch_existing(&self, cluster: &str, node_id: &str) -> Result<()> {
        let dir = self.data_dir(cluster, node_id);
        if pid_alive(&dir.join(NODE_PID)) {
            return Ok(());
        }
        self.launch(&dir)?;
        info!(node_id, "Restarted local node");
        Ok(())
    }

    fn launch(&self, dir: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.avalanchego_path);
        cmd.arg(format!("--config-file={}", dir.join(NODE_CONFIG).display()))
            .current_dir(dir);
        spawn_background(cmd, &dir.join(NODE_PID), &dir.join(NODE_LOG))
            .with_context(|| format!("Failed to start {}", self.avalanchego_path))
    }

    /// Stop every node process of a cluster. Nodes with no live process count as already stopped.
    #[instrument(skip_all, fields(cluster = %cluster))]
    pub async fn stop(&self, cluster: &str) -> Result<FleetOperationResult> {
        let config = self.local_cluster(cluster)?;
        let dirs: Vec<(String, PathBuf)> = config
            .nodes
            .iter()
            .map(|id| (id.clone(), self.data_dir(cluster, id)))
            .collect();
        fan_out(dirs, |(id, _)| id.clone(), |(id, dir)| async move {
            if stop_pid(&dir.join(NODE_PID)).await? {
                info!(node_id = %id, "Stopped local node");
                Ok::<_, anyhow::Error>(())
            } else {
                Err(anyhow::Error::from(FleetError::NodeNotRunning { node_id: id }).context("already stopped"))
            }
        })
        .await
    }

    /// Stop a cluster and delete its processes' data, node records and registry entry.
    #[instrument(skip_all, fields(cluster = %cluster))]
    pub async fn destroy(&self, cluster: &str) -> Result<()> {
        let config = self.local_cluster(cluster)?;
        let stopped = self.stop(cluster).await?;
        for (id, reason) in stopped.failed() {
            warn!(node_id = %id, reason = %reason, "Failed to stop local node");
        }
        for id in &config.nodes {
            let dir = self.data_dir(cluster, id);
            if dir.exists() {
                fs::remove_dir_all(&dir).with_context(|| format!("Failed to remove {}", dir.display()))?;
            }
            self.registry.remove_node_dir(id)?;
        }
        let root = self.registry.paths().local_cluster_dir(cluster);
        if root.exists() {
            fs::remove_dir_all(&root).with_context(|| format!("Failed to remove {}", root.display()))?;
        }
        self.registry.remove_cluster(cluster)?;
        info!("Destroyed local cluster");
        Ok(())
    }

    /// Add `subnet` to every node's tracked subnets and restart the nodes.
    /// The cluster records the subnet only when every node was restarted.
    #[instrument(skip_all, fields(cluster = %cluster, subnet = %subnet))]
    pub async fn track(&self, cluster: &str, subnet: &str) -> Result<FleetOperationResult> {
        let config = self.local_cluster(cluster)?;
        let jobs: Vec<(String, PathBuf)> = config
            .nodes
            .iter()
            .map(|id| (id.clone(), self.data_dir(cluster, id)))
            .collect();
        let this = self.clone();
        let subnet_owned = subnet.to_string();
        let result = fan_out(jobs, |(id, _)| id.clone(), move |(id, dir)| {
            let this = this.clone();
            let subnet = subnet_owned.clone();
            async move {
                let path = dir.join(NODE_CONFIG);
                let mut node_config = read_json(&path)?;
                if add_tracked_subnet(&mut node_config, &subnet)? {
                    write_json(&path, &node_config)?;
                }
                stop_pid(&dir.join(NODE_PID)).await?;
                this.launch(&dir)?;
                info!(node_id = %id, "Restarted local node to track subnet");
                Ok::<_, anyhow::Error>(())
            }
        })
        .await?;

        if result.is_success() {
            self.registry.update(|all| {
                all.get_mut(cluster)?.track_subnet(subnet);
                Ok(())
            })?;
        }
        Ok(result)
    }

    /// Process state plus bootstrap and health of every node.
    pub async fn status(&self, cluster: &str) -> Result<Vec<LocalNodeStatus>> {
        let config = self.local_cluster(cluster)?;
        let prober = Prober::new(self.executor.clone());
        let mut rows = Vec::new();
        for id in &config.nodes {
            let node = self.registry.load_node(id)?;
            let pid_path = self.data_dir(cluster, id).join(NODE_PID);
            let pid = fs::read_to_string(&pid_path).ok().as_deref().and_then(parse_pid);
            let running = pid_alive(&pid_path);
            let mut row = LocalNodeStatus {
                node_id: id.clone(),
                http_port: node.http_port.unwrap_or(avafleet_core::node::DEFAULT_API_PORT),
                pid,
                running,
                bootstrapped: None,
                healthy: None,
            };
            if running {
                let host = host_for(&node, &self.opts)?;
                row.bootstrapped = prober.is_bootstrapped(&host).await.ok();
                row.healthy = prober.is_healthy(&host).await.ok();
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

// -------------------------------------------------------------------------
// Helpers
// -------------------------------------------------------------------------

fn read_json(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

fn spawn_background(mut cmd: Command, pid_path: &Path, log_path: &Path) -> Result<()> {
    let log = File::create(log_path).with_context(|| format!("Failed to open log {}", log_path.display()))?;
    let log_err = log.try_clone()?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    let mut child = cmd.spawn()?;
    fs::write(pid_path, child.id().to_string())
        .with_context(|| format!("Failed to write {}", pid_path.display()))?;
    // Reap the child so a stopped node does not linger as a zombie while we run.
    std::thread::spawn(move || {
        let _ = child.wait();
    });
    Ok(())
}

fn pid_alive(pid_path: &Path) -> bool {
    match fs::read_to_string(pid_path).ok().as_deref().and_then(parse_pid) {
        Some(pid) => signal(pid, "-0"),
        None => false,
    }
}

fn signal(pid: u32, sig: &str) -> bool {
    Command::new("kill")
        .args([sig, &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// SIGTERM, then SIGKILL after the grace period. False if no live process was recorded.
async fn stop_pid(pid_path: &Path) -> Result<bool> {
    let Some(pid) = fs::read_to_string(pid_path).ok().as_deref().and_then(parse_pid) else {
        return Ok(false);
    };
    let alive = signal(pid, "-0");
    if alive {
        signal(pid, "-TERM");
        for _ in 0..STOP_GRACE_SECS * 10 {
            if !signal(pid, "-0") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if signal(pid, "-0") {
            signal(pid, "-KILL");
        }
    }
    fs::remove_file(pid_path).with_context(|| format!("Failed to remove {}", pid_path.display()))?;
    Ok(alive)
}
