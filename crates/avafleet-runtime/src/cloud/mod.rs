//! Cloud Provisioning Adapter.
//!
//! One [`CloudProvider`] per (cloud, region), all with the same contract.
//! Providers shell out to the vendor CLI and turn its error text into a
//! tagged [`FleetError`] once, here at the boundary.

pub mod aws;
pub mod gcp;
pub mod pool;

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use avafleet_core::error::FleetError;
use avafleet_core::node::{CloudService, NodeConfig, NodeRole};

use crate::gateway::{CommandOutput, run_with_timeout};

/// Upper bound for one vendor CLI call.
pub const CLI_TIMEOUT: Duration = Duration::from_secs(300);

/// What to provision in one region.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub cluster: String,
    pub count: usize,
    pub instance_type: String,
    pub image: String,
    pub key_pair: String,
    /// Local path of the private half of `key_pair`.
    pub key_path: String,
    /// AWS security group ID, or GCP network name.
    pub security_group: String,
    pub use_static_ip: bool,
    pub role: NodeRole,
}

impl InstanceSpec {
    /// Node record for an instance created from this spec.
    pub fn node_config(&self, provider: &dyn CloudProvider, created: &CreatedInstance) -> NodeConfig {
        NodeConfig {
            node_id: created.instance_id.clone(),
            cloud_service: provider.service(),
            region: provider.region().to_string(),
            instance_id: created.instance_id.clone(),
            elastic_ip: created.public_ip.clone(),
            security_group: self.security_group.clone(),
            role: self.role,
            key_pair: self.key_pair.clone(),
            cert_path: self.key_path.clone(),
            use_static_ip: created.static_ip,
            http_port: None,
        }
    }
}

/// An instance that reached the running state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInstance {
    pub instance_id: String,
    pub public_ip: Option<String>,
    /// `public_ip` is an allocated address that must be released.
    pub static_ip: bool,
}

/// Ingress rule granting one CIDR access to a set of TCP ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallRule {
    /// AWS security group ID, or GCP network name.
    pub group: String,
    /// Rule name where the provider names rules (GCP).
    pub name: String,
    pub cidr: String,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    Added(Vec<u16>),
    AlreadyPresent,
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn service(&self) -> CloudService;

    fn region(&self) -> &str;

    /// Start one instance; returns its ID without waiting for it.
    async fn launch_instance(&self, spec: &InstanceSpec, index: usize) -> Result<String>;

    async fn wait_running(&self, instance_id: &str) -> Result<CreatedInstance>;

    /// Allocate a static address, attach it, and return it.
    async fn allocate_static_ip(&self, instance_id: &str) -> Result<String>;

    /// Fails with `NodeNotRunning` when the instance is already gone.
    async fn destroy_instance(&self, node: &NodeConfig) -> Result<()>;

    /// Fails with `NodeNotRunning` when the instance is already stopped.
    async fn stop_instance(&self, node: &NodeConfig) -> Result<()>;

    async fn release_static_ip(&self, node: &NodeConfig) -> Result<()>;

    async fn ensure_firewall_rule(&self, rule: &FirewallRule) -> Result<RuleOutcome>;

    /// Remove every rule in `group` that grants `ip`. Missing rules are not an error.
    async fn revoke_ip(&self, group: &str, ip: &str) -> Result<()>;
}

/// Provision `spec.count` instances, destroying the ones already created if any fails.
///
/// Cleanup is best effort: its failures are appended to the original error,
/// never substituted for it.
pub async fn create_instances(
    provider: &dyn CloudProvider,
    spec: &InstanceSpec,
) -> Result<Vec<CreatedInstance>> {
    let mut created = Vec::with_capacity(spec.count);
    match provision_all(provider, spec, &mut created).await {
        Ok(()) => Ok(created),
        Err(original) => {
            warn!(
                region = provider.region(),
                created = created.len(),
                error = %original,
                "Provisioning failed, cleaning up created instances"
            );
            let cleanup_errors = cleanup(provider, spec, &created).await;
            Err(FleetError::ProvisioningPartialFailure {
                original: format!("{:#}", original),
                cleanup_errors,
            }
            .into())
        }
    }
}

async fn provision_all(
    provider: &dyn CloudProvider,
    spec: &InstanceSpec,
    created: &mut Vec<CreatedInstance>,
) -> Result<()> {
    let mut launched = Vec::with_capacity(spec.count);
    for index in 0..spec.count {
        let id = provider.launch_instance(spec, index).await?;
        info!(region = provider.region(), instance_id = %id, "Launched instance");
        created.push(CreatedInstance {
            instance_id: id.clone(),
            public_ip: None,
            static_ip: false,
        });
        launched.push(id);
    }
    for (slot, id) in launched.iter().enumerate() {
        let running = provider.wait_running(id).await?;
        created[slot] = running;
        if spec.use_static_ip {
            let ip = provider.allocate_static_ip(id).await?;
            created[slot].public_ip = Some(ip);
            created[slot].static_ip = true;
        }
    }
    Ok(())
}

async fn cleanup(
    provider: &dyn CloudProvider,
    spec: &InstanceSpec,
    created: &[CreatedInstance],
) -> Vec<String> {
    let mut errors = Vec::new();
    for instance in created {
        let node = spec.node_config(provider, instance);
        if instance.static_ip
            && let Err(e) = provider.release_static_ip(&node).await
        {
            errors.push(format!("release IP of {}: {:#}", instance.instance_id, e));
        }
        match provider.destroy_instance(&node).await {
            Ok(()) => {}
            Err(e) if FleetError::is_already_in_target_state(&e) => {}
            Err(e) => errors.push(format!("destroy {}: {:#}", instance.instance_id, e)),
        }
    }
    errors
}

/// Run a vendor CLI, capturing its output.
pub(crate) async fn run_cli(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
) -> Result<CommandOutput> {
    which::which(program)
        .with_context(|| format!("{} CLI is not installed or not on PATH", program))?;
    let mut cmd = Command::new(program);
    cmd.args(args);
    for (k, v) in envs {
        cmd.env(k, v);
    }
    debug!(program, args = %args.join(" "), "Running cloud CLI");
    run_with_timeout(&mut cmd, CLI_TIMEOUT)
        .await
        .with_context(|| format!("Failed to run {} {}", program, args.join(" ")))
}

/// Parse CLI stdout as JSON. Empty output is `null`.
pub(crate) fn parse_json(program: &str, stdout: &str) -> Result<serde_json::Value> {
    if stdout.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(stdout).with_context(|| format!("Unexpected {} output: {}", program, stdout))
}
