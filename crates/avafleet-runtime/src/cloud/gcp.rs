use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use avafleet_core::error::FleetError;
use avafleet_core::node::{CloudService, NodeConfig};
use avafleet_core::retry::{PollOutcome, PollPolicy, poll_until};

use super::{CloudProvider, CreatedInstance, FirewallRule, InstanceSpec, RuleOutcome, parse_json, run_cli};

const PROGRAM: &str = "gcloud";
const CREDENTIALS_ENV: &str = "CLOUDSDK_AUTH_CREDENTIAL_FILE_OVERRIDE";
const ACCESS_CONFIG: &str = "external-nat";
const RUNNING_POLL: PollPolicy = PollPolicy {
    timeout: Duration::from_secs(180),
    interval: Duration::from_secs(3),
};

/// Compute Engine through the `gcloud` CLI, bound to one project and zone.
pub struct GcpProvider {
    project: String,
    zone: String,
    credentials_file: String,
    program: String,
}

impl GcpProvider {
    pub fn new(project: &str, zone: &str, credentials_file: &str) -> Self {
        Self {
            project: project.to_string(),
            zone: zone.to_string(),
            credentials_file: credentials_file.to_string(),
            program: PROGRAM.to_string(),
        }
    }

    #[cfg(test)]
    fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    async fn compute(&self, target: &str, args: &[&str]) -> Result<Value> {
        let mut full: Vec<String> = vec!["compute".to_string()];
        full.extend(args.iter().map(|a| a.to_string()));
        full.extend([
            "--project".to_string(),
            self.project.clone(),
            "--format".to_string(),
            "json".to_string(),
        ]);
        let envs = if self.credentials_file.is_empty() {
            Vec::new()
        } else {
            vec![(CREDENTIALS_ENV.to_string(), self.credentials_file.clone())]
        };
        let out = run_cli(&self.program, &full, &envs).await?;
        if !out.success() {
            return Err(classify_error(&self.project, target, &out.stderr));
        }
        parse_json(PROGRAM, &out.stdout)
    }

    /// Point the instance's external access config at a reserved address.
    async fn attach_address(&self, instance_id: &str, address_name: &str, region: &str) -> Result<String> {
        let value = self
            .compute(
                instance_id,
                &["addresses", "describe", address_name, "--region", region],
            )
            .await?;
        let ip = value
            .get("address")
            .and_then(Value::as_str)
            .with_context(|| format!("Address {} has no IP", address_name))?
            .to_string();
        self.compute(
            instance_id,
            &[
                "instances",
                "delete-access-config",
                instance_id,
                "--zone",
                &self.zone,
                "--access-config-name",
                ACCESS_CONFIG,
            ],
        )
        .await?;
        self.compute(
            instance_id,
            &[
                "instances",
                "add-access-config",
                instance_id,
                "--zone",
                &self.zone,
                "--access-config-name",
                ACCESS_CONFIG,
                "--address",
                &ip,
            ],
        )
        .await?;
        Ok(ip)
    }

    async fn describe(&self, name: &str) -> Result<Value> {
        self.compute(name, &["instances", "describe", name, "--zone", &self.zone])
            .await
    }
}

#[async_trait]
impl CloudProvider for GcpProvider {
    fn service(&self) -> CloudService {
        CloudService::Gcp
    }

    fn region(&self) -> &str {
        &self.zone
    }

    async fn launch_instance(&self, spec: &InstanceSpec, index: usize) -> Result<String> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}-{}-{}", spec.cluster, spec.role, index, &suffix[..6]).to_lowercase();
        self.compute(
            &name,
            &[
                "instances",
                "create",
                &name,
                "--zone",
                &self.zone,
                "--machine-type",
                &spec.instance_type,
                "--image",
                &spec.image,
                "--network",
                &spec.security_group,
                "--labels",
                &format!("cluster={}", spec.cluster.to_lowercase()),
            ],
        )
        .await?;
        Ok(name)
    }

    async fn wait_running(&self, instance_id: &str) -> Result<CreatedInstance> {
        let label = format!("instance {} running", instance_id);
        let outcome = poll_until(RUNNING_POLL, &label, || async move {
            let value = self.describe(instance_id).await?;
            Ok(value.get("status").and_then(Value::as_str) == Some("RUNNING"))
        })
        .await?;
        if outcome == PollOutcome::TimedOut {
            anyhow::bail!(
                "Instance {} not running after {}s",
                instance_id,
                RUNNING_POLL.timeout.as_secs()
            );
        }
        let value = self.describe(instance_id).await?;
        Ok(CreatedInstance {
            instance_id: instance_id.to_string(),
            public_ip: nat_ip(&value).map(str::to_string),
            static_ip: false,
        })
    }

    async fn allocate_static_ip(&self, instance_id: &str) -> Result<String> {
        let address_name = format!("{}-ip", instance_id);
        let region = zone_region(&self.zone);
        self.compute(
            instance_id,
            &["addresses", "create", &address_name, "--region", region],
        )
        .await?;
        match self.attach_address(instance_id, &address_name, region).await {
            Ok(ip) => {
                info!(instance_id, ip = %ip, "Attached static IP");
                Ok(ip)
            }
            Err(e) => match self
                .compute(
                    instance_id,
                    &["addresses", "delete", &address_name, "--region", region, "--quiet"],
                )
                .await
            {
                Ok(_) => {
                    debug!(instance_id, address = %address_name, "Released unattached static IP");
                    Err(e)
                }
                Err(release) => {
                    warn!(instance_id, address = %address_name, error = %format!("{:#}", release), "Failed to release static IP");
                    Err(e.context(format!(
                        "address {} is still reserved: {:#}",
                        address_name, release
                    )))
                }
            },
        }
    }

    #[instrument(skip_all, fields(instance_id = %node.instance_id, zone = %self.zone))]
    async fn destroy_instance(&self, node: &NodeConfig) -> Result<()> {
        self.compute(
            &node.node_id,
            &[
                "instances",
                "delete",
                &node.instance_id,
                "--zone",
                &self.zone,
                "--quiet",
            ],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(instance_id = %node.instance_id, zone = %self.zone))]
    async fn stop_instance(&self, node: &NodeConfig) -> Result<()> {
        let value = self.describe(&node.instance_id).await.map_err(|e| {
            if FleetError::is_already_in_target_state(&e) {
                not_running(&node.node_id)
            } else {
                e
            }
        })?;
        if matches!(
            value.get("status").and_then(Value::as_str),
            Some("TERMINATED" | "STOPPING" | "STOPPED" | "SUSPENDED")
        ) {
            return Err(not_running(&node.node_id));
        }
        self.compute(
            &node.node_id,
            &["instances", "stop", &node.instance_id, "--zone", &self.zone],
        )
        .await?;
        Ok(())
    }

    async fn release_static_ip(&self, node: &NodeConfig) -> Result<()> {
        let Some(ip) = node.public_ip() else {
            return Ok(());
        };
        let filter = format!("address={}", ip);
        let value = self
            .compute(&node.node_id, &["addresses", "list", "--filter", &filter])
            .await?;
        let Some((name, region)) = address_name_region(&value) else {
            debug!(ip, "Static IP already released");
            return Ok(());
        };
        self.compute(
            &node.node_id,
            &["addresses", "delete", &name, "--region", &region, "--quiet"],
        )
        .await?;
        info!(node_id = %node.node_id, ip, "Released static IP");
        Ok(())
    }

    async fn ensure_firewall_rule(&self, rule: &FirewallRule) -> Result<RuleOutcome> {
        let allow = rule
            .ports
            .iter()
            .map(|p| format!("tcp:{}", p))
            .collect::<Vec<_>>()
            .join(",");
        let result = self
            .compute(
                &rule.name,
                &[
                    "firewall-rules",
                    "create",
                    &rule.name,
                    "--network",
                    &rule.group,
                    "--allow",
                    &allow,
                    "--source-ranges",
                    &rule.cidr,
                ],
            )
            .await;
        match result {
            Ok(_) => Ok(RuleOutcome::Added(rule.ports.clone())),
            Err(e) if matches!(FleetError::of(&e), Some(FleetError::ResourceExists(_))) => {
                Ok(RuleOutcome::AlreadyPresent)
            }
            Err(e) => Err(e),
        }
    }

    async fn revoke_ip(&self, group: &str, ip: &str) -> Result<()> {
        let name = format!("{}-{}", group, ip.replace('.', ""));
        match self
            .compute(&name, &["firewall-rules", "delete", &name, "--quiet"])
            .await
        {
            Ok(_) => {
                info!(rule = %name, "Deleted firewall rule");
                Ok(())
            }
            Err(e) if FleetError::is_already_in_target_state(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn not_running(node_id: &str) -> anyhow::Error {
    FleetError::NodeNotRunning {
        node_id: node_id.to_string(),
    }
    .into()
}

/// Map `gcloud` stderr to an error kind. gcloud exposes no stable codes,
/// so this matches its message text.
pub fn classify_error(project: &str, target: &str, stderr: &str) -> anyhow::Error {
    let text = stderr.trim();
    if text.contains("Reauthentication required") || text.contains("invalid_grant") {
        return FleetError::ExpiredCredentials {
            profile: project.to_string(),
        }
        .into();
    }
    if text.contains("was not found") {
        return not_running(target);
    }
    if text.contains("already exists") {
        return FleetError::ResourceExists(target.to_string()).into();
    }
    if text.contains("rateLimitExceeded") {
        return FleetError::TransientRemote {
            target: target.to_string(),
            reason: text.to_string(),
        }
        .into();
    }
    anyhow::anyhow!("gcloud request for {} failed: {}", target, text)
}

/// `us-east1-b` -> `us-east1`.
pub fn zone_region(zone: &str) -> &str {
    match zone.rsplit_once('-') {
        Some((region, suffix)) if suffix.len() == 1 => region,
        _ => zone,
    }
}

fn nat_ip(instance: &Value) -> Option<&str> {
    instance
        .pointer("/networkInterfaces/0/accessConfigs/0/natIP")
        .and_then(Value::as_str)
}

/// Name and region of the first address in an `addresses list` result.
pub fn address_name_region(list: &Value) -> Option<(String, String)> {
    let address = list.as_array()?.first()?;
    let name = address.get("name")?.as_str()?.to_string();
    let region = address
        .get("region")?
        .as_str()?
        .rsplit('/')
        .next()?
        .to_string();
    Some((name, region))
}
