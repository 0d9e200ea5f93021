use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use avafleet_core::error::FleetError;
use avafleet_core::naming::host_cidr;
use avafleet_core::node::{CloudService, NodeConfig};

use super::{CloudProvider, CreatedInstance, FirewallRule, InstanceSpec, RuleOutcome, parse_json, run_cli};

const PROGRAM: &str = "aws";

/// EC2 through the `aws` CLI, bound to one profile and region.
pub struct AwsProvider {
    profile: String,
    region: String,
    program: String,
}

impl AwsProvider {
    pub fn new(profile: &str, region: &str) -> Self {
        Self {
            profile: profile.to_string(),
            region: region.to_string(),
            program: PROGRAM.to_string(),
        }
    }

    #[cfg(test)]
    fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    /// Run `aws ec2 <args>`; `target` names the resource for error kinds.
    async fn ec2(&self, target: &str, args: &[&str]) -> Result<Value> {
        let mut full: Vec<String> = vec!["ec2".to_string()];
        full.extend(args.iter().map(|a| a.to_string()));
        full.extend([
            "--profile".to_string(),
            self.profile.clone(),
            "--region".to_string(),
            self.region.clone(),
            "--output".to_string(),
            "json".to_string(),
        ]);
        let out = run_cli(&self.program, &full, &[]).await?;
        if !out.success() {
            return Err(classify_error(&self.profile, target, &out.stderr));
        }
        parse_json(PROGRAM, &out.stdout)
    }

    async fn instance_state(&self, instance_id: &str) -> Result<String> {
        let value = self
            .ec2(instance_id, &["describe-instances", "--instance-ids", instance_id])
            .await?;
        first_instance(&value)
            .and_then(|i| i.pointer("/State/Name"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .with_context(|| format!("No state reported for instance {}", instance_id))
    }
}

#[async_trait]
impl CloudProvider for AwsProvider {
    fn service(&self) -> CloudService {
        CloudService::Aws
    }

    fn region(&self) -> &str {
        &self.region
    }

    async fn launch_instance(&self, spec: &InstanceSpec, index: usize) -> Result<String> {
        let tags = format!(
            "ResourceType=instance,Tags=[{{Key=Name,Value={}-{}-{}}},{{Key=Cluster,Value={}}}]",
            spec.cluster, spec.role, index, spec.cluster
        );
        let value = self
            .ec2(
                &spec.cluster,
                &[
                    "run-instances",
                    "--image-id",
                    &spec.image,
                    "--instance-type",
                    &spec.instance_type,
                    "--key-name",
                    &spec.key_pair,
                    "--security-group-ids",
                    &spec.security_group,
                    "--count",
                    "1",
                    "--tag-specifications",
                    &tags,
                ],
            )
            .await?;
        value
            .pointer("/Instances/0/InstanceId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .with_context(|| "run-instances returned no instance ID")
    }

    async fn wait_running(&self, instance_id: &str) -> Result<CreatedInstance> {
        self.ec2(instance_id, &["wait", "instance-running", "--instance-ids", instance_id])
            .await?;
        let value = self
            .ec2(instance_id, &["describe-instances", "--instance-ids", instance_id])
            .await?;
        let public_ip = first_instance(&value)
            .and_then(|i| i.get("PublicIpAddress"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(CreatedInstance {
            instance_id: instance_id.to_string(),
            public_ip,
            static_ip: false,
        })
    }

    async fn allocate_static_ip(&self, instance_id: &str) -> Result<String> {
        let value = self
            .ec2(instance_id, &["allocate-address", "--domain", "vpc"])
            .await?;
        let allocation = value
            .get("AllocationId")
            .and_then(Value::as_str)
            .with_context(|| "allocate-address returned no allocation ID")?;
        let ip = value
            .get("PublicIp")
            .and_then(Value::as_str)
            .with_context(|| "allocate-address returned no public IP")?
            .to_string();
        let associated = self
            .ec2(
                instance_id,
                &[
                    "associate-address",
                    "--instance-id",
                    instance_id,
                    "--allocation-id",
                    allocation,
                ],
            )
            .await;
        if let Err(e) = associated {
            return Err(match self
                .ec2(instance_id, &["release-address", "--allocation-id", allocation])
                .await
            {
                Ok(_) => {
                    debug!(instance_id, allocation, "Released unassociated elastic IP");
                    e
                }
                Err(release) => {
                    warn!(instance_id, allocation, error = %format!("{:#}", release), "Failed to release elastic IP");
                    e.context(format!(
                        "elastic IP {} ({}) is still allocated: {:#}",
                        ip, allocation, release
                    ))
                }
            });
        }
        info!(instance_id, ip = %ip, "Associated elastic IP");
        Ok(ip)
    }

    #[instrument(skip_all, fields(instance_id = %node.instance_id, region = %self.region))]
    async fn destroy_instance(&self, node: &NodeConfig) -> Result<()> {
        let state = self.instance_state(&node.instance_id).await?;
        if matches!(state.as_str(), "terminated" | "shutting-down") {
            return Err(not_running(&node.node_id));
        }
        self.ec2(
            &node.node_id,
            &["terminate-instances", "--instance-ids", &node.instance_id],
        )
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(instance_id = %node.instance_id, region = %self.region))]
    async fn stop_instance(&self, node: &NodeConfig) -> Result<()> {
        let state = self.instance_state(&node.instance_id).await?;
        if matches!(state.as_str(), "stopped" | "stopping" | "terminated" | "shutting-down") {
            return Err(not_running(&node.node_id));
        }
        self.ec2(&node.node_id, &["stop-instances", "--instance-ids", &node.instance_id])
            .await?;
        Ok(())
    }

    async fn release_static_ip(&self, node: &NodeConfig) -> Result<()> {
        let Some(ip) = node.public_ip() else {
            return Ok(());
        };
        let value = self
            .ec2(&node.node_id, &["describe-addresses", "--public-ips", ip])
            .await?;
        let Some(address) = value.pointer("/Addresses/0") else {
            debug!(ip, "Elastic IP already released");
            return Ok(());
        };
        if let Some(association) = address.get("AssociationId").and_then(Value::as_str) {
            self.ec2(
                &node.node_id,
                &["disassociate-address", "--association-id", association],
            )
            .await?;
        }
        let allocation = address
            .get("AllocationId")
            .and_then(Value::as_str)
            .with_context(|| format!("Elastic IP {} has no allocation ID", ip))?;
        self.ec2(&node.node_id, &["release-address", "--allocation-id", allocation])
            .await?;
        info!(node_id = %node.node_id, ip, "Released elastic IP");
        Ok(())
    }

    async fn ensure_firewall_rule(&self, rule: &FirewallRule) -> Result<RuleOutcome> {
        let group = self
            .ec2(&rule.group, &["describe-security-groups", "--group-ids", &rule.group])
            .await?;
        let missing = missing_ports(&group, &rule.cidr, &rule.ports);
        if missing.is_empty() {
            return Ok(RuleOutcome::AlreadyPresent);
        }
        let mut added = Vec::new();
        for port in missing {
            let port_s = port.to_string();
            let result = self
                .ec2(
                    &rule.group,
                    &[
                        "authorize-security-group-ingress",
                        "--group-id",
                        &rule.group,
                        "--protocol",
                        "tcp",
                        "--port",
                        &port_s,
                        "--cidr",
                        &rule.cidr,
                    ],
                )
                .await;
            match result {
                Ok(_) => added.push(port),
                Err(e) if matches!(FleetError::of(&e), Some(FleetError::ResourceExists(_))) => {
                    debug!(group = %rule.group, port, "Ingress rule already present");
                }
                Err(e) => return Err(e),
            }
        }
        if added.is_empty() {
            Ok(RuleOutcome::AlreadyPresent)
        } else {
            Ok(RuleOutcome::Added(added))
        }
    }

    async fn revoke_ip(&self, group: &str, ip: &str) -> Result<()> {
        let cidr = host_cidr(ip);
        let value = self
            .ec2(group, &["describe-security-groups", "--group-ids", group])
            .await?;
        for (from, to) in granted_ranges(&value, &cidr) {
            let range = if from == to {
                from.to_string()
            } else {
                format!("{}-{}", from, to)
            };
            let result = self
                .ec2(
                    group,
                    &[
                        "revoke-security-group-ingress",
                        "--group-id",
                        group,
                        "--protocol",
                        "tcp",
                        "--port",
                        &range,
                        "--cidr",
                        &cidr,
                    ],
                )
                .await;
            match result {
                Ok(_) => info!(group, cidr = %cidr, ports = %range, "Revoked ingress rule"),
                Err(e) if matches!(FleetError::of(&e), Some(FleetError::RuleNotFound(_))) => {
                    debug!(group, cidr = %cidr, ports = %range, "Ingress rule already revoked");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn not_running(node_id: &str) -> anyhow::Error {
    FleetError::NodeNotRunning {
        node_id: node_id.to_string(),
    }
    .into()
}

fn first_instance(value: &Value) -> Option<&Value> {
    value.pointer("/Reservations/0/Instances/0")
}

/// The bracketed error code in `An error occurred (Code) when calling ...`.
pub fn error_code(stderr: &str) -> Option<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"An error occurred \(([A-Za-z.]+)\)").expect("invalid aws error pattern")
    });
    re.captures(stderr).map(|c| c[1].to_string())
}

/// Map `aws` CLI stderr to an error kind.
pub fn classify_error(profile: &str, target: &str, stderr: &str) -> anyhow::Error {
    let code = error_code(stderr);
    match code.as_deref() {
        Some("ExpiredToken" | "RequestExpired" | "ExpiredTokenException") => {
            FleetError::ExpiredCredentials {
                profile: profile.to_string(),
            }
            .into()
        }
        Some("InvalidInstanceID.NotFound") => not_running(target),
        Some("InvalidPermission.Duplicate") => FleetError::ResourceExists(target.to_string()).into(),
        Some("InvalidPermission.NotFound") => FleetError::RuleNotFound(target.to_string()).into(),
        Some("Throttling" | "RequestLimitExceeded") => FleetError::TransientRemote {
            target: target.to_string(),
            reason: stderr.trim().to_string(),
        }
        .into(),
        _ => anyhow::anyhow!("aws request for {} failed: {}", target, stderr.trim()),
    }
}

/// Port ranges in a `describe-security-groups` result that admit `cidr`.
pub fn granted_ranges(groups: &Value, cidr: &str) -> Vec<(u16, u16)> {
    let Some(perms) = groups
        .pointer("/SecurityGroups/0/IpPermissions")
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };
    perms
        .iter()
        .filter(|p| {
            p.get("IpRanges")
                .and_then(Value::as_array)
                .is_some_and(|ranges| {
                    ranges
                        .iter()
                        .any(|r| r.get("CidrIp").and_then(Value::as_str) == Some(cidr))
                })
        })
        .filter_map(|p| {
            let from = p.get("FromPort")?.as_u64()?;
            let to = p.get("ToPort")?.as_u64()?;
            Some((u16::try_from(from).ok()?, u16::try_from(to).ok()?))
        })
        .collect()
}

/// Ports in `ports` not yet open to `cidr`.
pub fn missing_ports(groups: &Value, cidr: &str, ports: &[u16]) -> Vec<u16> {
    let granted = granted_ranges(groups, cidr);
    ports
        .iter()
        .copied()
        .filter(|p| !granted.iter().any(|(from, to)| from <= p && p <= to))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_code() {
        let stderr = "\nAn error occurred (InvalidInstanceID.NotFound) when calling the \
                      TerminateInstances operation: The instance ID 'i-1' does not exist\n";
        assert_eq!(error_code(stderr).as_deref(), Some("InvalidInstanceID.NotFound"));
        assert_eq!(error_code("could not connect"), None);
    }

    #[test]
    fn test_classify_error_kinds() {
        let expired = classify_error(
            "ops",
            "i-1",
            "An error occurred (ExpiredToken) when calling the DescribeInstances operation",
        );
        assert!(FleetError::is_expired_credentials(&expired));

        let gone = classify_error(
            "ops",
            "i-1",
            "An error occurred (InvalidInstanceID.NotFound) when calling the StopInstances operation",
        );
        assert!(FleetError::is_already_in_target_state(&gone));

        let throttled = classify_error("ops", "i-1", "An error occurred (Throttling) when ...");
        assert!(FleetError::is_retryable(&throttled));

        let duplicate = classify_error(
            "ops",
            "sg-1",
            "An error occurred (InvalidPermission.Duplicate) when calling the \
             AuthorizeSecurityGroupIngress operation: the specified rule already exists",
        );
        assert_eq!(
            FleetError::of(&duplicate),
            Some(&FleetError::ResourceExists("sg-1".to_string()))
        );

        let revoked = classify_error(
            "ops",
            "sg-1",
            "An error occurred (InvalidPermission.NotFound) when calling the \
             RevokeSecurityGroupIngress operation",
        );
        assert_eq!(
            FleetError::of(&revoked),
            Some(&FleetError::RuleNotFound("sg-1".to_string()))
        );
        assert!(!FleetError::is_already_in_target_state(&revoked));

        let other = classify_error("ops", "i-1", "An error occurred (UnauthorizedOperation) ...");
        assert!(FleetError::of(&other).is_none());
        assert!(format!("{}", other).contains("UnauthorizedOperation"));
    }

    fn group() -> Value {
        json!({
            "SecurityGroups": [{
                "GroupId": "sg-1",
                "IpPermissions": [
                    {"IpProtocol": "tcp", "FromPort": 22, "ToPort": 22,
                     "IpRanges": [{"CidrIp": "1.2.3.4/32"}, {"CidrIp": "5.6.7.8/32"}]},
                    {"IpProtocol": "tcp", "FromPort": 9650, "ToPort": 9651,
                     "IpRanges": [{"CidrIp": "5.6.7.8/32"}]}
                ]
            }]
        })
    }

    #[test]
    fn test_missing_ports_skips_granted() {
        assert_eq!(missing_ports(&group(), "1.2.3.4/32", &[22, 9650, 3000]), vec![9650, 3000]);
        assert_eq!(missing_ports(&group(), "5.6.7.8/32", &[22, 9650]), Vec::<u16>::new());
        assert_eq!(missing_ports(&group(), "9.9.9.9/32", &[22]), vec![22]);
    }

    #[test]
    fn test_granted_ranges() {
        assert_eq!(granted_ranges(&group(), "5.6.7.8/32"), vec![(22, 22), (9650, 9651)]);
        assert!(granted_ranges(&json!({}), "5.6.7.8/32").is_empty());
    }

    /// Stand-in `aws` binary that logs each call and fails on `fail_on`.
    fn fake_aws(dir: &std::path::Path, fail_on: &[&str]) -> String {
        use std::os::unix::fs::PermissionsExt;
        let log = dir.join("calls.log");
        let mut script = format!("#!/bin/sh\necho \"$@\" >> '{}'\ncase \"$2\" in\n", log.display());
        for action in fail_on {
            script.push_str(&format!(
                "  {}) echo 'An error occurred (UnauthorizedOperation) when calling the {} operation' >&2; exit 254 ;;\n",
                action, action
            ));
        }
        script.push_str(
            "  allocate-address) echo '{\"AllocationId\":\"eipalloc-1\",\"PublicIp\":\"3.3.3.3\"}' ;;\nesac\n",
        );
        let path = dir.join("aws");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn calls(dir: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls.log"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_failed_association_releases_elastic_ip() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_aws(dir.path(), &["associate-address"]);
        let aws = AwsProvider::new("ops", "us-east-1").with_program(&program);

        let err = aws.allocate_static_ip("i-1").await.unwrap_err();
        assert!(format!("{:#}", err).contains("UnauthorizedOperation"));

        let calls = calls(dir.path());
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("ec2 allocate-address"));
        assert!(calls[1].starts_with("ec2 associate-address --instance-id i-1 --allocation-id eipalloc-1"));
        assert!(calls[2].starts_with("ec2 release-address --allocation-id eipalloc-1"));
    }

    #[tokio::test]
    async fn test_unreleased_elastic_ip_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_aws(dir.path(), &["associate-address", "release-address"]);
        let aws = AwsProvider::new("ops", "us-east-1").with_program(&program);

        let err = aws.allocate_static_ip("i-1").await.unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("3.3.3.3 (eipalloc-1) is still allocated"));
        assert!(message.contains("when calling the associate-address operation"));
    }

    #[tokio::test]
    async fn test_associated_elastic_ip_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_aws(dir.path(), &[]);
        let aws = AwsProvider::new("ops", "us-east-1").with_program(&program);

        assert_eq!(aws.allocate_static_ip("i-1").await.unwrap(), "3.3.3.3");
        assert!(!calls(dir.path()).iter().any(|c| c.starts_with("ec2 release-address")));
    }
}
