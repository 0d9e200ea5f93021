use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::retry::PollPolicy;

pub const HOME_ENV: &str = "AVAFLEET_HOME";
pub const CLUSTERS_FILE: &str = "clusters.json";
pub const SETTINGS_FILE: &str = "settings.toml";
pub const NODE_CONFIG_FILE: &str = "node_cloud_config.json";
pub const STAKER_KEY_FILE: &str = "staker.key";
pub const STAKER_CERT_FILE: &str = "staker.crt";
pub const SIGNER_KEY_FILE: &str = "signer.key";
pub const INVENTORY_FILE: &str = "hosts";

/// Ports opened for a whitelisted IP: SSH, node API, Grafana.
pub const WHITELIST_PORTS: [u16; 3] = [22, 9650, 3000];

/// Filesystem layout of the local state root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetPaths {
    root: PathBuf,
}

impl FleetPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$AVAFLEET_HOME`, else `~/.avafleet`.
    pub fn from_env() -> Result<Self> {
        if let Ok(root) = std::env::var(HOME_ENV)
            && !root.is_empty()
        {
            return Ok(Self::new(root));
        }
        let home = std::env::var("HOME").with_context(|| {
            format!("Neither {} nor HOME is set; cannot locate state directory", HOME_ENV)
        })?;
        Ok(Self::new(Path::new(&home).join(".avafleet")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn clusters_file(&self) -> PathBuf {
        self.root.join(CLUSTERS_FILE)
    }

    pub fn settings_file(&self) -> PathBuf {
        self.root.join(SETTINGS_FILE)
    }

    pub fn nodes_dir(&self) -> PathBuf {
        self.root.join("nodes")
    }

    pub fn node_dir(&self, node_id: &str) -> PathBuf {
        self.nodes_dir().join(node_id)
    }

    pub fn node_config_file(&self, node_id: &str) -> PathBuf {
        self.node_dir(node_id).join(NODE_CONFIG_FILE)
    }

    pub fn inventory_dir(&self, cluster: &str) -> PathBuf {
        self.root.join("inventories").join(cluster)
    }

    pub fn inventory_file(&self, cluster: &str) -> PathBuf {
        self.inventory_dir(cluster).join(INVENTORY_FILE)
    }

    /// Staging area on the same filesystem as `nodes/`, so renames are atomic.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(".staging")
    }

    /// Process data of one local cluster.
    pub fn local_cluster_dir(&self, cluster: &str) -> PathBuf {
        self.root.join("local").join(cluster)
    }

    /// Working directory of a local node process.
    pub fn local_data_dir(&self, cluster: &str, node_id: &str) -> PathBuf {
        self.local_cluster_dir(cluster).join(node_id)
    }
}

/// Operator settings loaded from settings.toml. Every key has a default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub aws: AwsSettings,
    #[serde(default)]
    pub gcp: GcpSettings,
    #[serde(default)]
    pub chain: ChainSettings,
    #[serde(default)]
    pub polling: PollingSettings,
    #[serde(default)]
    pub local: LocalSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// Fallback key when a node has no cert path of its own.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AwsSettings {
    #[serde(default = "default_aws_profile")]
    pub profile: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GcpSettings {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub credentials_file: String,
    /// Prefix of the shared VPC network and its firewall rules.
    #[serde(default)]
    pub network_prefix: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainSettings {
    /// External program that signs and issues P-Chain transactions.
    #[serde(default = "default_signer_command")]
    pub signer_command: String,
    #[serde(default = "default_aggregator_url")]
    pub aggregator_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingSettings {
    #[serde(default = "default_primary_timeout")]
    pub primary_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_visibility_attempts")]
    pub visibility_attempts: u32,
    #[serde(default = "default_visibility_backoff")]
    pub visibility_backoff_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalSettings {
    #[serde(default = "default_avalanchego_path")]
    pub avalanchego_path: String,
    #[serde(default = "default_base_http_port")]
    pub base_http_port: u16,
}

fn default_ssh_user() -> String {
    crate::node::DEFAULT_SSH_USER.to_string()
}
fn default_connect_retries() -> u32 {
    5
}
fn default_connect_timeout() -> u64 {
    3
}
fn default_aws_profile() -> String {
    "default".to_string()
}
fn default_signer_command() -> String {
    "avafleet-signer".to_string()
}
fn default_aggregator_url() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_primary_timeout() -> u64 {
    300
}
fn default_poll_interval() -> u64 {
    1
}
fn default_visibility_attempts() -> u32 {
    5
}
fn default_visibility_backoff() -> u64 {
    2
}
fn default_avalanchego_path() -> String {
    "avalanchego".to_string()
}
fn default_base_http_port() -> u16 {
    crate::node::DEFAULT_API_PORT
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            private_key: None,
            connect_retries: default_connect_retries(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for AwsSettings {
    fn default() -> Self {
        Self {
            profile: default_aws_profile(),
        }
    }
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            signer_command: default_signer_command(),
            aggregator_url: default_aggregator_url(),
        }
    }
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            primary_timeout_secs: default_primary_timeout(),
            poll_interval_secs: default_poll_interval(),
            visibility_attempts: default_visibility_attempts(),
            visibility_backoff_secs: default_visibility_backoff(),
        }
    }
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            avalanchego_path: default_avalanchego_path(),
            base_http_port: default_base_http_port(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file. A missing file yields defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse settings from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        let settings: Self = toml::from_str(s).with_context(|| "Failed to parse settings TOML")?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.ssh.connect_retries == 0 {
            anyhow::bail!("[ssh] connect_retries must be at least 1");
        }
        if self.polling.primary_timeout_secs == 0 || self.polling.poll_interval_secs == 0 {
            anyhow::bail!("[polling] timeouts and intervals must be non-zero");
        }
        if self.polling.visibility_attempts == 0 {
            anyhow::bail!("[polling] visibility_attempts must be at least 1");
        }
        if self.local.base_http_port == 0 {
            anyhow::bail!("[local] base_http_port must be non-zero");
        }
        Ok(())
    }

    /// Primary Network visibility wait.
    pub fn primary_poll(&self) -> PollPolicy {
        PollPolicy::new(
            Duration::from_secs(self.polling.primary_timeout_secs),
            Duration::from_secs(self.polling.poll_interval_secs),
        )
    }
}

/// Confirmation switches for destructive or credential-touching commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Authorization {
    /// Use cloud credentials without prompting.
    pub access: bool,
    /// Remove local node records without prompting.
    pub remove: bool,
}

impl Authorization {
    pub fn all() -> Self {
        Self {
            access: true,
            remove: true,
        }
    }
}

/// Everything one command invocation needs, resolved once from flags and settings.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    pub authorize: Authorization,
    pub force: bool,
    pub aws_profile: String,
    pub ssh_user: String,
    pub ssh_private_key: Option<String>,
    pub ssh_connect_retries: u32,
    pub ssh_connect_timeout: Duration,
    pub primary_poll: PollPolicy,
    pub visibility_attempts: u32,
    pub visibility_backoff: Duration,
    pub gcp_project: String,
    pub gcp_credentials_file: String,
    pub gcp_network_prefix: String,
}

impl CommandOptions {
    /// Defaults taken from settings; flags are layered on by the caller.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            authorize: Authorization::default(),
            force: false,
            aws_profile: settings.aws.profile.clone(),
            ssh_user: settings.ssh.user.clone(),
            ssh_private_key: settings.ssh.private_key.clone(),
            ssh_connect_retries: settings.ssh.connect_retries,
            ssh_connect_timeout: Duration::from_secs(settings.ssh.connect_timeout_secs),
            primary_poll: settings.primary_poll(),
            visibility_attempts: settings.polling.visibility_attempts,
            visibility_backoff: Duration::from_secs(settings.polling.visibility_backoff_secs),
            gcp_project: settings.gcp.project.clone(),
            gcp_credentials_file: settings.gcp.credentials_file.clone(),
            gcp_network_prefix: settings
                .gcp
                .network_prefix
                .clone()
                .unwrap_or_else(|| "avafleet".to_string()),
        }
    }
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}
