use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

pub const MAINNET_ID: u32 = 1;
pub const FUJI_ID: u32 = 5;
pub const LOCAL_ID: u32 = 1337;

pub const MAINNET_ENDPOINT: &str = "https://api.avax.network";
pub const FUJI_ENDPOINT: &str = "https://api.avax-test.network";
pub const LOCAL_ENDPOINT: &str = "http://127.0.0.1:9650";

/// Which Avalanche network a cluster belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkKind {
    Mainnet,
    Fuji,
    Devnet,
    Local,
}

impl std::fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Fuji => write!(f, "fuji"),
            Self::Devnet => write!(f, "devnet"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Staking parameters taken from the network's genesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StakingParams {
    /// Minimum validator stake in nAVAX.
    pub min_validator_stake: u64,
    /// Stake duration used when the operator gives none.
    pub default_stake_duration: Duration,
    /// Minimum delegation fee in parts per million.
    pub min_delegation_fee: u32,
    /// How far in the future a validation period starts.
    pub start_lead_time: Duration,
}

impl NetworkKind {
    pub fn staking_params(self) -> StakingParams {
        const HOUR: u64 = 60 * 60;
        match self {
            Self::Mainnet => StakingParams {
                min_validator_stake: 2_000_000_000_000,
                default_stake_duration: Duration::from_secs(336 * HOUR),
                min_delegation_fee: 20_000,
                start_lead_time: Duration::from_secs(30),
            },
            Self::Fuji => StakingParams {
                min_validator_stake: 1_000_000_000,
                default_stake_duration: Duration::from_secs(24 * HOUR),
                min_delegation_fee: 20_000,
                start_lead_time: Duration::from_secs(30),
            },
            Self::Devnet | Self::Local => StakingParams {
                min_validator_stake: 1,
                default_stake_duration: Duration::from_secs(24 * HOUR),
                min_delegation_fee: 20_000,
                start_lead_time: Duration::from_secs(20),
            },
        }
    }
}

/// A bootstrap peer of a devnet: node ID plus `ip:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPeer {
    #[serde(rename = "nodeID")]
    pub node_id: String,
    pub endpoint: String,
}

/// Genesis and upgrade payloads of a devnet, fixed once the devnet exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevnetPayload {
    #[serde(with = "b64")]
    genesis: Vec<u8>,
    #[serde(with = "b64", default)]
    upgrade: Vec<u8>,
    #[serde(default)]
    bootstrappers: Vec<BootstrapPeer>,
}

impl DevnetPayload {
    pub fn new(genesis: Vec<u8>, upgrade: Vec<u8>, bootstrappers: Vec<BootstrapPeer>) -> Self {
        Self {
            genesis,
            upgrade,
            bootstrappers,
        }
    }

    pub fn genesis(&self) -> &[u8] {
        &self.genesis
    }

    pub fn upgrade(&self) -> &[u8] {
        &self.upgrade
    }

    pub fn bootstrappers(&self) -> &[BootstrapPeer] {
        &self.bootstrappers
    }
}

/// Immutable identity of the network a cluster runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkIdentity {
    kind: NetworkKind,
    id: u32,
    endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cluster_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    devnet: Option<DevnetPayload>,
}

impl NetworkIdentity {
    pub fn mainnet() -> Self {
        Self::new(NetworkKind::Mainnet, MAINNET_ID, MAINNET_ENDPOINT)
    }

    pub fn fuji() -> Self {
        Self::new(NetworkKind::Fuji, FUJI_ID, FUJI_ENDPOINT)
    }

    pub fn local() -> Self {
        Self::new(NetworkKind::Local, LOCAL_ID, LOCAL_ENDPOINT)
    }

    pub fn devnet(id: u32, endpoint: &str, payload: DevnetPayload) -> Self {
        Self {
            devnet: Some(payload),
            ..Self::new(NetworkKind::Devnet, id, endpoint)
        }
    }

    fn new(kind: NetworkKind, id: u32, endpoint: &str) -> Self {
        Self {
            kind,
            id,
            endpoint: endpoint.to_string(),
            cluster_name: None,
            devnet: None,
        }
    }

    /// Parse a `--network` argument: mainnet, fuji, local.
    pub fn from_name(name: &str) -> anyhow::Result<Self> {
        match name.to_lowercase().as_str() {
            "mainnet" => Ok(Self::mainnet()),
            "fuji" | "testnet" => Ok(Self::fuji()),
            "local" => Ok(Self::local()),
            other => anyhow::bail!("Unknown network {:?}: expected mainnet, fuji, or local", other),
        }
    }

    /// Bind this identity to the cluster that owns the nodes.
    pub fn for_cluster(mut self, cluster: &str) -> Self {
        self.cluster_name = Some(cluster.to_string());
        self
    }

    /// Same network, detached from any cluster.
    pub fn detached(&self) -> Self {
        Self {
            cluster_name: None,
            ..self.clone()
        }
    }

    pub fn kind(&self) -> NetworkKind {
        self.kind
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn cluster_name(&self) -> Option<&str> {
        self.cluster_name.as_deref()
    }

    pub fn devnet_payload(&self) -> Option<&DevnetPayload> {
        self.devnet.as_ref()
    }

    pub fn staking_params(&self) -> StakingParams {
        self.kind.staking_params()
    }

    pub fn name(&self) -> String {
        match self.kind {
            NetworkKind::Devnet => format!("devnet-{}", self.id),
            _ => self.kind.to_string(),
        }
    }
}

mod b64 {
    use super::{Engine, STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_networks() {
        assert_eq!(NetworkIdentity::mainnet().id(), 1);
        assert_eq!(NetworkIdentity::fuji().id(), 5);
        assert_eq!(NetworkIdentity::from_name("Fuji").unwrap().kind(), NetworkKind::Fuji);
        assert!(NetworkIdentity::from_name("moonnet").is_err());
    }

    #[test]
    fn test_devnet_roundtrip_keeps_payload() {
        let payload = DevnetPayload::new(
            b"{\"networkID\":1338}".to_vec(),
            vec![0, 159, 255],
            vec![BootstrapPeer {
                node_id: "NodeID-abc".to_string(),
                endpoint: "10.0.0.1:9651".to_string(),
            }],
        );
        let net = NetworkIdentity::devnet(1338, "http://10.0.0.1:9650", payload).for_cluster("dev1");
        let json = serde_json::to_string(&net).unwrap();
        let parsed: NetworkIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, net);
        assert_eq!(parsed.devnet_payload().unwrap().upgrade(), &[0, 159, 255]);
        assert_eq!(parsed.name(), "devnet-1338");
    }

    #[test]
    fn test_detached_clears_cluster_only() {
        let net = NetworkIdentity::fuji().for_cluster("c1");
        let detached = net.detached();
        assert_eq!(detached.cluster_name(), None);
        assert_eq!(detached.endpoint(), net.endpoint());
    }

    #[test]
    fn test_mainnet_minimum_stake() {
        let params = NetworkKind::Mainnet.staking_params();
        assert_eq!(params.min_validator_stake, 2_000_000_000_000);
        assert_eq!(params.default_stake_duration, Duration::from_secs(336 * 3600));
    }
}
