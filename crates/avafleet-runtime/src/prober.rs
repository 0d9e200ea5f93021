use std::sync::Arc;

use anyhow::Result;
use serde_json::{Value, json};
use tracing::debug;

use avafleet_core::error::FleetError;
use avafleet_core::node::Host;
use avafleet_core::validator::SyncStatus;

use crate::gateway::{RemoteExecutor, shell_quote};

/// Versions a node reports through `info.getNodeVersion`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeVersion {
    pub version: String,
    pub platform_vm: String,
    pub rpc_protocol: u32,
}

/// BLS identity a node reports alongside its node ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePop {
    pub public_key: String,
    pub proof_of_possession: String,
}

/// Stateless queries against a node's own JSON-RPC API.
///
/// Calls run on the node's host through the gateway, so they work the same
/// for SSH-reachable and local nodes. Safe to share across concurrent tasks.
#[derive(Clone)]
pub struct Prober {
    executor: Arc<dyn RemoteExecutor>,
}

impl Prober {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }

    pub async fn is_bootstrapped(&self, host: &Host) -> Result<bool> {
        let body = self
            .call(host, "/ext/info", "info.isBootstrapped", json!({"chain": "X"}))
            .await?;
        parse_bootstrapped(&host.node_id, &body)
    }

    pub async fn is_healthy(&self, host: &Host) -> Result<bool> {
        let body = self
            .call(host, "/ext/health", "health.health", json!({"tags": ["P"]}))
            .await?;
        parse_healthy(&host.node_id, &body)
    }

    pub async fn subnet_sync_status(&self, host: &Host, blockchain_id: &str) -> Result<SyncStatus> {
        let body = self
            .call(
                host,
                "/ext/bc/P",
                "platform.getBlockchainStatus",
                json!({"blockchainID": blockchain_id}),
            )
            .await?;
        parse_sync_status(&host.node_id, &body)
    }

    pub async fn node_id(&self, host: &Host) -> Result<String> {
        let body = self
            .call(host, "/ext/info", "info.getNodeID", json!({}))
            .await?;
        parse_node_id(&host.node_id, &body)
    }

    pub async fn node_pop(&self, host: &Host) -> Result<NodePop> {
        let body = self
            .call(host, "/ext/info", "info.getNodeID", json!({}))
            .await?;
        parse_node_pop(&host.node_id, &body)
    }

    pub async fn node_version(&self, host: &Host) -> Result<NodeVersion> {
        let body = self
            .call(host, "/ext/info", "info.getNodeVersion", json!({}))
            .await?;
        parse_node_version(&host.node_id, &body)
    }

    /// Whether the node speaks the RPC protocol version a subnet VM was built for.
    pub async fn rpc_compatible(&self, host: &Host, rpc_version: u32) -> Result<bool> {
        Ok(self.node_version(host).await?.rpc_protocol == rpc_version)
    }

    async fn call(&self, host: &Host, path: &str, method: &str, params: Value) -> Result<String> {
        let script = curl_script(host.api_port, path, method, &params);
        debug!(host = %host.node_id, method, "Probing node");
        let out = self.executor.run(host, &script).await?;
        if !out.success() {
            return Err(FleetError::TransientRemote {
                target: host.node_id.clone(),
                reason: format!("{} exited {}: {}", method, out.code, out.stderr.trim()),
            }
            .into());
        }
        Ok(out.stdout)
    }
}

/// Shell command that posts one JSON-RPC request to the node's local API.
pub fn curl_script(port: u16, path: &str, method: &str, params: &Value) -> String {
    let body = json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params});
    format!(
        "curl -s -X POST --data {} -H 'content-type:application/json;' 127.0.0.1:{}{}",
        shell_quote(&body.to_string()),
        port,
        path
    )
}

fn envelope(node_id: &str, what: &str, body: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(body.trim()).map_err(|_| parse_error(node_id, what))?;
    if let Some(err) = value.get("error") {
        let msg = err.get("message").and_then(Value::as_str).unwrap_or("unknown error");
        anyhow::bail!("node {} returned RPC error for {}: {}", node_id, what, msg);
    }
    Ok(value)
}

fn parse_error(node_id: &str, what: &str) -> anyhow::Error {
    FleetError::StatusParse {
        node_id: node_id.to_string(),
        what: what.to_string(),
    }
    .into()
}

fn result_field<'a>(value: &'a Value, field: &str) -> Option<&'a Value> {
    value.get("result").and_then(|r| r.get(field))
}

/// `{"result": {"isBootstrapped": bool}}`
pub fn parse_bootstrapped(node_id: &str, body: &str) -> Result<bool> {
    let what = "bootstrap status";
    let value = envelope(node_id, what, body)?;
    result_field(&value, "isBootstrapped")
        .and_then(Value::as_bool)
        .ok_or_else(|| parse_error(node_id, what))
}

/// `{"result": {"healthy": bool}}`
pub fn parse_healthy(node_id: &str, body: &str) -> Result<bool> {
    let what = "health status";
    let value = envelope(node_id, what, body)?;
    result_field(&value, "healthy")
        .and_then(Value::as_bool)
        .ok_or_else(|| parse_error(node_id, what))
}

/// `{"result": {"status": "Syncing" | "Validating" | "Bootstrapping"}}`
pub fn parse_sync_status(node_id: &str, body: &str) -> Result<SyncStatus> {
    let what = "subnet sync status";
    let value = envelope(node_id, what, body)?;
    result_field(&value, "status")
        .and_then(Value::as_str)
        .and_then(SyncStatus::parse)
        .ok_or_else(|| parse_error(node_id, what))
}

/// `{"result": {"nodeID": string}}`
pub fn parse_node_id(node_id: &str, body: &str) -> Result<String> {
    let what = "node ID";
    let value = envelope(node_id, what, body)?;
    result_field(&value, "nodeID")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| parse_error(node_id, what))
}

/// `{"result": {"nodePOP": {"publicKey": .., "proofOfPossession": ..}}}`
pub fn parse_node_pop(node_id: &str, body: &str) -> Result<NodePop> {
    let what = "node proof of possession";
    let value = envelope(node_id, what, body)?;
    let pop = result_field(&value, "nodePOP").ok_or_else(|| parse_error(node_id, what))?;
    let field = |name: &str| {
        pop.get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| parse_error(node_id, what))
    };
    Ok(NodePop {
        public_key: field("publicKey")?,
        proof_of_possession: field("proofOfPossession")?,
    })
}

/// `{"result": {"version": .., "rpcProtocolVersion": "35", "vmVersions": {"platform": ..}}}`
pub fn parse_node_version(node_id: &str, body: &str) -> Result<NodeVersion> {
    let what = "node version";
    let value = envelope(node_id, what, body)?;
    let rpc_protocol = match result_field(&value, "rpcProtocolVersion") {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| parse_error(node_id, what))?;
    let version = result_field(&value, "version")
        .and_then(Value::as_str)
        .ok_or_else(|| parse_error(node_id, what))?;
    let platform_vm = result_field(&value, "vmVersions")
        .and_then(|v| v.get("platform"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    Ok(NodeVersion {
        version: version.to_string(),
        platform_vm: platform_vm.to_string(),
        rpc_protocol,
    })
}
