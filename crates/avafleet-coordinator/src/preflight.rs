//! Checks run against every host before validator or subnet changes.

use std::future::Future;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tracing::info;

use avafleet_core::error::FleetError;
use avafleet_core::node::Host;
use avafleet_runtime::prober::Prober;

/// Ask every host the same yes/no question concurrently.
///
/// Returns the node IDs that answered "no". A probe error (unreachable host,
/// unexpected reply) fails the whole check.
async fn hosts_failing<F, Fut>(hosts: &[Host], probe: F) -> Result<Vec<String>>
where
    F: Fn(Host) -> Fut,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for host in hosts {
        let node_id = host.node_id.clone();
        let fut = probe(host.clone());
        set.spawn(async move { (node_id, fut.await) });
    }

    let mut failing = Vec::new();
    while let Some(joined) = set.join_next().await {
        let (node_id, result) = joined.context("Probe task failed")?;
        if !result.with_context(|| format!("Failed to probe {}", node_id))? {
            failing.push(node_id);
        }
    }
    failing.sort();
    Ok(failing)
}

pub async fn check_bootstrapped(prober: &Prober, hosts: &[Host]) -> Result<()> {
    let failing = hosts_failing(hosts, |host| {
        let prober = prober.clone();
        async move { prober.is_bootstrapped(&host).await }
    })
    .await?;
    if !failing.is_empty() {
        return Err(FleetError::NotBootstrapped(failing).into());
    }
    Ok(())
}

pub async fn check_healthy(prober: &Prober, hosts: &[Host]) -> Result<()> {
    let failing = hosts_failing(hosts, |host| {
        let prober = prober.clone();
        async move { prober.is_healthy(&host).await }
    })
    .await?;
    if !failing.is_empty() {
        return Err(FleetError::Unhealthy(failing).into());
    }
    Ok(())
}

pub async fn check_rpc_compatible(prober: &Prober, hosts: &[Host], rpc_version: u32) -> Result<()> {
    let failing = hosts_failing(hosts, |host| {
        let prober = prober.clone();
        async move { prober.rpc_compatible(&host, rpc_version).await }
    })
    .await?;
    if !failing.is_empty() {
        return Err(FleetError::RpcIncompatible {
            nodes: failing,
            rpc_version,
        }
        .into());
    }
    Ok(())
}

/// Bootstrapped, then healthy, then (when given) RPC compatible.
pub async fn run(prober: &Prober, hosts: &[Host], rpc_version: Option<u32>) -> Result<()> {
    check_bootstrapped(prober, hosts).await?;
    check_healthy(prober, hosts).await?;
    if let Some(version) = rpc_version {
        check_rpc_compatible(prober, hosts, version).await?;
    }
    info!(hosts = hosts.len(), "Preflight checks passed");
    Ok(())
}
