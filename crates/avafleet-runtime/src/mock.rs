//! Test doubles for the gateway and the cloud adapter.
//!
//! `ScriptedExecutor` answers remote scripts through a handler closure;
//! `FakeCloud` keeps instances and firewall rules in memory so fleet
//! operations can be asserted end to end without a vendor CLI.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use avafleet_core::error::FleetError;
use avafleet_core::naming::host_cidr;
use avafleet_core::node::{CloudService, Host, NodeConfig};

use crate::cloud::pool::RegionPool;
use crate::cloud::{CloudProvider, CreatedInstance, FirewallRule, InstanceSpec, RuleOutcome};
use crate::gateway::{CommandOutput, RemoteExecutor};

// ============================================================================
// Remote execution
// ============================================================================

/// Mock response for a remote script.
pub struct MockResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl MockResponse {
    pub fn ok(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn empty() -> Self {
        Self::ok("")
    }

    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn to_output(&self) -> CommandOutput {
        CommandOutput {
            code: self.exit_code,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        }
    }
}

type MockHandler = Box<dyn Fn(&Host, &str) -> MockResponse + Send + Sync>;

/// Executor that answers every script with a handler and records the calls.
pub struct ScriptedExecutor {
    handler: MockHandler,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedExecutor {
    pub fn new(handler: impl Fn(&Host, &str) -> MockResponse + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(host node ID, script)` for every call so far, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    /// Scripts run against one host.
    pub fn scripts_for(&self, node_id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(id, _)| id == node_id)
            .map(|(_, script)| script)
            .collect()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn run(&self, host: &Host, script: &str) -> Result<CommandOutput> {
        self.calls
            .lock()
            .unwrap()
            .push((host.node_id.clone(), script.to_string()));
        Ok((self.handler)(host, script).to_output())
    }
}

// ============================================================================
// Cloud
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeInstanceState {
    Running,
    Stopped,
    Terminated,
}

/// One granted (group, cidr, port) as seen by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeRule {
    pub service: CloudService,
    pub region: String,
    pub group: String,
    pub cidr: String,
    pub port: u16,
}

#[derive(Default)]
struct FakeState {
    next_id: usize,
    instances: BTreeMap<String, FakeInstanceState>,
    rules: Vec<FakeRule>,
    fail_launch_at: Option<usize>,
    failing: Vec<String>,
    expired: bool,
    released_ips: Vec<String>,
    calls: Vec<String>,
}

/// In-memory cloud. Clones made with [`FakeCloud::in_region`] share state,
/// so one handle observes every region a pool touched.
#[derive(Clone)]
pub struct FakeCloud {
    service: CloudService,
    region: String,
    state: Arc<Mutex<FakeState>>,
}

impl FakeCloud {
    pub fn aws(region: &str) -> Self {
        Self {
            service: CloudService::Aws,
            region: region.to_string(),
            state: Arc::default(),
        }
    }

    pub fn gcp(region: &str) -> Self {
        Self {
            service: CloudService::Gcp,
            ..Self::aws(region)
        }
    }

    /// Same backing state, seen as another cloud and region.
    pub fn in_region(&self, service: CloudService, region: &str) -> Self {
        Self {
            service,
            region: region.to_string(),
            state: self.state.clone(),
        }
    }

    /// Pool whose every client is a view of this fake.
    pub fn pool(&self) -> RegionPool {
        let fake = self.clone();
        RegionPool::new(Arc::new(move |service: CloudService, region: &str| {
            Ok(Arc::new(fake.in_region(service, region)) as Arc<dyn CloudProvider>)
        }))
    }

    pub fn add_instance(&self, id: &str, state: FakeInstanceState) {
        self.state
            .lock()
            .unwrap()
            .instances
            .insert(id.to_string(), state);
    }

    pub fn add_rule(&self, group: &str, ip: &str, port: u16) {
        self.state.lock().unwrap().rules.push(FakeRule {
            service: self.service,
            region: self.region.clone(),
            group: group.to_string(),
            cidr: host_cidr(ip),
            port,
        });
    }

    /// Launching instance `index` of a spec fails.
    pub fn fail_launch_at(&self, index: usize) {
        self.state.lock().unwrap().fail_launch_at = Some(index);
    }

    /// Destroy and stop of this instance fail with a plain error.
    pub fn fail_destroy(&self, id: &str) {
        self.state.lock().unwrap().failing.push(id.to_string());
    }

    pub fn expire_credentials(&self) {
        self.state.lock().unwrap().expired = true;
    }

    pub fn state_of(&self, id: &str) -> Option<FakeInstanceState> {
        self.state.lock().unwrap().instances.get(id).copied()
    }

    pub fn running(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .instances
            .iter()
            .filter(|(_, s)| **s == FakeInstanceState::Running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn rules(&self) -> Vec<FakeRule> {
        self.state.lock().unwrap().rules.clone()
    }

    pub fn released_ips(&self) -> Vec<String> {
        self.state.lock().unwrap().released_ips.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn enter(&self, call: String) -> Result<std::sync::MutexGuard<'_, FakeState>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if state.expired {
            return Err(FleetError::ExpiredCredentials {
                profile: "fake".to_string(),
            }
            .into());
        }
        Ok(state)
    }
}

fn not_running(node_id: &str) -> anyhow::Error {
    FleetError::NodeNotRunning {
        node_id: node_id.to_string(),
    }
    .into()
}

#[async_trait]
impl CloudProvider for FakeCloud {
    fn service(&self) -> CloudService {
        self.service
    }

    fn region(&self) -> &str {
        &self.region
    }

    async fn launch_instance(&self, _spec: &InstanceSpec, index: usize) -> Result<String> {
        let mut state = self.enter(format!("launch {}", index))?;
        if state.fail_launch_at == Some(index) {
            anyhow::bail!("launch of instance {} failed: capacity", index);
        }
        let id = format!("fake-{}", state.next_id);
        state.next_id += 1;
        state.instances.insert(id.clone(), FakeInstanceState::Running);
        Ok(id)
    }

    async fn wait_running(&self, instance_id: &str) -> Result<CreatedInstance> {
        let state = self.enter(format!("wait {}", instance_id))?;
        let n = state.instances.keys().position(|k| k == instance_id).unwrap_or(0);
        Ok(CreatedInstance {
            instance_id: instance_id.to_string(),
            public_ip: Some(format!("10.0.0.{}", n + 1)),
            static_ip: false,
        })
    }

    async fn allocate_static_ip(&self, instance_id: &str) -> Result<String> {
        let state = self.enter(format!("allocate-ip {}", instance_id))?;
        let n = state.instances.keys().position(|k| k == instance_id).unwrap_or(0);
        Ok(format!("203.0.113.{}", n + 1))
    }

    async fn destroy_instance(&self, node: &NodeConfig) -> Result<()> {
        let mut state = self.enter(format!("destroy {}", node.instance_id))?;
        if state.failing.contains(&node.instance_id) {
            anyhow::bail!("destroy failed for {}", node.instance_id);
        }
        match state.instances.get(&node.instance_id) {
            None | Some(FakeInstanceState::Terminated) => Err(not_running(&node.node_id)),
            Some(_) => {
                state
                    .instances
                    .insert(node.instance_id.clone(), FakeInstanceState::Terminated);
                Ok(())
            }
        }
    }

    async fn stop_instance(&self, node: &NodeConfig) -> Result<()> {
        let mut state = self.enter(format!("stop {}", node.instance_id))?;
        if state.failing.contains(&node.instance_id) {
            anyhow::bail!("stop failed for {}", node.instance_id);
        }
        match state.instances.get(&node.instance_id) {
            Some(FakeInstanceState::Running) => {
                state
                    .instances
                    .insert(node.instance_id.clone(), FakeInstanceState::Stopped);
                Ok(())
            }
            _ => Err(not_running(&node.node_id)),
        }
    }

    async fn release_static_ip(&self, node: &NodeConfig) -> Result<()> {
        let mut state = self.enter(format!("release-ip {}", node.instance_id))?;
        if let Some(ip) = node.public_ip() {
            state.released_ips.push(ip.to_string());
        }
        Ok(())
    }

    async fn ensure_firewall_rule(&self, rule: &FirewallRule) -> Result<RuleOutcome> {
        let mut state = self.enter(format!("ensure-rule {} {}", rule.group, rule.cidr))?;
        let mut added = Vec::new();
        for &port in &rule.ports {
            let present = state.rules.iter().any(|r| {
                r.service == self.service
                    && r.region == self.region
                    && r.group == rule.group
                    && r.cidr == rule.cidr
                    && r.port == port
            });
            if !present {
                state.rules.push(FakeRule {
                    service: self.service,
                    region: self.region.clone(),
                    group: rule.group.clone(),
                    cidr: rule.cidr.clone(),
                    port,
                });
                added.push(port);
            }
        }
        if added.is_empty() {
            Ok(RuleOutcome::AlreadyPresent)
        } else {
            Ok(RuleOutcome::Added(added))
        }
    }

    async fn revoke_ip(&self, group: &str, ip: &str) -> Result<()> {
        let mut state = self.enter(format!("revoke {} {}", group, ip))?;
        let cidr = host_cidr(ip);
        let service = self.service;
        let region = self.region.clone();
        state
            .rules
            .retain(|r| !(r.service == service && r.region == region && r.group == group && r.cidr == cidr));
        Ok(())
    }
}
