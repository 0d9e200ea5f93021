//! Validator Registration Orchestrator.
//!
//! Drives nodes from "synced, not validating" to "validating" on the Primary
//! Network, a permissioned subnet, or an L1. Every per-node pipeline records
//! its own outcome; a failure on one node never stops its siblings.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use avafleet_core::config::CommandOptions;
use avafleet_core::error::FleetError;
use avafleet_core::network::NetworkIdentity;
use avafleet_core::node::Host;
use avafleet_core::retry::{PollOutcome, PollPolicy, poll_until};
use avafleet_core::time::unix_now;
use avafleet_core::validator::{
    RegistrationPhase, StakeTerms, SyncStatus, ValidationId, ValidationTarget, validate_transition,
};
use avafleet_runtime::prober::Prober;

use crate::chain::{L1Registration, PlatformChain, SignatureAggregator, ValidatorManager};
use crate::fan_out::{FleetOperationResult, NodeOutcome, fan_out};
use crate::preflight;

/// Weight given to subnet and L1 validators when none is requested.
pub const DEFAULT_SUBNET_WEIGHT: u64 = 20;

/// How long an L1 registration message stays valid after issuance.
pub const REGISTRATION_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Extra stake time per node index, so a batch does not expire all at once.
const STAGGER: Duration = Duration::from_secs(24 * 60 * 60);

/// Operator-supplied stake terms. Unset fields take network defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StakeRequest {
    pub weight: Option<u64>,
    pub duration: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L1Request {
    pub subnet_id: String,
    pub blockchain_id: String,
    pub weight: Option<u64>,
    /// nAVAX deposited for the validator's continuous fee.
    pub balance: u64,
}

/// Chain-facing capabilities the orchestrator drives.
#[derive(Clone)]
pub struct ChainClients {
    pub chain: Arc<dyn PlatformChain>,
    pub manager: Arc<dyn ValidatorManager>,
    pub aggregator: Arc<dyn SignatureAggregator>,
}

#[derive(Clone)]
pub struct ValidatorOrchestrator {
    clients: ChainClients,
    prober: Prober,
    network: NetworkIdentity,
    primary_poll: PollPolicy,
    visibility_attempts: u32,
    visibility_backoff: Duration,
}

/// Tracks one node's registration phase and rejects illegal jumps.
struct Progress<'a> {
    node_id: &'a str,
    phase: RegistrationPhase,
}

impl<'a> Progress<'a> {
    fn new(node_id: &'a str) -> Self {
        Self {
            node_id,
            phase: RegistrationPhase::NotValidator,
        }
    }

    fn advance(&mut self, to: RegistrationPhase) -> Result<()> {
        validate_transition(self.phase, to)?;
        debug!(node_id = self.node_id, from = %self.phase, to = %to, "Registration phase");
        self.phase = to;
        Ok(())
    }
}

impl ValidatorOrchestrator {
    pub fn new(clients: ChainClients, prober: Prober, network: NetworkIdentity, opts: &CommandOptions) -> Self {
        Self {
            clients,
            prober,
            network,
            primary_poll: opts.primary_poll,
            visibility_attempts: opts.visibility_attempts,
            visibility_backoff: opts.visibility_backoff,
        }
    }

    /// Resolve stake terms for the `index`-th node of a Primary Network batch.
    pub fn primary_terms(&self, request: &StakeRequest, index: usize) -> Result<StakeTerms> {
        let params = self.network.staking_params();
        let weight = request.weight.unwrap_or(params.min_validator_stake);
        if weight < params.min_validator_stake {
            return Err(FleetError::InvalidWeight {
                min: params.min_validator_stake,
                weight,
            }
            .into());
        }
        let duration = request.duration.unwrap_or(params.default_stake_duration) + STAGGER * index as u32;
        Ok(StakeTerms {
            weight,
            start_time: unix_now() + params.start_lead_time.as_secs(),
            duration,
            delegation_fee: params.min_delegation_fee,
        })
    }

    /// Resolve subnet stake terms for a node whose Primary Network validation
    /// ends at `primary_end`.
    ///
    /// Without a requested duration the subnet validation runs until the
    /// primary one ends. A window that would outlive it is rejected.
    pub fn subnet_terms(&self, node_id: &str, request: &StakeRequest, primary_end: u64) -> Result<StakeTerms> {
        let params = self.network.staking_params();
        let start_time = unix_now() + params.start_lead_time.as_secs();
        let duration = request
            .duration
            .unwrap_or_else(|| Duration::from_secs(primary_end.saturating_sub(start_time)));
        let terms = StakeTerms {
            weight: request.weight.unwrap_or(DEFAULT_SUBNET_WEIGHT),
            start_time,
            duration,
            delegation_fee: 0,
        };
        if duration.is_zero() || terms.end_time() > primary_end {
            return Err(FleetError::StakeOutlivesPrimary {
                node_id: node_id.to_string(),
                end: terms.end_time(),
                primary_end,
            }
            .into());
        }
        Ok(terms)
    }

    // ========================================================================
    // Primary Network
    // ========================================================================

    /// Issue AddValidator for one node unless it already validates.
    ///
    /// Returns `false` without touching the chain when the node is already a
    /// Primary Network validator.
    pub async fn add_primary_validator(&self, host: &Host, index: usize, request: &StakeRequest) -> Result<bool> {
        let node_id = self.prober.node_id(host).await?;
        if self.clients.chain.is_validator(None, &node_id).await? {
            info!(node_id = %node_id, "Already a Primary Network validator");
            return Ok(false);
        }
        let terms = self.primary_terms(request, index)?;
        let tx = self
            .clients
            .chain
            .add_validator(&node_id, &terms)
            .await
            .with_context(|| format!("Failed to add {} as Primary Network validator", node_id))?;
        info!(node_id = %node_id, tx_id = %tx, weight = terms.weight, "Issued AddValidator");
        Ok(true)
    }

    /// Make every host a Primary Network validator.
    ///
    /// The value per node is whether a transaction was issued for it.
    #[instrument(skip_all, fields(hosts = hosts.len()))]
    pub async fn validate_primary(&self, hosts: &[Host], request: &StakeRequest) -> Result<FleetOperationResult<bool>> {
        preflight::run(&self.prober, hosts, None).await?;
        self.issue_primary(hosts, request).await
    }

    async fn issue_primary(&self, hosts: &[Host], request: &StakeRequest) -> Result<FleetOperationResult<bool>> {
        let items: Vec<(usize, Host)> = hosts.iter().cloned().enumerate().collect();
        fan_out(items, |(_, h)| h.node_id.clone(), |(index, host)| {
            let this = self.clone();
            let request = request.clone();
            async move { this.add_primary_validator(&host, index, &request).await }
        })
        .await
    }

    /// Wait until a node shows up in the Primary Network validator set.
    async fn await_primary(&self, host: &Host) -> Result<()> {
        let node_id = self.prober.node_id(host).await?;
        let chain = self.clients.chain.clone();
        let outcome = poll_until(self.primary_poll, "primary validator visibility", || {
            let chain = chain.clone();
            let node_id = node_id.clone();
            async move { chain.is_validator(None, &node_id).await }
        })
        .await?;
        match outcome {
            PollOutcome::Ready => Ok(()),
            PollOutcome::TimedOut => Err(FleetError::ValidatorTimeout {
                node_id,
                target: ValidationTarget::PrimaryNetwork.to_string(),
                secs: self.primary_poll.timeout.as_secs(),
            }
            .into()),
        }
    }

    // ========================================================================
    // Permissioned subnets
    // ========================================================================

    /// Sync precondition for subnet and L1 registration.
    ///
    /// Only a syncing node may be registered. A node that already reports
    /// validating is an already-done outcome; anything else is not synced.
    async fn check_syncing(&self, host: &Host, node_id: &str, subnet_id: &str, blockchain_id: &str) -> Result<()> {
        match self.prober.subnet_sync_status(host, blockchain_id).await? {
            SyncStatus::Syncing => Ok(()),
            SyncStatus::Validating => Err(FleetError::AlreadyValidating {
                node_id: node_id.to_string(),
                target: format!("subnet {}", subnet_id),
            }
            .into()),
            SyncStatus::Bootstrapping => Err(FleetError::NotSynced {
                node_id: node_id.to_string(),
                subnet: subnet_id.to_string(),
            }
            .into()),
        }
    }

    /// Register one node with a subnet; it must already validate the Primary Network.
    pub async fn add_subnet_validator(
        &self,
        host: &Host,
        subnet_id: &str,
        blockchain_id: &str,
        request: &StakeRequest,
    ) -> Result<()> {
        let node_id = self.prober.node_id(host).await?;
        self.check_syncing(host, &node_id, subnet_id, blockchain_id).await?;
        let chain = self.clients.chain.clone();
        if chain.is_validator(Some(subnet_id), &node_id).await? {
            return Err(FleetError::AlreadyValidating {
                node_id,
                target: format!("subnet {}", subnet_id),
            }
            .into());
        }

        let primary_end = chain
            .validator_end_time(None, &node_id)
            .await?
            .with_context(|| format!("Node {} is not a Primary Network validator", node_id))?;
        let terms = self.subnet_terms(&node_id, request, primary_end)?;
        let tx = chain
            .add_subnet_validator(subnet_id, &node_id, &terms)
            .await
            .with_context(|| format!("Failed to add {} as validator of subnet {}", node_id, subnet_id))?;
        info!(node_id = %node_id, subnet = subnet_id, tx_id = %tx, "Issued AddSubnetValidator");

        let outcome = poll_until(self.primary_poll, "subnet validator visibility", || {
            let chain = chain.clone();
            let node_id = node_id.clone();
            async move { chain.is_validator(Some(subnet_id), &node_id).await }
        })
        .await?;
        match outcome {
            PollOutcome::Ready => Ok(()),
            PollOutcome::TimedOut => Err(FleetError::ValidatorTimeout {
                node_id,
                target: format!("subnet {}", subnet_id),
                secs: self.primary_poll.timeout.as_secs(),
            }
            .into()),
        }
    }

    /// Make every host a validator of `subnet_id`.
    ///
    /// Nodes that are not yet Primary Network validators are registered there
    /// first, in two passes (issue all, then wait all). Only nodes confirmed on
    /// the Primary Network move on to subnet registration.
    #[instrument(skip_all, fields(subnet = subnet_id, hosts = hosts.len()))]
    pub async fn validate_subnet(
        &self,
        hosts: &[Host],
        subnet_id: &str,
        blockchain_id: &str,
        primary: &StakeRequest,
        subnet: &StakeRequest,
    ) -> Result<FleetOperationResult> {
        let primary_duration = primary
            .duration
            .unwrap_or(self.network.staking_params().default_stake_duration);
        if let Some(duration) = subnet.duration
            && duration > primary_duration
        {
            anyhow::bail!(
                "Subnet stake duration of {}h exceeds the Primary Network stake duration of {}h",
                duration.as_secs() / 3600,
                primary_duration.as_secs() / 3600
            );
        }
        preflight::run(&self.prober, hosts, None).await?;

        let issued = self.issue_primary(hosts, primary).await?;
        let mut result: FleetOperationResult = issued.failures();

        let waiting: Vec<Host> = hosts
            .iter()
            .filter(|h| matches!(issued.get(&h.node_id), Some(NodeOutcome::Done(true))))
            .cloned()
            .collect();
        if !waiting.is_empty() {
            info!(nodes = waiting.len(), "Waiting for Primary Network validation to start");
        }
        let waited = fan_out(waiting, |h| h.node_id.clone(), |host| {
            let this = self.clone();
            async move { this.await_primary(&host).await }
        })
        .await?;
        result.merge(waited.failures());

        let ready: Vec<Host> = hosts
            .iter()
            .filter(|h| issued.get(&h.node_id).is_some_and(|o| !matches!(o, NodeOutcome::Failed(_))))
            .filter(|h| waited.get(&h.node_id).is_none_or(|o| !matches!(o, NodeOutcome::Failed(_))))
            .cloned()
            .collect();
        let subnet_result = fan_out(ready, |h| h.node_id.clone(), |host| {
            let this = self.clone();
            let subnet = subnet.clone();
            let subnet_id = subnet_id.to_string();
            let blockchain_id = blockchain_id.to_string();
            async move {
                this.add_subnet_validator(&host, &subnet_id, &blockchain_id, &subnet)
                    .await
            }
        })
        .await?;
        result.merge(subnet_result);
        Ok(result)
    }

    // ========================================================================
    // L1 (two-phase registration)
    // ========================================================================

    /// Register one node as an L1 validator through the validator manager.
    pub async fn register_l1_validator(&self, host: &Host, request: &L1Request) -> Result<ValidationId> {
        let chain = self.clients.chain.clone();
        let node_id = self.prober.node_id(host).await?;
        let mut progress = Progress::new(&node_id);

        if chain.is_validator(Some(&request.subnet_id), &node_id).await? {
            progress.advance(RegistrationPhase::Done)?;
            return Err(FleetError::AlreadyValidating {
                node_id: node_id.clone(),
                target: format!("L1 {}", request.subnet_id),
            }
            .into());
        }
        self.check_syncing(host, &node_id, &request.subnet_id, &request.blockchain_id)
            .await?;

        match self.drive_l1(host, request, &node_id, &mut progress).await {
            Ok(id) => Ok(id),
            Err(e) => {
                if progress.phase != RegistrationPhase::Done {
                    progress.advance(RegistrationPhase::Failed)?;
                }
                warn!(node_id = %node_id, phase = %progress.phase, error = %e, "L1 registration failed");
                Err(e)
            }
        }
    }

    async fn drive_l1(
        &self,
        host: &Host,
        request: &L1Request,
        node_id: &str,
        progress: &mut Progress<'_>,
    ) -> Result<ValidationId> {
        let ChainClients {
            chain,
            manager,
            aggregator,
        } = &self.clients;
        let pop = self.prober.node_pop(host).await?;
        let expiry = chain.timestamp().await? + REGISTRATION_EXPIRY.as_secs();

        progress.advance(RegistrationPhase::IssueRegistration)?;
        let registration = L1Registration {
            subnet_id: request.subnet_id.clone(),
            node_id: node_id.to_string(),
            weight: request.weight.unwrap_or(DEFAULT_SUBNET_WEIGHT),
            balance: request.balance,
            pop: pop.clone(),
            expiry,
        };

        // Height to wait past before finishing; None when the chain already has it.
        let (validation_id, min_height) = match manager.init_registration(&registration).await {
            Ok(init) => {
                info!(node_id, validation_id = %init.validation_id, "Initialized validator registration");
                let signed = aggregator
                    .aggregate(&init.unsigned_message, "", &request.subnet_id)
                    .await
                    .with_context(|| format!("Failed to aggregate registration signatures for {}", node_id))?;
                if chain.timestamp().await? >= expiry {
                    return Err(FleetError::RegistrationExpired {
                        validation_id: init.validation_id.0.clone(),
                    }
                    .into());
                }
                let height = chain.height().await?;
                match chain.register_l1_validator(request.balance, &pop, &signed).await {
                    Ok(tx) => {
                        info!(node_id, tx_id = %tx, "Issued RegisterL1ValidatorTx");
                        (init.validation_id, Some(height))
                    }
                    Err(e) if matches!(FleetError::of(&e), Some(FleetError::AlreadyRegistered { .. })) => {
                        info!(node_id, "Registration already on the P-Chain, continuing");
                        (init.validation_id, None)
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(e) => match FleetError::of(&e) {
                Some(FleetError::AlreadyRegistered { validation_id }) => {
                    info!(node_id, validation_id = %validation_id, "Registration already issued, continuing to finish");
                    (ValidationId(validation_id.clone()), None)
                }
                _ => return Err(e),
            },
        };

        progress.advance(RegistrationPhase::AwaitChainHeight)?;
        if let Some(height) = min_height {
            let outcome = poll_until(self.primary_poll, "P-Chain height", || async move {
                Ok::<_, anyhow::Error>(chain.height().await? > height)
            })
            .await?;
            if outcome == PollOutcome::TimedOut {
                return Err(FleetError::TransientRemote {
                    target: "P-Chain".to_string(),
                    reason: format!("height did not advance past {}", height),
                }
                .into());
            }
        }

        progress.advance(RegistrationPhase::FinishRegistration)?;
        let ack = manager.registration_ack(&validation_id).await?;
        let signed_ack = aggregator
            .aggregate(&ack, &validation_id.0, &request.subnet_id)
            .await
            .with_context(|| format!("Failed to aggregate acknowledgement for {}", validation_id))?;
        match manager.finish_registration(&validation_id, &signed_ack).await {
            Ok(()) => info!(node_id, validation_id = %validation_id, "Finished validator registration"),
            Err(e) if matches!(FleetError::of(&e), Some(FleetError::AlreadyFinished { .. })) => {
                info!(node_id, validation_id = %validation_id, "Registration was already finished");
            }
            Err(e) => return Err(e),
        }

        progress.advance(RegistrationPhase::PollUntilVisible)?;
        for attempt in 1..=self.visibility_attempts {
            if chain.is_validator(Some(&request.subnet_id), node_id).await? {
                progress.advance(RegistrationPhase::Done)?;
                return Ok(validation_id);
            }
            debug!(node_id, attempt, "Validator not visible yet");
            if attempt < self.visibility_attempts {
                tokio::time::sleep(self.visibility_backoff).await;
            }
        }
        Err(FleetError::ValidatorTimeout {
            node_id: node_id.to_string(),
            target: format!("L1 {}", request.subnet_id),
            secs: self.visibility_backoff.as_secs() * u64::from(self.visibility_attempts),
        }
        .into())
    }

    /// Register every host as an L1 validator.
    #[instrument(skip_all, fields(subnet = %request.subnet_id, hosts = hosts.len()))]
    pub async fn validate_l1(&self, hosts: &[Host], request: &L1Request) -> Result<FleetOperationResult<ValidationId>> {
        preflight::run(&self.prober, hosts, None).await?;
        fan_out(hosts.to_vec(), |h| h.node_id.clone(), |host| {
            let this = self.clone();
            let request = request.clone();
            async move { this.register_l1_validator(&host, &request).await }
        })
        .await
    }
}
