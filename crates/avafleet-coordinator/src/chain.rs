//! Chain-side capabilities used by validator registration.
//!
//! Reads go straight to the P-Chain JSON-RPC API. Anything that needs a key
//! (transaction issuance, validator-manager calls) goes through an external
//! signer program, so no key material is held by this process.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use avafleet_core::error::FleetError;
use avafleet_core::validator::{StakeTerms, ValidationId};
use avafleet_runtime::prober::NodePop;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything an L1 validator registration needs from the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L1Registration {
    pub subnet_id: String,
    pub node_id: String,
    pub weight: u64,
    /// nAVAX deposited for the validator's continuous fee.
    pub balance: u64,
    pub pop: NodePop,
    /// Unix time after which the registration message is void.
    pub expiry: u64,
}

/// Result of `InitValidatorRegistration`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitRegistration {
    pub validation_id: ValidationId,
    /// Warp message to be signed by the subnet's validators.
    pub unsigned_message: String,
}

#[async_trait]
pub trait PlatformChain: Send + Sync {
    /// Whether `node_id` is in the current validator set of a subnet, or of
    /// the Primary Network when `subnet_id` is `None`.
    async fn is_validator(&self, subnet_id: Option<&str>, node_id: &str) -> Result<bool>;

    /// Unix end time of `node_id`'s current validation, `None` when it is not
    /// a validator of the subnet (or the Primary Network).
    async fn validator_end_time(&self, subnet_id: Option<&str>, node_id: &str) -> Result<Option<u64>>;

    /// Current chain time, unix seconds.
    async fn timestamp(&self) -> Result<u64>;

    async fn height(&self) -> Result<u64>;

    async fn add_validator(&self, node_id: &str, terms: &StakeTerms) -> Result<String>;

    async fn add_subnet_validator(
        &self,
        subnet_id: &str,
        node_id: &str,
        terms: &StakeTerms,
    ) -> Result<String>;

    /// Fails with `AlreadyRegistered` when the message was already consumed.
    async fn register_l1_validator(
        &self,
        balance: u64,
        pop: &NodePop,
        signed_message: &str,
    ) -> Result<String>;
}

#[async_trait]
pub trait ValidatorManager: Send + Sync {
    /// Fails with `AlreadyRegistered` (carrying the existing ID) when a
    /// registration for this node is already in flight.
    async fn init_registration(&self, request: &L1Registration) -> Result<InitRegistration>;

    /// Unsigned message acknowledging the P-Chain registration of `validation_id`.
    async fn registration_ack(&self, validation_id: &ValidationId) -> Result<String>;

    /// Fails with `AlreadyFinished` when completed before.
    async fn finish_registration(&self, validation_id: &ValidationId, signed_ack: &str) -> Result<()>;
}

#[async_trait]
pub trait SignatureAggregator: Send + Sync {
    async fn aggregate(
        &self,
        unsigned_message: &str,
        justification: &str,
        signing_subnet_id: &str,
    ) -> Result<String>;
}

// ============================================================================
// P-Chain client
// ============================================================================

/// JSON-RPC reads against `<endpoint>/ext/bc/P`; writes through the signer.
pub struct PChainClient {
    url: String,
    http: reqwest::Client,
    signer: ExternalSigner,
}

impl PChainClient {
    pub fn new(endpoint: &str, signer: ExternalSigner) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("avafleet/", env!("CARGO_PKG_VERSION")))
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            url: format!("{}/ext/bc/P", endpoint.trim_end_matches('/')),
            http,
            signer,
        })
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params});
        debug!(method, url = %self.url, "P-Chain request");
        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| FleetError::TransientRemote {
                target: self.url.clone(),
                reason: e.to_string(),
            })?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(FleetError::TransientRemote {
                target: self.url.clone(),
                reason: format!("HTTP {} for {}", status, method),
            }
            .into());
        }
        if !status.is_success() {
            anyhow::bail!("HTTP {} for {} at {}", status, method, self.url);
        }
        let value: Value = resp
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", method))?;
        if let Some(err) = value.get("error") {
            let msg = err.get("message").and_then(Value::as_str).unwrap_or("unknown error");
            anyhow::bail!("{} failed: {}", method, msg);
        }
        value
            .get("result")
            .cloned()
            .with_context(|| format!("{} response has no result", method))
    }

    /// The `getCurrentValidators` record for `node_id`, if it validates.
    async fn current_validator(&self, subnet_id: Option<&str>, node_id: &str) -> Result<Option<Value>> {
        let mut params = json!({"nodeIDs": [node_id]});
        if let Some(subnet) = subnet_id {
            params["subnetID"] = json!(subnet);
        }
        let result = self.rpc("platform.getCurrentValidators", params).await?;
        let validators = result
            .get("validators")
            .and_then(Value::as_array)
            .context("getCurrentValidators response has no validators list")?;
        Ok(validators
            .iter()
            .find(|v| v.get("nodeID").and_then(Value::as_str) == Some(node_id))
            .cloned())
    }
}

#[async_trait]
impl PlatformChain for PChainClient {
    async fn is_validator(&self, subnet_id: Option<&str>, node_id: &str) -> Result<bool> {
        Ok(self.current_validator(subnet_id, node_id).await?.is_some())
    }

    async fn validator_end_time(&self, subnet_id: Option<&str>, node_id: &str) -> Result<Option<u64>> {
        let Some(record) = self.current_validator(subnet_id, node_id).await? else {
            return Ok(None);
        };
        let end = record.get("endTime").context("Validator record has no endTime")?;
        let end = match end {
            Value::String(s) => s.parse().with_context(|| format!("Invalid endTime: {}", s))?,
            Value::Number(n) => n.as_u64().context("Invalid endTime")?,
            _ => anyhow::bail!("Invalid endTime: {}", end),
        };
        Ok(Some(end))
    }

    async fn timestamp(&self) -> Result<u64> {
        let result = self.rpc("platform.getTimestamp", json!({})).await?;
        let ts = result
            .get("timestamp")
            .and_then(Value::as_str)
            .context("getTimestamp response has no timestamp")?;
        let parsed = chrono::DateTime::parse_from_rfc3339(ts)
            .with_context(|| format!("Invalid chain timestamp: {}", ts))?;
        u64::try_from(parsed.timestamp()).with_context(|| format!("Chain timestamp before epoch: {}", ts))
    }

    async fn height(&self) -> Result<u64> {
        let result = self.rpc("platform.getHeight", json!({})).await?;
        let height = result.get("height").context("getHeight response has no height")?;
        match height {
            Value::String(s) => s.parse().with_context(|| format!("Invalid height: {}", s)),
            Value::Number(n) => n.as_u64().context("Invalid height"),
            _ => anyhow::bail!("Invalid height: {}", height),
        }
    }

    async fn add_validator(&self, node_id: &str, terms: &StakeTerms) -> Result<String> {
        let out = self
            .signer
            .request(
                "add-validator",
                json!({
                    "nodeID": node_id,
                    "weight": terms.weight,
                    "startTime": terms.start_time,
                    "endTime": terms.end_time(),
                    "delegationFee": terms.delegation_fee,
                }),
            )
            .await?;
        tx_id(&out)
    }

    async fn add_subnet_validator(
        &self,
        subnet_id: &str,
        node_id: &str,
        terms: &StakeTerms,
    ) -> Result<String> {
        let out = self
            .signer
            .request(
                "add-subnet-validator",
                json!({
                    "subnetID": subnet_id,
                    "nodeID": node_id,
                    "weight": terms.weight,
                    "startTime": terms.start_time,
                    "endTime": terms.end_time(),
                }),
            )
            .await?;
        tx_id(&out)
    }

    async fn register_l1_validator(
        &self,
        balance: u64,
        pop: &NodePop,
        signed_message: &str,
    ) -> Result<String> {
        let out = self
            .signer
            .request(
                "register-l1-validator",
                json!({
                    "balance": balance,
                    "blsPublicKey": pop.public_key,
                    "blsProofOfPossession": pop.proof_of_possession,
                    "signedMessage": signed_message,
                }),
            )
            .await?;
        tx_id(&out)
    }
}

fn tx_id(out: &Value) -> Result<String> {
    let id = out
        .get("txID")
        .and_then(Value::as_str)
        .context("Signer response has no txID")?;
    info!(tx_id = id, "Transaction issued");
    Ok(id.to_string())
}

// ============================================================================
// External signer
// ============================================================================

/// Runs `<command> <action>` with a JSON request on stdin and reads a JSON
/// reply from stdout: `{"result": ...}` or `{"error": {"kind": .., "message": ..}}`.
#[derive(Debug, Clone)]
pub struct ExternalSigner {
    program: String,
    args: Vec<String>,
    network: String,
}

impl ExternalSigner {
    pub fn new(command: &str, network: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().context("Signer command is empty")?;
        Ok(Self {
            program,
            args: parts.collect(),
            network: network.to_string(),
        })
    }

    pub async fn request(&self, action: &str, mut payload: Value) -> Result<Value> {
        payload["network"] = json!(self.network);
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(action)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start signer {}", self.program))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.to_string().as_bytes())
                .await
                .context("Failed to send request to signer")?;
        }
        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for signer")?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let reply: Option<Value> = serde_json::from_str(stdout.trim()).ok();
        match reply {
            Some(reply) => parse_signer_reply(action, reply),
            None => anyhow::bail!(
                "Signer {} failed (exit {}): {}",
                action,
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        }
    }
}

/// Turn a signer reply into a value or a tagged error.
pub fn parse_signer_reply(action: &str, reply: Value) -> Result<Value> {
    if let Some(err) = reply.get("error") {
        let kind = err.get("kind").and_then(Value::as_str).unwrap_or_default();
        let validation_id = err
            .get("validationID")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let message = err.get("message").and_then(Value::as_str).unwrap_or("unknown error");
        return Err(match kind {
            "already_registered" => FleetError::AlreadyRegistered { validation_id }.into(),
            "already_finished" => FleetError::AlreadyFinished { validation_id }.into(),
            "expired" => FleetError::RegistrationExpired { validation_id }.into(),
            _ => anyhow::anyhow!("Signer {} failed: {}", action, message),
        });
    }
    reply
        .get("result")
        .cloned()
        .with_context(|| format!("Signer {} reply has no result", action))
}

#[async_trait]
impl ValidatorManager for ExternalSigner {
    async fn init_registration(&self, request: &L1Registration) -> Result<InitRegistration> {
        let out = self
            .request(
                "init-validator-registration",
                json!({
                    "subnetID": request.subnet_id,
                    "nodeID": request.node_id,
                    "weight": request.weight,
                    "blsPublicKey": request.pop.public_key,
                    "expiry": request.expiry,
                }),
            )
            .await?;
        let validation_id = out
            .get("validationID")
            .and_then(Value::as_str)
            .context("Signer reply has no validationID")?;
        let unsigned_message = out
            .get("unsignedMessage")
            .and_then(Value::as_str)
            .context("Signer reply has no unsignedMessage")?;
        Ok(InitRegistration {
            validation_id: ValidationId(validation_id.to_string()),
            unsigned_message: unsigned_message.to_string(),
        })
    }

    async fn registration_ack(&self, validation_id: &ValidationId) -> Result<String> {
        let out = self
            .request("registration-ack", json!({"validationID": validation_id.0}))
            .await?;
        out.get("unsignedMessage")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("Signer reply has no unsignedMessage")
    }

    async fn finish_registration(&self, validation_id: &ValidationId, signed_ack: &str) -> Result<()> {
        self.request(
            "finish-validator-registration",
            json!({"validationID": validation_id.0, "signedMessage": signed_ack}),
        )
        .await?;
        Ok(())
    }
}

// ============================================================================
// Signature aggregator
// ============================================================================

/// Client for a signature-aggregator service's `POST /aggregate-signatures`.
pub struct HttpAggregator {
    url: String,
    http: reqwest::Client,
    quorum_percentage: u32,
}

impl HttpAggregator {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("avafleet/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(120))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            url: format!("{}/aggregate-signatures", base_url.trim_end_matches('/')),
            http,
            quorum_percentage: 67,
        })
    }
}

#[async_trait]
impl SignatureAggregator for HttpAggregator {
    async fn aggregate(
        &self,
        unsigned_message: &str,
        justification: &str,
        signing_subnet_id: &str,
    ) -> Result<String> {
        let body = json!({
            "message": unsigned_message,
            "justification": justification,
            "signing-subnet-id": signing_subnet_id,
            "quorum-percentage": self.quorum_percentage,
        });
        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Signature aggregation request failed: {}", self.url))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("HTTP {} from signature aggregator: {}", status, text.trim());
        }
        let value: Value = resp
            .json()
            .await
            .context("Failed to parse aggregator response")?;
        value
            .get("signed-message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .context("Aggregator response has no signed-message")
    }
}
