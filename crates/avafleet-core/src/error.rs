use std::collections::BTreeMap;

use thiserror::Error;

/// Closed set of error kinds that callers branch on.
///
/// Raised as `anyhow::Error` and recovered with [`FleetError::of`], so the
/// rest of the stack keeps plain `anyhow::Result` signatures while kind
/// checks never depend on message text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FleetError {
    #[error("cluster {0:?} not found")]
    ClusterNotFound(String),

    #[error("no nodes found in cluster {0}")]
    NoNodes(String),

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("cluster {0} already exists, use --force to overwrite")]
    ClusterExists(String),

    #[error("node {0} already exists, use --force to overwrite")]
    NodeDirExists(String),

    /// The cloud instance is already gone or already stopped.
    #[error("node {node_id} is not found to be running")]
    NodeNotRunning { node_id: String },

    #[error("node {node_id} is already a validator of {target}")]
    AlreadyValidating { node_id: String, target: String },

    /// A cloud rule or address that a create call found already in place.
    #[error("{0} already exists")]
    ResourceExists(String),

    /// An ingress permission that a revoke call found already gone.
    #[error("ingress rule on {0} not found")]
    RuleNotFound(String),

    #[error("transient failure talking to {target}: {reason}")]
    TransientRemote { target: String, reason: String },

    #[error("cloud credentials expired for profile {profile}")]
    ExpiredCredentials { profile: String },

    #[error("failed to {operation} node(s) {}", format_ids(.failed.keys()))]
    PartialFleetFailure {
        operation: String,
        failed: BTreeMap<String, String>,
    },

    #[error("{original}{}", format_cleanup(.cleanup_errors))]
    ProvisioningPartialFailure {
        original: String,
        cleanup_errors: Vec<String>,
    },

    #[error("unable to parse {what} for node {node_id}")]
    StatusParse { node_id: String, what: String },

    #[error("node(s) {} are not bootstrapped yet, please try again later", format_ids(.0.iter()))]
    NotBootstrapped(Vec<String>),

    #[error("node(s) {} are not healthy, please check the issue and try again later", format_ids(.0.iter()))]
    Unhealthy(Vec<String>),

    #[error("node(s) {} are not RPC compatible with RPC protocol version {rpc_version}", format_ids(.nodes.iter()))]
    RpcIncompatible { nodes: Vec<String>, rpc_version: u32 },

    #[error("node {node_id} is not synced to subnet {subnet} yet, please try again later")]
    NotSynced { node_id: String, subnet: String },

    #[error("illegal weight, must be greater than or equal to {min}: {weight}")]
    InvalidWeight { min: u64, weight: u64 },

    #[error(
        "subnet validation of node {node_id} would end at {end}, after its Primary Network validation ends at {primary_end}"
    )]
    StakeOutlivesPrimary { node_id: String, end: u64, primary_end: u64 },

    #[error("validation {validation_id} expired before submission")]
    RegistrationExpired { validation_id: String },

    #[error("validator registration already initialized for {validation_id}")]
    AlreadyRegistered { validation_id: String },

    #[error("validator {validation_id} was already fully registered")]
    AlreadyFinished { validation_id: String },

    #[error("node {node_id} not validating {target} after {secs} seconds")]
    ValidatorTimeout {
        node_id: String,
        target: String,
        secs: u64,
    },

    #[error("{0} is not supported for local clusters")]
    NotImplementedForLocal(String),
}

impl FleetError {
    /// Recover the kind carried by an `anyhow::Error`, if any.
    pub fn of(err: &anyhow::Error) -> Option<&FleetError> {
        err.chain().find_map(|cause| cause.downcast_ref::<FleetError>())
    }

    /// Aborts a whole fleet pass.
    pub fn is_expired_credentials(err: &anyhow::Error) -> bool {
        matches!(Self::of(err), Some(FleetError::ExpiredCredentials { .. }))
    }

    /// Recoverable outcomes that count as done for the node.
    pub fn is_already_in_target_state(err: &anyhow::Error) -> bool {
        matches!(
            Self::of(err),
            Some(FleetError::NodeNotRunning { .. }) | Some(FleetError::AlreadyValidating { .. })
        )
    }

    /// Worth another attempt from a caller that owns a retry policy.
    pub fn is_retryable(err: &anyhow::Error) -> bool {
        matches!(
            Self::of(err),
            Some(FleetError::TransientRemote { .. }) | Some(FleetError::RegistrationExpired { .. })
        )
    }
}

fn format_ids<'a>(ids: impl Iterator<Item = &'a String>) -> String {
    format!("[{}]", ids.cloned().collect::<Vec<_>>().join(", "))
}

fn format_cleanup(errors: &[String]) -> String {
    if errors.is_empty() {
        String::new()
    } else {
        format!(" (cleanup also failed: {})", errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_kind_survives_context() {
        let err: anyhow::Error = FleetError::ExpiredCredentials {
            profile: "default".to_string(),
        }
        .into();
        let err = Err::<(), _>(err)
            .context("Failed to destroy node i-1")
            .unwrap_err();
        assert!(FleetError::is_expired_credentials(&err));
        assert!(!FleetError::is_retryable(&err));
    }

    #[test]
    fn test_plain_error_has_no_kind() {
        let err = anyhow::anyhow!("node not found to be running");
        assert!(FleetError::of(&err).is_none());
        assert!(!FleetError::is_already_in_target_state(&err));
    }

    #[test]
    fn test_partial_failure_names_every_node() {
        let mut failed = BTreeMap::new();
        failed.insert("i-b".to_string(), "boom".to_string());
        failed.insert("i-a".to_string(), "bang".to_string());
        let err = FleetError::PartialFleetFailure {
            operation: "destroy".to_string(),
            failed,
        };
        assert_eq!(err.to_string(), "failed to destroy node(s) [i-a, i-b]");
    }

    #[test]
    fn test_provisioning_failure_keeps_original() {
        let err = FleetError::ProvisioningPartialFailure {
            original: "instance 3 failed to start".to_string(),
            cleanup_errors: vec!["i-2: timeout".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("instance 3 failed to start"));
        assert!(msg.contains("i-2: timeout"));
    }

    #[test]
    fn test_invalid_weight_message() {
        let err = FleetError::InvalidWeight { min: 20, weight: 5 };
        assert_eq!(
            err.to_string(),
            "illegal weight, must be greater than or equal to 20: 5"
        );
    }

    #[test]
    fn test_already_states() {
        let gone: anyhow::Error = FleetError::NodeNotRunning {
            node_id: "i-1".to_string(),
        }
        .into();
        assert!(FleetError::is_already_in_target_state(&gone));
        let retry: anyhow::Error = FleetError::RegistrationExpired {
            validation_id: "v".to_string(),
        }
        .into();
        assert!(FleetError::is_retryable(&retry));
    }
}
