use std::time::Duration;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Where a node should end up validating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ValidationTarget {
    PrimaryNetwork,
    /// Permissioned subnet, single-phase AddSubnetValidator flow.
    Subnet {
        subnet_id: String,
        blockchain_id: String,
    },
    /// L1 whose validator set is managed by a validator manager contract.
    L1 {
        subnet_id: String,
        blockchain_id: String,
    },
}

impl std::fmt::Display for ValidationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrimaryNetwork => write!(f, "Primary Network"),
            Self::Subnet { subnet_id, .. } => write!(f, "subnet {}", subnet_id),
            Self::L1 { subnet_id, .. } => write!(f, "L1 {}", subnet_id),
        }
    }
}

/// A node's view of its sync with a blockchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Bootstrapping,
    Syncing,
    Validating,
}

impl SyncStatus {
    /// Parse the status string reported by `platform.getBlockchainStatus`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bootstrapping" => Some(Self::Bootstrapping),
            "syncing" => Some(Self::Syncing),
            "validating" => Some(Self::Validating),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bootstrapping => write!(f, "bootstrapping"),
            Self::Syncing => write!(f, "syncing"),
            Self::Validating => write!(f, "validating"),
        }
    }
}

/// Per-node progress through validator registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationPhase {
    NotValidator,
    IssueRegistration,
    AwaitChainHeight,
    FinishRegistration,
    PollUntilVisible,
    Done,
    Failed,
}

impl std::fmt::Display for RegistrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotValidator => write!(f, "not_validator"),
            Self::IssueRegistration => write!(f, "issue_registration"),
            Self::AwaitChainHeight => write!(f, "await_chain_height"),
            Self::FinishRegistration => write!(f, "finish_registration"),
            Self::PollUntilVisible => write!(f, "poll_until_visible"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Validate that a registration phase transition is allowed.
pub fn validate_transition(from: RegistrationPhase, to: RegistrationPhase) -> Result<()> {
    use RegistrationPhase::*;

    // Any live phase can fail
    if to == Failed && from != Done {
        return Ok(());
    }

    let valid = matches!(
        (from, to),
        // Already validating
        (NotValidator, Done)
        | (NotValidator, IssueRegistration)
        // Single-phase flows skip the height wait and finish step
        | (IssueRegistration, PollUntilVisible)
        | (IssueRegistration, AwaitChainHeight)
        | (AwaitChainHeight, FinishRegistration)
        | (FinishRegistration, PollUntilVisible)
        | (PollUntilVisible, Done)
        // Expired registration is issued again
        | (Failed, IssueRegistration)
    );

    if !valid {
        bail!("Invalid registration transition: {} -> {}", from, to);
    }
    Ok(())
}

/// Handle correlating a registration warp message with its on-chain outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValidationId(pub String);

impl std::fmt::Display for ValidationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stake terms for one validator registration, fully resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeTerms {
    /// nAVAX for the Primary Network, relative weight for subnets.
    pub weight: u64,
    /// Unix seconds.
    pub start_time: u64,
    pub duration: Duration,
    /// Parts per million.
    pub delegation_fee: u32,
}

impl StakeTerms {
    pub fn end_time(&self) -> u64 {
        self.start_time + self.duration.as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_status_parse() {
        assert_eq!(SyncStatus::parse("Syncing"), Some(SyncStatus::Syncing));
        assert_eq!(SyncStatus::parse("validating"), Some(SyncStatus::Validating));
        assert_eq!(SyncStatus::parse("Bootstrapping"), Some(SyncStatus::Bootstrapping));
        assert_eq!(SyncStatus::parse("Created"), None);
    }

    #[test]
    fn test_l1_phase_sequence_is_valid() {
        use RegistrationPhase::*;
        let path = [
            NotValidator,
            IssueRegistration,
            AwaitChainHeight,
            FinishRegistration,
            PollUntilVisible,
            Done,
        ];
        for pair in path.windows(2) {
            assert!(validate_transition(pair[0], pair[1]).is_ok());
        }
    }

    #[test]
    fn test_legacy_flow_skips_finish() {
        use RegistrationPhase::*;
        assert!(validate_transition(IssueRegistration, PollUntilVisible).is_ok());
    }

    #[test]
    fn test_invalid_transitions() {
        use RegistrationPhase::*;
        assert!(validate_transition(NotValidator, FinishRegistration).is_err());
        assert!(validate_transition(Done, Failed).is_err());
        assert!(validate_transition(PollUntilVisible, IssueRegistration).is_err());
    }

    #[test]
    fn test_failed_can_reissue() {
        use RegistrationPhase::*;
        assert!(validate_transition(AwaitChainHeight, Failed).is_ok());
        assert!(validate_transition(Failed, IssueRegistration).is_ok());
    }

    #[test]
    fn test_target_serde_tagged() {
        let t = ValidationTarget::Subnet {
            subnet_id: "s".to_string(),
            blockchain_id: "b".to_string(),
        };
        let json = serde_json::to_value(&t).unwrap();
        assert_eq!(json["kind"], "subnet");
        assert_eq!(t.to_string(), "subnet s");
    }

    #[test]
    fn test_stake_terms_end_time() {
        let terms = StakeTerms {
            weight: 20,
            start_time: 1_000,
            duration: Duration::from_secs(86_400),
            delegation_fee: 20_000,
        };
        assert_eq!(terms.end_time(), 87_400);
    }
}
