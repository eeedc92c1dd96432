//! Confirmation, retry and verification policies

use crate::chain::ReadCall;

use ethers::types::{Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::time::Duration;

/// Depth for negligible-value actions
pub const CONFIRMATIONS_NEGLIGIBLE: u64 = 1;
/// Depth for ordinary transfers
pub const CONFIRMATIONS_ORDINARY: u64 = 3;
/// Depth for contract state changes of consequence
pub const CONFIRMATIONS_CONTRACT: u64 = 6;
/// Depth for large-value or irreversible actions
pub const CONFIRMATIONS_LARGE: u64 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationPolicy {
    pub required_confirmations: u64,
    /// Pending longer than this escalates to stuck handling
    pub timeout: Duration,
    pub poll_interval: Duration,
}

/// Value thresholds that pick the default confirmation depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationTiers {
    pub negligible_value: U256,
    pub large_value: U256,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl ConfirmationTiers {
    pub fn depth_for(&self, value: U256, data: &Bytes) -> u64 {
        if value >= self.large_value {
            CONFIRMATIONS_LARGE
        } else if !data.is_empty() {
            CONFIRMATIONS_CONTRACT
        } else if value <= self.negligible_value {
            CONFIRMATIONS_NEGLIGIBLE
        } else {
            CONFIRMATIONS_ORDINARY
        }
    }

    /// Caller-supplied depth wins over the tier table
    pub fn policy_for(&self, value: U256, data: &Bytes, explicit: Option<u64>) -> ConfirmationPolicy {
        ConfirmationPolicy {
            required_confirmations: explicit.unwrap_or_else(|| self.depth_for(value, data)),
            timeout: self.timeout,
            poll_interval: self.poll_interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Gas price multiplier in percent (120 = x1.2)
    pub bump_percent: u64,
    /// Broadcast attempts allowed per record, original included
    pub max_attempts: u32,
    pub backoff: Vec<Duration>,
    pub max_poll_errors: u32,
}

impl RetryPolicy {
    /// Delay before retry number `step` (0-based); the last entry repeats
    pub fn delay(&self, step: u32) -> Duration {
        if self.backoff.is_empty() {
            return Duration::ZERO;
        }
        let idx = (step as usize).min(self.backoff.len() - 1);
        self.backoff[idx]
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            bump_percent: 120,
            max_attempts: 5,
            backoff: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
            ],
            max_poll_errors: 20,
        }
    }
}

/// What to do with a transaction stuck in the mempool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StuckAction {
    Accelerate,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpectedEvent {
    pub topic: H256,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ExpectedEvent {
    pub fn topic(topic: H256) -> Self {
        Self {
            topic,
            signature: None,
        }
    }

    /// Hash a canonical event signature such as `Transfer(address,address,uint256)`
    pub fn from_signature(signature: &str) -> Self {
        let digest = Keccak256::digest(signature.as_bytes());
        Self {
            topic: H256::from_slice(&digest),
            signature: Some(signature.to_string()),
        }
    }
}

/// Read-only call whose result must equal `expected` after inclusion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCheck {
    pub call: ReadCall,
    pub expected: Bytes,
}

/// Caller-declared expectations for a confirmed receipt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSpec {
    #[serde(default)]
    pub events: Vec<ExpectedEvent>,
    /// Require `events` to appear in declaration order
    #[serde(default)]
    pub ordered: bool,
    #[serde(default)]
    pub state: Vec<StateCheck>,
}

impl VerificationSpec {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.state.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn tiers() -> ConfirmationTiers {
        ConfirmationTiers {
            negligible_value: U256::from(1_000u64),
            large_value: U256::from(1_000_000u64),
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(3),
        }
    }

    #[test]
    fn tiers_follow_value_and_payload() {
        let tiers = tiers();
        let empty = Bytes::default();
        let call = Bytes::from(vec![0xa9, 0x05, 0x9c, 0xbb]);

        assert_eq!(tiers.depth_for(U256::from(10u64), &empty), 1);
        assert_eq!(tiers.depth_for(U256::from(50_000u64), &empty), 3);
        assert_eq!(tiers.depth_for(U256::zero(), &call), 6);
        assert_eq!(tiers.depth_for(U256::from(2_000_000u64), &call), 12);
        assert_eq!(
            tiers
                .policy_for(U256::zero(), &empty, Some(9))
                .required_confirmations,
            9
        );
    }

    #[test]
    fn transfer_signature_hash() {
        let event = ExpectedEvent::from_signature("Transfer(address,address,uint256)");
        let expected =
            H256::from_str("0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef")
                .unwrap();
        assert_eq!(event.topic, expected);
    }

    #[test]
    fn backoff_repeats_last_step() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(5));
        assert_eq!(policy.delay(10), Duration::from_secs(5));
    }
}
