//! Execution verification for mined receipts
//!
//! A successful status only says the call did not revert. Declared
//! expectations (events in the logs, contract state after the inclusion
//! block) are checked here, and receipts that burned nearly all their gas
//! are flagged as possibly incomplete.

use crate::chain::Receipt;
use crate::error::{ChainError, EngineError, EngineResult, VerificationFailure};
use crate::reader::BatchReader;
use crate::tx::{ExpectedEvent, VerificationSpec};

use ethers::types::{H256, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Gas used at or above this share of the limit (in basis points) is suspicious
pub const DEFAULT_GAS_WARNING_BPS: u64 = 9_500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionWarning {
    /// Ran out of (almost) all gas; inner calls may have failed silently
    PossiblyIncomplete { gas_used: U256, gas_limit: U256 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub warnings: Vec<ExecutionWarning>,
    pub failure: Option<VerificationFailure>,
}

pub struct ExecutionVerifier {
    reader: Arc<BatchReader>,
    gas_warning_bps: u64,
}

impl ExecutionVerifier {
    pub fn new(reader: Arc<BatchReader>, gas_warning_bps: u64) -> Self {
        Self {
            reader,
            gas_warning_bps,
        }
    }

    /// A receipt with a failed status is a revert, whatever else it says
    pub fn check_status(&self, receipt: &Receipt) -> EngineResult<()> {
        if receipt.success {
            return Ok(());
        }
        Err(EngineError::ExecutionReverted {
            tx_hash: receipt.tx_hash,
            block: receipt.block,
            gas_used: receipt.gas_used,
        })
    }

    /// Run every declared check against a successful receipt. Err means the
    /// checks could not be run at all and should be retried on the next poll.
    pub async fn verify(
        &self,
        receipt: &Receipt,
        gas_limit: U256,
        spec: Option<&VerificationSpec>,
    ) -> Result<VerificationReport, ChainError> {
        let mut report = VerificationReport {
            warnings: self.gas_warnings(receipt, gas_limit),
            failure: None,
        };

        let spec = match spec {
            Some(spec) if !spec.is_empty() => spec,
            _ => return Ok(report),
        };

        if let Some(missing) = missing_event(receipt, &spec.events, spec.ordered) {
            warn!("Receipt {:?} is missing event {:?}", receipt.tx_hash, missing);
            report.failure = Some(VerificationFailure::MissingEvent { signature: missing });
            return Ok(report);
        }

        if !spec.state.is_empty() {
            let calls: Vec<_> = spec
                .state
                .iter()
                .map(|check| check.call.clone().at_block(receipt.block.number))
                .collect();
            let results = self.reader.aggregate(&calls).await?;

            for (idx, (check, result)) in spec.state.iter().zip(results).enumerate() {
                let failure = match result {
                    Ok(actual) if actual == check.expected => continue,
                    Ok(actual) => VerificationFailure::StateMismatch {
                        check: idx,
                        expected: check.expected.clone(),
                        actual: Some(actual),
                        detail: None,
                    },
                    Err(e) => VerificationFailure::StateMismatch {
                        check: idx,
                        expected: check.expected.clone(),
                        actual: None,
                        detail: Some(e.to_string()),
                    },
                };
                warn!("State check {} failed for {:?}: {}", idx, receipt.tx_hash, failure);
                report.failure = Some(failure);
                break;
            }
        }

        debug!(
            "Verified {:?}: {} warnings, failure={}",
            receipt.tx_hash,
            report.warnings.len(),
            report.failure.is_some()
        );
        Ok(report)
    }

    fn gas_warnings(&self, receipt: &Receipt, gas_limit: U256) -> Vec<ExecutionWarning> {
        if gas_limit.is_zero() {
            return Vec::new();
        }
        let used = receipt.gas_used.saturating_mul(U256::from(10_000u64));
        let threshold = gas_limit.saturating_mul(U256::from(self.gas_warning_bps));
        if used >= threshold {
            vec![ExecutionWarning::PossiblyIncomplete {
                gas_used: receipt.gas_used,
                gas_limit,
            }]
        } else {
            Vec::new()
        }
    }
}

/// First expected topic not found in the logs. In ordered mode the expected
/// topics must appear as a subsequence of the emitted ones.
fn missing_event(receipt: &Receipt, expected: &[ExpectedEvent], ordered: bool) -> Option<H256> {
    let emitted: Vec<H256> = receipt
        .logs
        .iter()
        .filter_map(|log| log.topics.first().copied())
        .collect();

    if !ordered {
        return expected
            .iter()
            .map(|e| e.topic)
            .find(|topic| !emitted.contains(topic));
    }

    let mut cursor = 0;
    for event in expected {
        match emitted[cursor..].iter().position(|t| *t == event.topic) {
            Some(offset) => cursor += offset + 1,
            None => return Some(event.topic),
        }
    }
    None
}
