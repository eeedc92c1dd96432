//! Post-broadcast monitoring: confirmation, stuck handling and verification

pub mod stuck;
pub mod tracker;
pub mod verifier;

pub use stuck::StuckTransactionHandler;
pub use tracker::{ConfirmationTracker, Watch, WatchControl, WatchRequest};
pub use verifier::{ExecutionVerifier, ExecutionWarning, VerificationReport, DEFAULT_GAS_WARNING_BPS};

use crate::chain::Receipt;
use crate::error::VerificationFailure;
use crate::tx::TransactionRecord;

use serde::{Deserialize, Serialize};

/// What a settled watch reports back to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOutcome {
    pub record: TransactionRecord,
    pub receipt: Option<Receipt>,
    pub warnings: Vec<ExecutionWarning>,
    /// Set when the chain confirmed the transaction but a declared check failed
    pub verification: Option<VerificationFailure>,
}

impl TxOutcome {
    pub fn is_verified(&self) -> bool {
        self.verification.is_none()
    }
}
