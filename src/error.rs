//! Error types for the transaction lifecycle engine

use crate::tx::BlockReference;

use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by a ledger client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// The request never got a JSON-RPC answer (connection, timeout, decode)
    #[error("transport error: {0}")]
    Transport(String),

    /// The node answered with a JSON-RPC error
    #[error("rejected: {0}")]
    Rejected(String),

    /// Simulated execution reverted
    #[error("execution reverted: {0}")]
    Reverted(String),
}

impl ChainError {
    pub fn message(&self) -> &str {
        match self {
            ChainError::Transport(m) | ChainError::Rejected(m) | ChainError::Reverted(m) => m,
        }
    }
}

/// Classified network rejection of a signed transaction
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum SubmissionError {
    #[error("nonce too low")]
    NonceTooLow,

    #[error("transaction underpriced")]
    Underpriced,

    #[error("insufficient funds for gas * price + value")]
    InsufficientFunds,

    #[error("unclassified rejection: {0}")]
    Unknown(String),
}

impl SubmissionError {
    /// Map a node's rejection message onto the submission taxonomy
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();

        if lower.contains("nonce too low")
            || lower.contains("nonce is too low")
            || lower.contains("nonce has already been used")
        {
            SubmissionError::NonceTooLow
        } else if lower.contains("underpriced")
            || lower.contains("fee too low")
            || lower.contains("less than block base fee")
        {
            SubmissionError::Underpriced
        } else if lower.contains("insufficient funds") {
            SubmissionError::InsufficientFunds
        } else {
            SubmissionError::Unknown(message.to_string())
        }
    }

    /// Nodes answer this way when the exact payload is already in their pool
    pub fn is_already_known(message: &str) -> bool {
        let lower = message.to_lowercase();
        lower.contains("already known") || lower.contains("known transaction")
    }

    pub fn label(&self) -> &'static str {
        match self {
            SubmissionError::NonceTooLow => "nonce_too_low",
            SubmissionError::Underpriced => "underpriced",
            SubmissionError::InsufficientFunds => "insufficient_funds",
            SubmissionError::Unknown(_) => "unknown",
        }
    }
}

/// A caller-declared check that the confirmed receipt did not satisfy
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VerificationFailure {
    #[error("expected event {signature:?} not found in receipt logs")]
    MissingEvent { signature: H256 },

    #[error("state check {check} mismatch: expected {expected}, got {actual:?}")]
    StateMismatch {
        check: usize,
        expected: Bytes,
        actual: Option<Bytes>,
        detail: Option<String>,
    },
}

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Gas estimation reverted: {reason}")]
    Estimation { reason: String },

    #[error("Submission rejected at nonce {nonce}: {source}")]
    Submission {
        nonce: u64,
        #[source]
        source: SubmissionError,
    },

    #[error("Submission exhausted after {attempts} attempts at nonce {nonce}")]
    SubmissionExhausted { nonce: u64, attempts: u32 },

    #[error("No progress for {tx_hash:?} within {waited_secs}s")]
    ConfirmationTimeout { tx_hash: H256, waited_secs: u64 },

    #[error("Reorg detected: inclusion block {block} displaced (now {observed:?})")]
    ReorgDetected {
        block: BlockReference,
        observed: Option<H256>,
    },

    #[error("Execution reverted for {tx_hash:?} in block {block} (gas used {gas_used})")]
    ExecutionReverted {
        tx_hash: H256,
        block: BlockReference,
        gas_used: U256,
    },

    #[error("Verification failed: {0}")]
    VerificationFailed(VerificationFailure),

    #[error("Nonce error for {account:?}: {message}")]
    Nonce { account: Address, message: String },

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Transaction {id} not found")]
    TransactionNotFound { id: Uuid },

    #[error("Lost track of transaction {id} after {errors} consecutive poll errors")]
    TrackingLost { id: Uuid, errors: u32 },

    #[error("Watch for transaction {id} was stopped")]
    WatchCancelled { id: Uuid },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Wrap a client error that is not tied to a specific submission
    pub fn chain(chain_id: u64, err: ChainError) -> Self {
        match err {
            ChainError::Reverted(reason) => EngineError::Estimation { reason },
            other => EngineError::ChainConnection {
                chain_id,
                message: other.to_string(),
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::ChainConnection { .. }
            | EngineError::ConfirmationTimeout { .. }
            | EngineError::ReorgDetected { .. } => true,
            EngineError::Submission { source, .. } => matches!(
                source,
                SubmissionError::NonceTooLow | SubmissionError::Underpriced
            ),
            _ => false,
        }
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            EngineError::Submission {
                source: SubmissionError::InsufficientFunds,
                ..
            } | EngineError::SubmissionExhausted { .. }
                | EngineError::ReorgDetected { .. }
                | EngineError::TrackingLost { .. }
                | EngineError::Nonce { .. }
                | EngineError::Signer(_)
        )
    }

    /// Short label used for metrics
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "config",
            EngineError::Database(_) => "database",
            EngineError::ChainConnection { .. } => "chain_connection",
            EngineError::Estimation { .. } => "estimation",
            EngineError::Submission { .. } => "submission",
            EngineError::SubmissionExhausted { .. } => "submission_exhausted",
            EngineError::ConfirmationTimeout { .. } => "confirmation_timeout",
            EngineError::ReorgDetected { .. } => "reorg",
            EngineError::ExecutionReverted { .. } => "execution_reverted",
            EngineError::VerificationFailed(_) => "verification_failed",
            EngineError::Nonce { .. } => "nonce",
            EngineError::Signer(_) => "signer",
            EngineError::InvalidStateTransition { .. } => "invalid_transition",
            EngineError::InvalidAction(_) => "invalid_action",
            EngineError::TransactionNotFound { .. } => "not_found",
            EngineError::TrackingLost { .. } => "tracking_lost",
            EngineError::WatchCancelled { .. } => "watch_cancelled",
            EngineError::Internal(_) => "internal",
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
