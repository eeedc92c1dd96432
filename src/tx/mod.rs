//! Transaction construction and submission
//!
//! Records, policies, nonce allocation, signing and broadcast. Everything
//! after the first accepted broadcast lives in `monitor`.

pub mod broadcaster;
pub mod builder;
pub mod gas;
pub mod nonce;
pub mod policy;
pub mod record;
pub mod signer;

pub use broadcaster::Broadcaster;
pub use builder::{TransactionBuilder, TransactionIntent};
pub use nonce::NonceAllocator;
pub use policy::{
    ConfirmationPolicy, ConfirmationTiers, ExpectedEvent, RetryPolicy, StateCheck, StuckAction,
    VerificationSpec,
};
pub use record::{
    Attempt, AttemptKind, AttemptStatus, BlockReference, GasPrice, TransactionRecord,
    TransactionRequest, TxStatus,
};
pub use signer::{LocalSigner, SignedTransaction, Signers, TransactionSigner};
