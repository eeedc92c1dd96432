//! Chain module - the network client surface the engine runs against
//!
//! This module provides:
//! - The `LedgerClient` capability trait every component is constructed with
//! - An ethers-backed client with multi-RPC failover and multicall batching
//! - Block hash tracking for reorg detection

pub mod provider;
pub mod reorg;

pub use provider::EthersLedger;
pub use reorg::{ReorgCheck, ReorgMonitor};

use crate::error::ChainError;
use crate::tx::{BlockReference, GasPrice};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Transaction-shaped input for gas estimation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequest {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

/// Read-only contract call, optionally pinned to a block
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadCall {
    pub to: Address,
    pub data: Bytes,
    #[serde(default)]
    pub block: Option<u64>,
}

impl ReadCall {
    pub fn new(to: Address, data: impl Into<Bytes>) -> Self {
        Self {
            to,
            data: data.into(),
            block: None,
        }
    }

    pub fn at_block(mut self, block: u64) -> Self {
        self.block = Some(block);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Bytes,
}

/// Outcome of a mined transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: H256,
    pub block: BlockReference,
    pub success: bool,
    pub gas_used: U256,
    pub logs: Vec<LogEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
}

/// Primitives the engine needs from an RPC-style ledger
#[async_trait]
pub trait LedgerClient: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Transaction count including the node's pending pool
    async fn transaction_count(&self, account: Address) -> Result<u64, ChainError>;

    /// Fails with `ChainError::Reverted` when simulated execution reverts
    async fn estimate_gas(&self, call: &CallRequest) -> Result<U256, ChainError>;

    async fn gas_price(&self) -> Result<GasPrice, ChainError>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ChainError>;

    /// `None` while the transaction is not in a block
    async fn transaction_receipt(&self, hash: H256) -> Result<Option<Receipt>, ChainError>;

    async fn block_number(&self) -> Result<u64, ChainError>;

    async fn block(&self, number: u64) -> Result<Option<BlockHeader>, ChainError>;

    async fn call(&self, call: &ReadCall) -> Result<Bytes, ChainError>;

    /// Several independent reads; one failing call never fails the others.
    /// The outer error is reserved for the batch transport itself.
    async fn call_batch(
        &self,
        calls: &[ReadCall],
    ) -> Result<Vec<Result<Bytes, ChainError>>, ChainError> {
        Ok(call_each(self, calls).await)
    }
}

/// Shared client handle threaded through every component
pub type SharedLedger = Arc<dyn LedgerClient>;

/// Issue `calls` concurrently, one request each
pub async fn call_each<C>(client: &C, calls: &[ReadCall]) -> Vec<Result<Bytes, ChainError>>
where
    C: LedgerClient + ?Sized,
{
    join_all(calls.iter().map(|call| client.call(call))).await
}
