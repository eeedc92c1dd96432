//! Ethers-backed ledger client with multi-RPC support and automatic failover

use super::{call_each, BlockHeader, CallRequest, LedgerClient, LogEntry, ReadCall, Receipt};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{ChainError, EngineError, EngineResult};
use crate::tx::{BlockReference, GasPrice};

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::prelude::*;
use ethers::providers::{Http, Provider, ProviderError, RpcError};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

const AGGREGATE3_SIGNATURE: &str = "aggregate3((address,bool,bytes)[])";

/// JSON-RPC error code geth uses for reverted `eth_call`/`eth_estimateGas`
const EXECUTION_REVERTED_CODE: i64 = 3;

/// Multi-provider client with automatic failover
pub struct EthersLedger {
    chain_id: u64,
    /// HTTP providers (multiple for failover)
    providers: Vec<Provider<Http>>,
    /// Current active provider index
    current: AtomicUsize,
    strategy: GasPriceStrategy,
    max_gas_price: U256,
    priority_fee: U256,
    multicall: Option<Address>,
    request_timeout: Duration,
}

impl EthersLedger {
    pub fn new(config: &ChainConfig) -> EngineResult<Self> {
        let mut providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if providers.is_empty() {
            return Err(EngineError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        let multicall = config
            .multicall_address
            .as_deref()
            .map(str::parse::<Address>)
            .transpose()
            .map_err(|e| EngineError::Config(format!("Invalid multicall address: {}", e)))?;

        Ok(Self {
            chain_id: config.chain_id,
            providers,
            current: AtomicUsize::new(0),
            strategy: config.gas_price_strategy.clone(),
            max_gas_price: gwei(config.max_gas_price_gwei),
            priority_fee: gwei(config.priority_fee_gwei),
            multicall,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    fn http(&self) -> Provider<Http> {
        let idx = self.current.load(Ordering::Relaxed);
        self.providers[idx % self.providers.len()].clone()
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    /// Run `op` against the active provider, rotating on transport errors only.
    /// JSON-RPC answers (rejections, reverts) come from the chain and are returned as-is.
    async fn with_failover<T, F, Fut>(&self, what: &str, op: F) -> Result<T, ChainError>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut last = ChainError::Transport("no providers".to_string());

        for _ in 0..self.providers.len() {
            let result = tokio::time::timeout(self.request_timeout, op(self.http())).await;
            let err = match result {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => map_provider_error(e),
                Err(_) => ChainError::Transport(format!("{} timed out", what)),
            };

            match err {
                ChainError::Transport(_) => {
                    warn!("{} failed on chain {}: {}", what, self.chain_id, err);
                    last = err;
                    self.failover();
                }
                other => return Err(other),
            }
        }

        Err(last)
    }

    async fn estimate_eip1559_fees(&self) -> Result<GasPrice, ChainError> {
        let block = self
            .with_failover("get_block", |p| async move { p.get_block(BlockNumber::Latest).await })
            .await?
            .ok_or_else(|| ChainError::Transport("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| ChainError::Rejected("No base fee in block".to_string()))?;

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee
            .saturating_mul(U256::from(2u64))
            .saturating_add(self.priority_fee)
            .min(self.max_gas_price);

        Ok(GasPrice::Eip1559 {
            max_fee_per_gas: max_fee,
            max_priority_fee_per_gas: self.priority_fee.min(max_fee),
        })
    }
}

#[async_trait]
impl LedgerClient for EthersLedger {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn transaction_count(&self, account: Address) -> Result<u64, ChainError> {
        let count = self
            .with_failover("get_transaction_count", |p| async move {
                p.get_transaction_count(account, Some(BlockNumber::Pending.into()))
                    .await
            })
            .await?;
        Ok(count.as_u64())
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<U256, ChainError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(call.from)
            .to(call.to)
            .value(call.value)
            .data(call.data.clone())
            .into();

        self.with_failover("estimate_gas", |p| {
            let tx = tx.clone();
            async move { p.estimate_gas(&tx, None).await }
        })
        .await
    }

    async fn gas_price(&self) -> Result<GasPrice, ChainError> {
        match self.strategy {
            GasPriceStrategy::Legacy | GasPriceStrategy::Arbitrum => {
                let price = self
                    .with_failover("get_gas_price", |p| async move { p.get_gas_price().await })
                    .await?;
                Ok(GasPrice::Legacy(price.min(self.max_gas_price)))
            }
            GasPriceStrategy::Eip1559 | GasPriceStrategy::Optimism => {
                self.estimate_eip1559_fees().await
            }
        }
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, ChainError> {
        self.with_failover("send_raw_transaction", |p| {
            let raw = raw.clone();
            async move { p.send_raw_transaction(raw).await.map(|pending| pending.tx_hash()) }
        })
        .await
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<Receipt>, ChainError> {
        let receipt = self
            .with_failover("get_transaction_receipt", |p| async move {
                p.get_transaction_receipt(hash).await
            })
            .await?;
        Ok(receipt.and_then(convert_receipt))
    }

    async fn block_number(&self) -> Result<u64, ChainError> {
        let number = self
            .with_failover("get_block_number", |p| async move { p.get_block_number().await })
            .await?;
        Ok(number.as_u64())
    }

    async fn block(&self, number: u64) -> Result<Option<BlockHeader>, ChainError> {
        let block = self
            .with_failover("get_block", |p| async move { p.get_block(number).await })
            .await?;

        Ok(block.and_then(|b| {
            Some(BlockHeader {
                number: b.number?.as_u64(),
                hash: b.hash?,
                parent_hash: b.parent_hash,
            })
        }))
    }

    async fn call(&self, call: &ReadCall) -> Result<Bytes, ChainError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(call.to)
            .data(call.data.clone())
            .into();
        let block = call.block.map(BlockId::from);

        self.with_failover("call", |p| {
            let tx = tx.clone();
            async move { p.call(&tx, block).await }
        })
        .await
    }

    async fn call_batch(
        &self,
        calls: &[ReadCall],
    ) -> Result<Vec<Result<Bytes, ChainError>>, ChainError> {
        let same_block = calls.windows(2).all(|w| w[0].block == w[1].block);
        let multicall = match self.multicall {
            Some(address) if calls.len() > 1 && same_block => address,
            _ => return Ok(call_each(self, calls).await),
        };

        let aggregate = ReadCall {
            to: multicall,
            data: encode_aggregate3(calls),
            block: calls[0].block,
        };
        let raw = self.call(&aggregate).await?;
        decode_aggregate3(&raw, calls.len())
    }
}

fn gwei(amount: u64) -> U256 {
    U256::from(amount) * U256::exp10(9)
}

fn map_provider_error(err: ProviderError) -> ChainError {
    if let Some(response) = RpcError::as_error_response(&err) {
        let message = response.message.clone();
        if response.code == EXECUTION_REVERTED_CODE || message.to_lowercase().contains("revert") {
            return ChainError::Reverted(message);
        }
        return ChainError::Rejected(message);
    }
    ChainError::Transport(err.to_string())
}

fn convert_receipt(receipt: TransactionReceipt) -> Option<Receipt> {
    let block = BlockReference {
        number: receipt.block_number?.as_u64(),
        hash: receipt.block_hash?,
    };

    Some(Receipt {
        tx_hash: receipt.transaction_hash,
        block,
        // pre-Byzantium receipts carry no status
        success: receipt.status.map(|s| s.as_u64() == 1).unwrap_or(true),
        gas_used: receipt.gas_used.unwrap_or_default(),
        logs: receipt
            .logs
            .into_iter()
            .map(|log| LogEntry {
                address: log.address,
                topics: log.topics,
                data: log.data,
            })
            .collect(),
    })
}

/// Multicall3 `aggregate3` with `allowFailure = true` on every call
fn encode_aggregate3(calls: &[ReadCall]) -> Bytes {
    let entries = calls
        .iter()
        .map(|call| {
            Token::Tuple(vec![
                Token::Address(call.to),
                Token::Bool(true),
                Token::Bytes(call.data.to_vec()),
            ])
        })
        .collect();

    let mut data = ethers::utils::id(AGGREGATE3_SIGNATURE).to_vec();
    data.extend(abi::encode(&[Token::Array(entries)]));
    Bytes::from(data)
}

fn decode_aggregate3(
    raw: &Bytes,
    expected: usize,
) -> Result<Vec<Result<Bytes, ChainError>>, ChainError> {
    let malformed = |detail: String| ChainError::Transport(format!("malformed multicall response: {}", detail));

    let result_type = ParamType::Array(Box::new(ParamType::Tuple(vec![
        ParamType::Bool,
        ParamType::Bytes,
    ])));
    let mut tokens = abi::decode(&[result_type], raw.as_ref()).map_err(|e| malformed(e.to_string()))?;

    let items = match tokens.pop() {
        Some(Token::Array(items)) => items,
        _ => return Err(malformed("expected result array".to_string())),
    };
    if items.len() != expected {
        return Err(malformed(format!("{} results for {} calls", items.len(), expected)));
    }

    Ok(items
        .into_iter()
        .map(|item| match item {
            Token::Tuple(fields) => match fields.as_slice() {
                [Token::Bool(true), Token::Bytes(data)] => Ok(Bytes::from(data.clone())),
                [Token::Bool(false), Token::Bytes(data)] => {
                    Err(ChainError::Reverted(format!("0x{}", hex::encode(data))))
                }
                _ => Err(malformed("unexpected result fields".to_string())),
            },
            _ => Err(malformed("unexpected result entry".to_string())),
        })
        .collect())
}
