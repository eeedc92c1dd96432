//! Assembles unsigned requests from caller intent and live network estimates

use super::gas::{buffered_gas_limit, max_cost};
use super::nonce::NonceAllocator;
use super::policy::{StuckAction, VerificationSpec};
use super::record::{GasPrice, TransactionRequest};
use crate::chain::{CallRequest, SharedLedger};
use crate::error::{ChainError, EngineError, EngineResult};

use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// What the caller wants done
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionIntent {
    /// Defaults to the engine's primary signer
    #[serde(default)]
    pub from: Option<Address>,
    pub to: Address,
    #[serde(default)]
    pub value: U256,
    #[serde(default)]
    pub data: Bytes,
    #[serde(default)]
    pub gas_limit: Option<U256>,
    #[serde(default)]
    pub gas_price: Option<GasPrice>,
    #[serde(default)]
    pub confirmations: Option<u64>,
    #[serde(default)]
    pub verification: Option<VerificationSpec>,
    #[serde(default)]
    pub stuck_action: Option<StuckAction>,
}

pub struct TransactionBuilder {
    client: SharedLedger,
    nonces: Arc<NonceAllocator>,
    gas_limit_buffer_percent: u64,
}

impl TransactionBuilder {
    pub fn new(client: SharedLedger, nonces: Arc<NonceAllocator>, gas_limit_buffer_percent: u64) -> Self {
        Self {
            client,
            nonces,
            gas_limit_buffer_percent,
        }
    }

    /// Reserve a nonce and fill in gas parameters. On failure the nonce is released.
    pub async fn build(&self, from: Address, intent: &TransactionIntent) -> EngineResult<TransactionRequest> {
        let nonce = self.nonces.reserve(from).await?;

        match self.assemble(from, intent, nonce).await {
            Ok(request) => Ok(request),
            Err(e) => {
                if let Err(release_err) = self.nonces.release(from, nonce).await {
                    warn!("Failed to release nonce {} after build error: {}", nonce, release_err);
                }
                Err(e)
            }
        }
    }

    async fn assemble(&self, from: Address, intent: &TransactionIntent, nonce: u64) -> EngineResult<TransactionRequest> {
        let gas_limit = match intent.gas_limit {
            Some(limit) => limit,
            None => {
                let call = CallRequest {
                    from,
                    to: intent.to,
                    value: intent.value,
                    data: intent.data.clone(),
                };
                let estimate = self
                    .client
                    .estimate_gas(&call)
                    .await
                    .map_err(|e| self.estimation_error(e))?;
                buffered_gas_limit(estimate, self.gas_limit_buffer_percent)
            }
        };

        let gas_price = match intent.gas_price {
            Some(price) => price,
            None => self.current_gas_price().await?,
        };

        let cost = max_cost(gas_limit, &gas_price)
            .and_then(|fees| fees.checked_add(intent.value))
            .ok_or_else(|| {
                EngineError::InvalidAction(format!(
                    "gas limit {} at {} wei per gas plus value {} overflows",
                    gas_limit,
                    gas_price.ceiling(),
                    intent.value
                ))
            })?;

        debug!(
            "Built request from {:?} nonce {} gas {} (max cost {} wei)",
            from, nonce, gas_limit, cost
        );

        Ok(TransactionRequest {
            chain_id: self.client.chain_id(),
            from,
            to: intent.to,
            value: intent.value,
            data: intent.data.clone(),
            gas_limit,
            gas_price,
            nonce,
        })
    }

    pub async fn current_gas_price(&self) -> EngineResult<GasPrice> {
        self.client
            .gas_price()
            .await
            .map_err(|e| EngineError::chain(self.client.chain_id(), e))
    }

    /// A simulation the node refused to run is as fatal as one that reverted
    fn estimation_error(&self, err: ChainError) -> EngineError {
        match err {
            ChainError::Reverted(reason) | ChainError::Rejected(reason) => EngineError::Estimation { reason },
            transport => EngineError::chain(self.client.chain_id(), transport),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLedger;

    fn sender() -> Address {
        Address::repeat_byte(0x11)
    }

    fn setup() -> (Arc<FakeLedger>, Arc<NonceAllocator>, TransactionBuilder) {
        let ledger = Arc::new(FakeLedger::new(1));
        ledger.set_account_nonce(sender(), 4);
        let nonces = Arc::new(NonceAllocator::new(ledger.clone()));
        let builder = TransactionBuilder::new(ledger.clone(), nonces.clone(), 20);
        (ledger, nonces, builder)
    }

    fn intent() -> TransactionIntent {
        TransactionIntent {
            to: Address::repeat_byte(0x22),
            value: U256::from(10u64),
            data: Bytes::from(vec![0xa9, 0x05, 0x9c, 0xbb]),
            ..Default::default()
        }
    }

    #[test]
    fn intent_parses_from_api_json() {
        let intent: TransactionIntent = serde_json::from_value(serde_json::json!({
            "to": format!("{:?}", Address::repeat_byte(0x22)),
            "value": "0x5",
            "gas_limit": "0x5208",
            "gas_price": { "type": "legacy", "value": "0x3b9aca00" },
            "confirmations": 2,
            "stuck_action": "cancel",
        }))
        .unwrap();
        assert_eq!(intent.gas_limit, Some(U256::from(21_000u64)));
        assert_eq!(intent.gas_price, Some(GasPrice::Legacy(U256::from(1_000_000_000u64))));
        assert_eq!(intent.stuck_action, Some(StuckAction::Cancel));
        assert_eq!(intent.from, None);

        let raw = serde_json::to_string(&intent).unwrap();
        assert_eq!(serde_json::from_str::<TransactionIntent>(&raw).unwrap(), intent);
    }

    #[tokio::test]
    async fn applies_buffer_and_network_price() {
        let (ledger, _, builder) = setup();
        ledger.set_estimate(Ok(U256::from(100_000u64)));
        ledger.set_gas_price(GasPrice::Legacy(U256::from(7u64)));

        let request = builder.build(sender(), &intent()).await.unwrap();
        assert_eq!(request.nonce, 4);
        assert_eq!(request.gas_limit, U256::from(120_000u64));
        assert_eq!(request.gas_price, GasPrice::Legacy(U256::from(7u64)));
        assert_eq!(request.chain_id, 1);
    }

    #[tokio::test]
    async fn caller_overrides_skip_estimation() {
        let (ledger, _, builder) = setup();
        ledger.set_estimate(Err(ChainError::Reverted("should not be called".into())));

        let intent = TransactionIntent {
            gas_limit: Some(U256::from(55_000u64)),
            gas_price: Some(GasPrice::Legacy(U256::from(9u64))),
            ..intent()
        };
        let request = builder.build(sender(), &intent).await.unwrap();
        assert_eq!(request.gas_limit, U256::from(55_000u64));
        assert_eq!(request.gas_price, GasPrice::Legacy(U256::from(9u64)));
    }

    #[tokio::test]
    async fn overflowing_caller_gas_is_rejected_and_frees_the_nonce() {
        let (_, nonces, builder) = setup();

        let intent = TransactionIntent {
            gas_limit: Some(U256::MAX),
            gas_price: Some(GasPrice::Legacy(U256::from(2u64))),
            ..intent()
        };
        let err = builder.build(sender(), &intent).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidAction(_)));
        assert!(nonces.in_flight(sender()).await.is_empty());
    }

    #[tokio::test]
    async fn revert_during_estimation_releases_the_nonce() {
        let (ledger, nonces, builder) = setup();
        ledger.set_estimate(Err(ChainError::Reverted("ERC20: transfer amount exceeds balance".into())));

        let err = builder.build(sender(), &intent()).await.unwrap_err();
        assert!(matches!(err, EngineError::Estimation { .. }));
        assert!(nonces.in_flight(sender()).await.is_empty());

        ledger.set_estimate(Ok(U256::from(21_000u64)));
        let request = builder.build(sender(), &intent()).await.unwrap();
        assert_eq!(request.nonce, 4);
    }
}
