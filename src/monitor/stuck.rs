//! Stuck transaction handling: acceleration and cancellation
//!
//! Both actions replace the pending nonce with a higher-priced payload.
//! Acceleration resends the same call; cancellation sends a zero-value
//! self-transfer that consumes the nonce without executing anything.

use crate::chain::SharedLedger;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventKind};
use crate::tx::gas::replacement_price;
use crate::tx::{
    AttemptKind, Broadcaster, NonceAllocator, RetryPolicy, StuckAction, TransactionRecord, TxStatus,
};

use ethers::types::H256;
use std::sync::Arc;
use tracing::{error, info};

pub struct StuckTransactionHandler {
    client: SharedLedger,
    broadcaster: Arc<Broadcaster>,
    nonces: Arc<NonceAllocator>,
    events: EventBus,
    retry: RetryPolicy,
}

impl StuckTransactionHandler {
    pub fn new(
        client: SharedLedger,
        broadcaster: Arc<Broadcaster>,
        nonces: Arc<NonceAllocator>,
        events: EventBus,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            broadcaster,
            nonces,
            events,
            retry,
        }
    }

    /// Replace the record's pending attempt. Returns the new attempt's hash.
    pub async fn handle(&self, record: &mut TransactionRecord, action: StuckAction) -> EngineResult<H256> {
        if record.status != TxStatus::Pending {
            return Err(EngineError::InvalidAction(format!(
                "transaction {} is {}, only pending transactions can be replaced",
                record.id, record.status
            )));
        }
        if action == StuckAction::Accelerate && record.is_cancelling() {
            return Err(EngineError::InvalidAction(format!(
                "transaction {} is being cancelled",
                record.id
            )));
        }

        if record.attempt_count() >= self.retry.max_attempts {
            return self.exhaust(record).await;
        }

        let replaces = record.tx_hash().unwrap_or_default();
        let prior = record
            .latest_attempt()
            .map(|a| a.gas_price)
            .unwrap_or(record.request.gas_price);
        let network = self.client.gas_price().await.ok();
        let price = replacement_price(&prior, network.as_ref(), self.retry.bump_percent);
        let chain_id = self.client.chain_id();

        match action {
            StuckAction::Accelerate => {
                let request = record.request.with_gas_price(price);
                let tx_hash = self
                    .broadcaster
                    .replace(record, AttemptKind::Accelerated, request)
                    .await?;

                info!(
                    "Accelerated {} at nonce {}: {:?} replaces {:?}",
                    record.id,
                    record.nonce(),
                    tx_hash,
                    replaces
                );
                crate::metrics::record_acceleration(chain_id);
                self.events.emit(
                    record.id,
                    EventKind::Accelerated {
                        tx_hash,
                        replaces,
                        attempt: record.attempt_count(),
                    },
                );
                Ok(tx_hash)
            }
            StuckAction::Cancel => {
                let request = record.request.cancellation(price);
                let tx_hash = self
                    .broadcaster
                    .replace(record, AttemptKind::Cancellation, request)
                    .await?;

                info!(
                    "Cancelling {} at nonce {} with {:?}",
                    record.id,
                    record.nonce(),
                    tx_hash
                );
                crate::metrics::record_cancellation(chain_id);
                self.events
                    .emit(record.id, EventKind::CancellationSent { tx_hash, replaces });
                Ok(tx_hash)
            }
        }
    }

    async fn exhaust(&self, record: &mut TransactionRecord) -> EngineResult<H256> {
        let err = EngineError::SubmissionExhausted {
            nonce: record.nonce(),
            attempts: record.attempt_count(),
        };
        error!("Giving up on {}: {}", record.id, err);

        record.fail(&err)?;
        if let Err(e) = self.nonces.release(record.account(), record.nonce()).await {
            error!("Failed to release nonce {}: {}", record.nonce(), e);
        }
        self.broadcaster.forget(record.account(), record.nonce());

        crate::metrics::record_tx_failed(self.client.chain_id(), err.label());
        self.events.emit(
            record.id,
            EventKind::Failed {
                reason: err.to_string(),
            },
        );
        Err(err)
    }
}
