//! Transaction broadcaster with bounded remediation of network rejections
//!
//! A rejected broadcast is classified before anything else happens:
//! - nonce too low: resync the account and rebuild on a fresh nonce
//! - underpriced: raise the price over both the prior and the network price
//! - insufficient funds and unclassified errors: release the nonce and fail
//!
//! Remediations share one attempt budget, with backoff between tries.

use super::gas::replacement_price;
use super::nonce::NonceAllocator;
use super::policy::RetryPolicy;
use super::record::{AttemptKind, TransactionRecord, TransactionRequest, TxStatus};
use super::signer::{SignedTransaction, Signers};
use crate::chain::SharedLedger;
use crate::error::{ChainError, EngineError, EngineResult, SubmissionError};
use crate::events::{EventBus, EventKind};

use dashmap::DashMap;
use ethers::types::{Address, H256};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Identifies one broadcast: the same key is never sent twice
type AttemptKey = (Address, u64, u32);

enum Rejection {
    Network(SubmissionError),
    /// No answer from the node; the payload may or may not have arrived
    Transport(String),
}

pub struct Broadcaster {
    client: SharedLedger,
    signers: Signers,
    nonces: Arc<NonceAllocator>,
    retry: RetryPolicy,
    events: EventBus,
    accepted: DashMap<AttemptKey, H256>,
}

impl Broadcaster {
    pub fn new(
        client: SharedLedger,
        signers: Signers,
        nonces: Arc<NonceAllocator>,
        retry: RetryPolicy,
        events: EventBus,
    ) -> Self {
        Self {
            client,
            signers,
            nonces,
            retry,
            events,
            accepted: DashMap::new(),
        }
    }

    pub fn signers(&self) -> &Signers {
        &self.signers
    }

    /// Sign and broadcast a `Built` record. On success the record is `Pending`
    /// with its first attempt; on failure it is `Failed` and its nonce released.
    pub async fn submit(&self, record: &mut TransactionRecord) -> EngineResult<H256> {
        let chain_id = self.client.chain_id();
        let mut tries: u32 = 0;

        loop {
            let signed = match self.sign(record).await {
                Ok(signed) => signed,
                Err(e) => return self.abandon(record, e, true).await,
            };
            record.transition(TxStatus::Broadcast)?;

            let account = record.account();
            let nonce = record.nonce();
            let rejection = match self.send(account, nonce, record.attempt_count() + 1, &signed).await {
                Ok(tx_hash) => {
                    record.transition(TxStatus::Pending)?;
                    let request = record.request.clone();
                    record.push_attempt(AttemptKind::Original, tx_hash, request);
                    self.nonces.mark_submitted(account, nonce).await;

                    self.events
                        .emit(record.id, EventKind::Submitted { tx_hash, nonce });
                    crate::metrics::record_tx_submitted(chain_id);
                    info!(
                        "Transaction {} broadcast as {:?} (nonce {}, try {})",
                        record.id,
                        tx_hash,
                        nonce,
                        tries + 1
                    );
                    return Ok(tx_hash);
                }
                Err(rejection) => rejection,
            };

            tries += 1;
            let exhausted = tries >= self.retry.max_attempts;

            match rejection {
                Rejection::Network(SubmissionError::NonceTooLow) => {
                    crate::metrics::record_rejection(chain_id, SubmissionError::NonceTooLow.label());
                    if let Err(e) = self.nonces.resync(account, nonce).await {
                        return self.abandon(record, e, false).await;
                    }
                    if exhausted {
                        return self.exhaust(record, tries, false).await;
                    }

                    let fresh = match self.nonces.reserve(account).await {
                        Ok(fresh) => fresh,
                        Err(e) => return self.abandon(record, e, false).await,
                    };
                    record.transition(TxStatus::Built)?;
                    record.request = record.request.with_nonce(fresh);
                    warn!(
                        "Nonce {} already used, rebuilding {} on nonce {}",
                        nonce, record.id, fresh
                    );
                }
                Rejection::Network(SubmissionError::Underpriced) => {
                    crate::metrics::record_rejection(chain_id, SubmissionError::Underpriced.label());
                    if exhausted {
                        return self.exhaust(record, tries, true).await;
                    }

                    let network = self.client.gas_price().await.ok();
                    let price = replacement_price(&record.request.gas_price, network.as_ref(), self.retry.bump_percent);
                    record.transition(TxStatus::Built)?;
                    record.request = record.request.with_gas_price(price);
                    warn!("Transaction {} underpriced, retrying at {:?}", record.id, price);
                }
                Rejection::Network(other) => {
                    crate::metrics::record_rejection(chain_id, other.label());
                    let err = EngineError::Submission { nonce, source: other };
                    return self.abandon(record, err, true).await;
                }
                Rejection::Transport(message) => {
                    if exhausted {
                        let release = self.nonce_unused(account, nonce).await;
                        return self.exhaust(record, tries, release).await;
                    }
                    record.transition(TxStatus::Built)?;
                    warn!("Broadcast of {} did not reach the node: {}", record.id, message);
                }
            }

            tokio::time::sleep(self.retry.delay(tries - 1)).await;
        }
    }

    /// Broadcast a same-nonce replacement for a `Pending` record. Underpriced
    /// and unreachable sends are retried at a higher price within the attempt budget.
    pub async fn replace(
        &self,
        record: &mut TransactionRecord,
        kind: AttemptKind,
        request: TransactionRequest,
    ) -> EngineResult<H256> {
        if record.status != TxStatus::Pending {
            return Err(EngineError::InvalidAction(format!(
                "cannot replace transaction {} in state {}",
                record.id, record.status
            )));
        }

        let signer = self.signers.get(&record.account())?;
        let mut request = request;
        let mut tries: u32 = 0;

        loop {
            let signed = signer.sign(&request).await?;
            let attempt = record.attempt_count() + 1;

            match self.send(request.from, request.nonce, attempt, &signed).await {
                Ok(tx_hash) => {
                    record.push_attempt(kind, tx_hash, request);
                    return Ok(tx_hash);
                }
                Err(rejection) => {
                    tries += 1;
                    let retryable = match &rejection {
                        Rejection::Network(SubmissionError::Underpriced) | Rejection::Transport(_) => {
                            record.attempt_count() + tries < self.retry.max_attempts
                        }
                        _ => false,
                    };

                    if !retryable {
                        return Err(match rejection {
                            Rejection::Network(source) => {
                                crate::metrics::record_rejection(self.client.chain_id(), source.label());
                                EngineError::Submission {
                                    nonce: request.nonce,
                                    source,
                                }
                            }
                            Rejection::Transport(message) => EngineError::ChainConnection {
                                chain_id: self.client.chain_id(),
                                message,
                            },
                        });
                    }

                    let network = self.client.gas_price().await.ok();
                    let price = replacement_price(&request.gas_price, network.as_ref(), self.retry.bump_percent);
                    debug!("Replacement for {} rejected, retrying at {:?}", record.id, price);
                    request = request.with_gas_price(price);
                    tokio::time::sleep(self.retry.delay(tries - 1)).await;
                }
            }
        }
    }

    /// Drop the idempotency keys of a settled nonce
    pub fn forget(&self, account: Address, nonce: u64) {
        self.accepted
            .retain(|(a, n, _), _| !(*a == account && *n == nonce));
    }

    async fn sign(&self, record: &mut TransactionRecord) -> EngineResult<SignedTransaction> {
        let signer = self.signers.get(&record.account())?;
        let signed = signer.sign(&record.request).await?;
        record.transition(TxStatus::Signed)?;
        Ok(signed)
    }

    async fn send(
        &self,
        account: Address,
        nonce: u64,
        attempt: u32,
        signed: &SignedTransaction,
    ) -> Result<H256, Rejection> {
        let key = (account, nonce, attempt);
        if let Some(hash) = self.accepted.get(&key) {
            debug!("Attempt {} of nonce {} already accepted as {:?}", attempt, nonce, *hash);
            return Ok(*hash);
        }

        let result = self.client.send_raw_transaction(signed.raw.clone()).await;
        let hash = match result {
            Ok(hash) => hash,
            Err(ChainError::Transport(message)) => return Err(Rejection::Transport(message)),
            Err(err) if SubmissionError::is_already_known(err.message()) => {
                debug!("Node already has {:?}", signed.hash);
                signed.hash
            }
            Err(err) => return Err(Rejection::Network(SubmissionError::classify(err.message()))),
        };

        self.accepted.insert(key, hash);
        Ok(hash)
    }

    /// After unanswered broadcasts the payload may still have reached a node.
    /// The nonce is only free when the pending count has not moved past it.
    async fn nonce_unused(&self, account: Address, nonce: u64) -> bool {
        match self.client.transaction_count(account).await {
            Ok(count) if count <= nonce => true,
            Ok(count) => {
                warn!(
                    "Pending count {} for {:?} covers nonce {}, keeping it reserved",
                    count, account, nonce
                );
                self.nonces.mark_submitted(account, nonce).await;
                false
            }
            Err(e) => {
                warn!("Cannot tell whether nonce {} of {:?} is in use: {}", nonce, account, e);
                self.nonces.mark_submitted(account, nonce).await;
                false
            }
        }
    }

    /// Fail the record; `release` hands the nonce back for reuse
    async fn abandon(&self, record: &mut TransactionRecord, err: EngineError, release: bool) -> EngineResult<H256> {
        if release {
            if let Err(release_err) = self.nonces.release(record.account(), record.nonce()).await {
                warn!("Failed to release nonce {}: {}", record.nonce(), release_err);
            }
        }

        error!("Submission of {} failed: {}", record.id, err);
        record.fail(&err)?;
        crate::metrics::record_tx_failed(self.client.chain_id(), err.label());
        self.events.emit(
            record.id,
            EventKind::Failed {
                reason: err.to_string(),
            },
        );
        Err(err)
    }

    async fn exhaust(&self, record: &mut TransactionRecord, attempts: u32, release: bool) -> EngineResult<H256> {
        let err = EngineError::SubmissionExhausted {
            nonce: record.nonce(),
            attempts,
        };
        self.abandon(record, err, release).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLedger, FakeSigner};
    use crate::tx::record::GasPrice;
    use ethers::types::{Bytes, U256};
    use std::time::Duration;

    fn sender() -> Address {
        Address::repeat_byte(0x11)
    }

    struct Setup {
        ledger: Arc<FakeLedger>,
        nonces: Arc<NonceAllocator>,
        broadcaster: Broadcaster,
        events: EventBus,
    }

    fn setup(max_attempts: u32) -> Setup {
        let ledger = Arc::new(FakeLedger::new(1));
        ledger.set_account_nonce(sender(), 0);
        let nonces = Arc::new(NonceAllocator::new(ledger.clone()));
        let events = EventBus::default();
        let retry = RetryPolicy {
            max_attempts,
            backoff: vec![Duration::from_millis(10)],
            ..RetryPolicy::default()
        };
        let broadcaster = Broadcaster::new(
            ledger.clone(),
            Signers::new(Arc::new(FakeSigner::new(sender()))),
            nonces.clone(),
            retry,
            events.clone(),
        );
        Setup {
            ledger,
            nonces,
            broadcaster,
            events,
        }
    }

    async fn built(setup: &Setup, price: u64) -> TransactionRecord {
        let nonce = setup.nonces.reserve(sender()).await.unwrap();
        TransactionRecord::new(
            TransactionRequest {
                chain_id: 1,
                from: sender(),
                to: Address::repeat_byte(0x22),
                value: U256::from(5u64),
                data: Bytes::default(),
                gas_limit: U256::from(21_000u64),
                gas_price: GasPrice::Legacy(U256::from(price)),
                nonce,
            },
            1,
        )
    }

    #[tokio::test]
    async fn successful_submission_reaches_pending() {
        let setup = setup(3);
        let mut events = setup.events.subscribe();
        let mut record = built(&setup, 100).await;

        let hash = setup.broadcaster.submit(&mut record).await.unwrap();
        assert_eq!(record.status, TxStatus::Pending);
        assert_eq!(record.tx_hash(), Some(hash));
        assert!(setup.ledger.in_mempool(hash));
        assert!(matches!(
            events.recv().await.unwrap().kind,
            EventKind::Submitted { nonce: 0, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn nonce_too_low_rebuilds_on_a_fresh_nonce() {
        let setup = setup(3);
        let mut record = built(&setup, 100).await;
        // another process used nonce 0 behind our back
        setup.ledger.set_account_nonce(sender(), 1);

        setup.broadcaster.submit(&mut record).await.unwrap();
        assert_eq!(record.status, TxStatus::Pending);
        assert_eq!(record.nonce(), 1);
        assert_eq!(setup.nonces.in_flight(sender()).await, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn underpriced_is_retried_above_the_network_price() {
        let setup = setup(3);
        setup
            .ledger
            .fail_next_send(ChainError::Rejected("transaction underpriced".into()));
        setup.ledger.set_gas_price(GasPrice::Legacy(U256::from(200u64)));
        let mut record = built(&setup, 100).await;

        setup.broadcaster.submit(&mut record).await.unwrap();
        assert_eq!(record.request.gas_price, GasPrice::Legacy(U256::from(200u64)));
        assert_eq!(record.attempt_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_underpricing_exhausts_the_budget() {
        let setup = setup(2);
        for _ in 0..2 {
            setup
                .ledger
                .fail_next_send(ChainError::Rejected("max fee per gas less than block base fee".into()));
        }
        let mut record = built(&setup, 100).await;

        let err = setup.broadcaster.submit(&mut record).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::SubmissionExhausted { attempts: 2, .. }
        ));
        assert_eq!(record.status, TxStatus::Failed);
        assert!(setup.nonces.in_flight(sender()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_broadcasts_free_the_nonce_only_if_it_is_unused() {
        let setup = setup(2);
        for _ in 0..2 {
            setup
                .ledger
                .fail_next_send(ChainError::Transport("connection reset".into()));
        }
        let mut record = built(&setup, 100).await;

        let err = setup.broadcaster.submit(&mut record).await.unwrap_err();
        assert!(matches!(err, EngineError::SubmissionExhausted { attempts: 2, .. }));
        assert!(setup.nonces.in_flight(sender()).await.is_empty());

        // this time the pending count shows the payload arrived somewhere
        for _ in 0..2 {
            setup
                .ledger
                .fail_next_send(ChainError::Transport("connection reset".into()));
        }
        let mut record = built(&setup, 100).await;
        assert_eq!(record.nonce(), 0);
        setup.ledger.set_reported_count(sender(), 1);

        setup.broadcaster.submit(&mut record).await.unwrap_err();
        assert_eq!(record.status, TxStatus::Failed);
        assert_eq!(setup.nonces.in_flight(sender()).await, vec![0]);
    }

    #[tokio::test]
    async fn insufficient_funds_fails_without_retry_and_frees_the_nonce() {
        let setup = setup(5);
        setup.ledger.fail_next_send(ChainError::Rejected(
            "insufficient funds for gas * price + value".into(),
        ));
        let mut record = built(&setup, 100).await;

        let err = setup.broadcaster.submit(&mut record).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Submission {
                source: SubmissionError::InsufficientFunds,
                ..
            }
        ));
        assert_eq!(record.status, TxStatus::Failed);
        assert_eq!(setup.ledger.send_calls(), 1);

        let next = built(&setup, 100).await;
        assert_eq!(next.nonce(), 0);
    }

    #[tokio::test]
    async fn already_known_counts_as_accepted() {
        let setup = setup(3);
        setup
            .ledger
            .fail_next_send(ChainError::Rejected("already known".into()));
        let mut record = built(&setup, 100).await;

        let hash = setup.broadcaster.submit(&mut record).await.unwrap();
        assert_eq!(record.status, TxStatus::Pending);
        assert_eq!(record.tx_hash(), Some(hash));
    }

    #[tokio::test]
    async fn replacement_keeps_record_pending_and_adds_attempt() {
        let setup = setup(5);
        let mut record = built(&setup, 100).await;
        let original = setup.broadcaster.submit(&mut record).await.unwrap();

        let faster = record.request.with_gas_price(GasPrice::Legacy(U256::from(120u64)));
        let hash = setup
            .broadcaster
            .replace(&mut record, AttemptKind::Accelerated, faster)
            .await
            .unwrap();

        assert_ne!(hash, original);
        assert_eq!(record.status, TxStatus::Pending);
        assert_eq!(record.attempt_count(), 2);
        assert_eq!(record.latest_attempt().unwrap().kind, AttemptKind::Accelerated);
    }

    #[tokio::test]
    async fn idempotency_key_prevents_double_send() {
        let setup = setup(3);
        let record = built(&setup, 100).await;
        let signed = FakeSigner::new(sender()).sign_now(&record.request);

        let first = setup.broadcaster.send(sender(), 0, 1, &signed).await.ok().unwrap();
        let second = setup.broadcaster.send(sender(), 0, 1, &signed).await.ok().unwrap();
        assert_eq!(first, second);
        assert_eq!(setup.ledger.send_calls(), 1);

        setup.broadcaster.forget(sender(), 0);
        assert!(setup.broadcaster.accepted.is_empty());
    }
}
