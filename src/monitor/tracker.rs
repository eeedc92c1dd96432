//! Confirmation tracking: one watch loop per in-flight record
//!
//! `poll_once` advances a record by exactly one poll cycle:
//! - `Pending`: look for a canonical receipt of any attempt, escalate to the
//!   stuck handler when the policy timeout passes without one
//! - `Included`: re-check the inclusion block hash, then measure depth
//! - `Confirming`: verify execution and settle the record
//!
//! `run` repeats it on the policy interval until the record settles, racing
//! every wait against the stop signal and caller commands.

use super::stuck::StuckTransactionHandler;
use super::verifier::{ExecutionVerifier, ExecutionWarning};
use super::TxOutcome;
use crate::chain::{Receipt, ReorgCheck, ReorgMonitor, SharedLedger};
use crate::error::{EngineError, EngineResult, SubmissionError};
use crate::events::{EventBus, EventKind, LifecycleEvent};
use crate::state::RecordStore;
use crate::tx::{
    AttemptKind, AttemptStatus, Broadcaster, ConfirmationPolicy, NonceAllocator, RetryPolicy,
    StuckAction, TransactionRecord, TxStatus,
};

use chrono::Utc;
use ethers::types::H256;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Caller command delivered to the loop that owns the record
#[derive(Debug)]
pub struct WatchRequest {
    pub action: StuckAction,
    pub reply: oneshot::Sender<EngineResult<H256>>,
}

/// Signals a watch loop listens to besides its own timers
pub struct WatchControl {
    pub stop: watch::Receiver<bool>,
    pub commands: mpsc::Receiver<WatchRequest>,
}

/// A record under observation and the loop-local state around it
pub struct Watch {
    pub record: TransactionRecord,
    pub policy: ConfirmationPolicy,
    receipt: Option<Receipt>,
    /// Last broadcast or escalation of a pending record
    pending_since: Instant,
    /// Last time the depth moved forward
    progress_at: Instant,
    timeout_reported: bool,
    /// A replacement was refused because the nonce is already used on-chain
    nonce_consumed: bool,
    poll_errors: u32,
    snapshot: Option<watch::Sender<TransactionRecord>>,
}

impl Watch {
    pub fn new(record: TransactionRecord, policy: ConfirmationPolicy) -> Self {
        let now = Instant::now();
        Self {
            record,
            policy,
            receipt: None,
            pending_since: now,
            progress_at: now,
            timeout_reported: false,
            nonce_consumed: false,
            poll_errors: 0,
            snapshot: None,
        }
    }

    /// Publish every persisted change of the record to `snapshot`
    pub fn with_snapshot(mut self, snapshot: watch::Sender<TransactionRecord>) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn receipt(&self) -> Option<&Receipt> {
        self.receipt.as_ref()
    }

    fn outcome(&self) -> TxOutcome {
        TxOutcome {
            record: self.record.clone(),
            receipt: self.receipt.clone(),
            warnings: Vec::new(),
            verification: None,
        }
    }
}

pub struct ConfirmationTracker {
    client: SharedLedger,
    reorg: Arc<ReorgMonitor>,
    stuck: Arc<StuckTransactionHandler>,
    verifier: Arc<ExecutionVerifier>,
    nonces: Arc<NonceAllocator>,
    broadcaster: Arc<Broadcaster>,
    store: Arc<dyn RecordStore>,
    events: EventBus,
    retry: RetryPolicy,
}

impl ConfirmationTracker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: SharedLedger,
        reorg: Arc<ReorgMonitor>,
        stuck: Arc<StuckTransactionHandler>,
        verifier: Arc<ExecutionVerifier>,
        nonces: Arc<NonceAllocator>,
        broadcaster: Arc<Broadcaster>,
        store: Arc<dyn RecordStore>,
        events: EventBus,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            reorg,
            stuck,
            verifier,
            nonces,
            broadcaster,
            store,
            events,
            retry,
        }
    }

    /// Advance `watch` by one poll cycle.
    ///
    /// `Ok(Some(_))` once the record settled successfully (confirmed, or its
    /// nonce consumed by a cancellation). An error with the record in a
    /// terminal state is final; any other error is transient.
    pub async fn poll_once(&self, watch: &mut Watch) -> EngineResult<Option<TxOutcome>> {
        match watch.record.status {
            TxStatus::Pending => self.poll_pending(watch).await,
            TxStatus::Included => self.poll_included(watch).await,
            TxStatus::Confirming => self.finalize(watch).await,
            TxStatus::Confirmed | TxStatus::Replaced => Ok(Some(watch.outcome())),
            status => Err(EngineError::InvalidAction(format!(
                "transaction {} is {} and cannot be watched",
                watch.record.id, status
            ))),
        }
    }

    /// Poll until the record settles, the caller stops the watch, or polling
    /// keeps failing past the configured bound.
    pub async fn run(self: Arc<Self>, mut watch: Watch, mut control: WatchControl) -> EngineResult<TxOutcome> {
        info!(
            "Watching {} (nonce {}, {} confirmations required)",
            watch.record.id,
            watch.record.nonce(),
            watch.policy.required_confirmations
        );
        self.persist(&watch).await;

        loop {
            // a poll may broadcast a replacement, so it always runs to completion
            let result = self.poll_once(&mut watch).await;
            self.persist(&watch).await;

            match result {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => watch.poll_errors = 0,
                Err(e) if watch.record.status.is_terminal() => return Err(e),
                Err(e) if !e.is_retryable() => return Err(self.abandoned(&watch, e)),
                Err(e) => {
                    watch.poll_errors += 1;
                    warn!(
                        "Poll {} of {} failed for {}: {}",
                        watch.poll_errors, self.retry.max_poll_errors, watch.record.id, e
                    );
                    if watch.poll_errors >= self.retry.max_poll_errors {
                        return Err(self.lost(&watch));
                    }
                }
            }

            let sleep = tokio::time::sleep(watch.policy.poll_interval);
            tokio::pin!(sleep);

            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    _ = stop_requested(&mut control.stop) => return Err(self.stopped(&watch)),
                    Some(request) = control.commands.recv() => {
                        let result = self.stuck.handle(&mut watch.record, request.action).await;
                        self.persist(&watch).await;

                        let exhausted = watch.record.status.is_terminal();
                        let _ = request.reply.send(result);
                        if exhausted {
                            return Err(EngineError::SubmissionExhausted {
                                nonce: watch.record.nonce(),
                                attempts: watch.record.attempt_count(),
                            });
                        }
                    }
                }
            }
        }
    }

    async fn poll_pending(&self, watch: &mut Watch) -> EngineResult<Option<TxOutcome>> {
        let chain_id = self.client.chain_id();
        let head = self
            .client
            .block_number()
            .await
            .map_err(|e| EngineError::chain(chain_id, e))?;
        self.reorg.prune(head);

        let attempts: Vec<(H256, AttemptKind)> = watch
            .record
            .attempts
            .iter()
            .rev()
            .map(|a| (a.tx_hash, a.kind))
            .collect();

        let mut displaced_receipt = false;
        for (tx_hash, kind) in attempts {
            let receipt = match self
                .client
                .transaction_receipt(tx_hash)
                .await
                .map_err(|e| EngineError::chain(chain_id, e))?
            {
                Some(receipt) => receipt,
                None => continue,
            };

            let check = self
                .reorg
                .check(&receipt.block)
                .await
                .map_err(|e| EngineError::chain(chain_id, e))?;
            if check != ReorgCheck::Canonical {
                debug!(
                    "Ignoring receipt for {:?} from non-canonical block {}",
                    tx_hash, receipt.block
                );
                displaced_receipt = true;
                continue;
            }

            return self.on_receipt(watch, receipt, kind).await;
        }

        if watch.nonce_consumed && !displaced_receipt {
            let err = EngineError::Nonce {
                account: watch.record.account(),
                message: format!(
                    "nonce {} consumed by a transaction outside record {}",
                    watch.record.nonce(),
                    watch.record.id
                ),
            };
            return self.fail(watch, err).await;
        }

        let pending_for = watch.pending_since.elapsed();
        if pending_for >= watch.policy.timeout {
            self.escalate(watch).await?;
        }
        Ok(None)
    }

    async fn on_receipt(&self, watch: &mut Watch, receipt: Receipt, kind: AttemptKind) -> EngineResult<Option<TxOutcome>> {
        let record_id = watch.record.id;
        let account = watch.record.account();
        let nonce = watch.record.nonce();

        if kind == AttemptKind::Cancellation {
            watch.record.mark_cancelled(receipt.tx_hash, receipt.block)?;
            info!(
                "Transaction {} cancelled: nonce {} consumed by {:?}",
                record_id, nonce, receipt.tx_hash
            );
            self.settle_nonce(account, nonce).await;
            self.events.emit(
                record_id,
                EventKind::Cancelled {
                    tx_hash: receipt.tx_hash,
                    block: receipt.block,
                },
            );
            watch.receipt = Some(receipt);
            return Ok(Some(watch.outcome()));
        }

        watch.record.mark_included(receipt.tx_hash, receipt.block)?;
        watch.nonce_consumed = false;
        watch.progress_at = Instant::now();
        watch.timeout_reported = false;
        info!(
            "Transaction {} included as {:?} in block {}",
            record_id, receipt.tx_hash, receipt.block
        );

        self.events.emit(
            record_id,
            EventKind::Included {
                tx_hash: receipt.tx_hash,
                block: receipt.block,
            },
        );
        for attempt in &watch.record.attempts {
            if attempt.status == AttemptStatus::Replaced {
                self.events.emit(
                    record_id,
                    EventKind::Replaced {
                        tx_hash: attempt.tx_hash,
                        by: receipt.tx_hash,
                    },
                );
            }
        }

        let status = self.verifier.check_status(&receipt);
        watch.receipt = Some(receipt);
        if let Err(reverted) = status {
            return self.fail(watch, reverted).await;
        }
        Ok(None)
    }

    async fn poll_included(&self, watch: &mut Watch) -> EngineResult<Option<TxOutcome>> {
        let chain_id = self.client.chain_id();
        let inclusion = watch.record.inclusion.ok_or_else(|| {
            EngineError::Internal(format!("included record {} has no block", watch.record.id))
        })?;

        let check = self
            .reorg
            .check(&inclusion)
            .await
            .map_err(|e| EngineError::chain(chain_id, e))?;
        if let ReorgCheck::Displaced { observed } = check {
            let reorg = EngineError::ReorgDetected {
                block: inclusion,
                observed,
            };
            warn!("Requeueing {}: {}", watch.record.id, reorg);

            watch.record.requeue()?;
            watch.receipt = None;
            watch.pending_since = Instant::now();
            self.events.emit(
                watch.record.id,
                EventKind::ReorgDetected {
                    block: inclusion,
                    observed,
                },
            );
            return Ok(None);
        }

        let head = self
            .client
            .block_number()
            .await
            .map_err(|e| EngineError::chain(chain_id, e))?;
        let previous = watch.record.confirmations;
        let depth = watch.record.record_depth(head.saturating_sub(inclusion.number));
        let required = watch.record.required_confirmations;

        if depth > previous {
            watch.progress_at = Instant::now();
            watch.timeout_reported = false;
            debug!("Transaction {} at depth {}/{}", watch.record.id, depth, required);
            self.events.emit(
                watch.record.id,
                EventKind::ConfirmationProgress {
                    confirmations: depth,
                    required,
                },
            );
        } else if !watch.timeout_reported && watch.progress_at.elapsed() >= watch.policy.timeout {
            let waited_secs = watch.progress_at.elapsed().as_secs();
            let timeout = EngineError::ConfirmationTimeout {
                tx_hash: watch.record.tx_hash().unwrap_or_default(),
                waited_secs,
            };
            warn!(
                "Transaction {} at depth {}/{}: {}",
                watch.record.id, depth, required, timeout
            );
            watch.timeout_reported = true;
            self.events
                .emit(watch.record.id, EventKind::ConfirmationTimeout { waited_secs });
        }

        if depth >= required {
            watch.record.transition(TxStatus::Confirming)?;
            return self.finalize(watch).await;
        }
        Ok(None)
    }

    async fn finalize(&self, watch: &mut Watch) -> EngineResult<Option<TxOutcome>> {
        let receipt = self.included_receipt(watch).await?;

        if let Err(reverted) = self.verifier.check_status(&receipt) {
            return self.fail(watch, reverted).await;
        }

        let gas_limit = watch
            .record
            .included_attempt()
            .map(|a| a.gas_limit)
            .unwrap_or(watch.record.request.gas_limit);
        let report = self
            .verifier
            .verify(&receipt, gas_limit, watch.record.verification.as_ref())
            .await
            .map_err(|e| EngineError::chain(self.client.chain_id(), e))?;

        let record_id = watch.record.id;
        for warning in &report.warnings {
            let ExecutionWarning::PossiblyIncomplete { gas_used, gas_limit } = warning;
            watch
                .record
                .warnings
                .push(format!("possibly incomplete: used {} of {} gas", gas_used, gas_limit));
            self.events.emit(
                record_id,
                EventKind::PossiblyIncomplete {
                    gas_used: *gas_used,
                    gas_limit: *gas_limit,
                },
            );
        }

        watch.record.transition(TxStatus::Confirmed)?;
        let depth = watch.record.confirmations;
        watch.record.reason = Some(match &report.failure {
            Some(failure) => {
                warn!("Transaction {} confirmed but {}", record_id, failure);
                crate::metrics::record_verification_failure(self.client.chain_id());
                self.events.emit(
                    record_id,
                    EventKind::VerificationFailed {
                        failure: failure.clone(),
                    },
                );
                format!("confirmed at depth {}; {}", depth, EngineError::VerificationFailed(failure.clone()))
            }
            None => format!("confirmed at depth {}", depth),
        });

        self.settle_nonce(watch.record.account(), watch.record.nonce()).await;
        let chain_id = self.client.chain_id();
        crate::metrics::record_tx_confirmed(chain_id);
        if let Some(first) = watch.record.attempts.first() {
            let latency = Utc::now() - first.submitted_at;
            crate::metrics::record_tx_latency(chain_id, latency.num_milliseconds() as f64 / 1000.0);
        }

        info!(
            "Transaction {} confirmed as {:?} at depth {}",
            record_id, receipt.tx_hash, depth
        );
        self.events
            .publish(LifecycleEvent::confirmed(record_id, &receipt, depth));

        Ok(Some(TxOutcome {
            record: watch.record.clone(),
            receipt: Some(receipt),
            warnings: report.warnings,
            verification: report.failure,
        }))
    }

    /// Receipt of the included attempt, re-fetched for records resumed after a restart
    async fn included_receipt(&self, watch: &mut Watch) -> EngineResult<Receipt> {
        if let Some(receipt) = &watch.receipt {
            return Ok(receipt.clone());
        }

        let tx_hash = watch
            .record
            .included_attempt()
            .map(|a| a.tx_hash)
            .ok_or_else(|| EngineError::Internal(format!("record {} has no included attempt", watch.record.id)))?;
        let receipt = self
            .client
            .transaction_receipt(tx_hash)
            .await
            .map_err(|e| EngineError::chain(self.client.chain_id(), e))?
            .ok_or_else(|| EngineError::Internal(format!("receipt for {:?} is gone", tx_hash)))?;

        watch.receipt = Some(receipt.clone());
        Ok(receipt)
    }

    /// No receipt within the policy timeout: replace the pending attempt
    async fn escalate(&self, watch: &mut Watch) -> EngineResult<()> {
        let record_id = watch.record.id;
        let pending_secs = watch.pending_since.elapsed().as_secs();
        let tx_hash = watch.record.tx_hash().unwrap_or_default();

        let timeout = EngineError::ConfirmationTimeout {
            tx_hash,
            waited_secs: pending_secs,
        };
        warn!("Transaction {} still pending, escalating: {}", record_id, timeout);
        self.events.emit(
            record_id,
            EventKind::ConfirmationTimeout {
                waited_secs: pending_secs,
            },
        );
        self.events
            .emit(record_id, EventKind::Stuck { tx_hash, pending_secs });
        watch.pending_since = Instant::now();

        let action = if watch.record.is_cancelling() {
            StuckAction::Cancel
        } else {
            watch.record.stuck_action.unwrap_or(StuckAction::Accelerate)
        };

        match self.stuck.handle(&mut watch.record, action).await {
            Ok(_) => Ok(()),
            Err(EngineError::Submission {
                source: SubmissionError::NonceTooLow,
                ..
            }) => {
                // the next poll either finds the attempt that was mined or fails the record
                debug!("Nonce of {} already consumed, re-reading receipts", record_id);
                watch.nonce_consumed = true;
                Ok(())
            }
            Err(e) if watch.record.status.is_terminal() => Err(e),
            Err(e) => {
                warn!("Escalation for {} failed, will retry after timeout: {}", record_id, e);
                Ok(())
            }
        }
    }

    async fn fail(&self, watch: &mut Watch, err: EngineError) -> EngineResult<Option<TxOutcome>> {
        if err.should_alert() {
            error!("Transaction {} failed: {}", watch.record.id, err);
        } else {
            warn!("Transaction {} failed: {}", watch.record.id, err);
        }
        watch.record.fail(&err)?;
        self.settle_nonce(watch.record.account(), watch.record.nonce()).await;

        crate::metrics::record_tx_failed(self.client.chain_id(), err.label());
        self.events.emit(
            watch.record.id,
            EventKind::Failed {
                reason: err.to_string(),
            },
        );
        Err(err)
    }

    /// The nonce was consumed on-chain
    async fn settle_nonce(&self, account: ethers::types::Address, nonce: u64) {
        self.nonces.confirm(account, nonce).await;
        self.broadcaster.forget(account, nonce);
    }

    fn stopped(&self, watch: &Watch) -> EngineError {
        info!("Watch for {} stopped by caller", watch.record.id);
        self.events.emit(
            watch.record.id,
            EventKind::WatchStopped {
                reason: "stopped by caller".to_string(),
            },
        );
        EngineError::WatchCancelled { id: watch.record.id }
    }

    fn lost(&self, watch: &Watch) -> EngineError {
        let err = EngineError::TrackingLost {
            id: watch.record.id,
            errors: watch.poll_errors,
        };
        error!("{}", err);
        self.events.emit(
            watch.record.id,
            EventKind::WatchStopped {
                reason: err.to_string(),
            },
        );
        err
    }

    /// Poll error that repeating the poll cannot fix
    fn abandoned(&self, watch: &Watch, err: EngineError) -> EngineError {
        error!("Watch for {} ended: {}", watch.record.id, err);
        self.events.emit(
            watch.record.id,
            EventKind::WatchStopped {
                reason: err.to_string(),
            },
        );
        err
    }

    async fn persist(&self, watch: &Watch) {
        if let Err(e) = self.store.save(&watch.record).await {
            warn!("Failed to persist record {}: {}", watch.record.id, e);
        }
        if let Some(snapshot) = &watch.snapshot {
            snapshot.send_replace(watch.record.clone());
        }
    }
}

/// Resolves once a stop was requested; never resolves if the sender is gone
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}
