//! Lifecycle events published as records move through their states
//!
//! Every observable step of a tracked transaction (broadcast, inclusion,
//! confirmation progress, reorgs, stuck handling, verification) is emitted on
//! a process-wide bus. Subscribers filter by record id.

use crate::chain::Receipt;
use crate::error::VerificationFailure;
use crate::tx::BlockReference;

use chrono::{DateTime, Utc};
use ethers::types::{H256, U256};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Default channel capacity for the event bus
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// First broadcast accepted by the network
    Submitted { tx_hash: H256, nonce: u64 },

    Included { tx_hash: H256, block: BlockReference },

    ConfirmationProgress { confirmations: u64, required: u64 },

    /// The inclusion block is no longer canonical; tracking restarts
    ReorgDetected {
        block: BlockReference,
        observed: Option<H256>,
    },

    /// No progress within the configured window
    ConfirmationTimeout { waited_secs: u64 },

    Stuck { tx_hash: H256, pending_secs: u64 },

    Accelerated { tx_hash: H256, replaces: H256, attempt: u32 },

    CancellationSent { tx_hash: H256, replaces: H256 },

    /// A different attempt than `tx_hash` won the nonce
    Replaced { tx_hash: H256, by: H256 },

    Cancelled { tx_hash: H256, block: BlockReference },

    Confirmed {
        tx_hash: H256,
        block: BlockReference,
        confirmations: u64,
    },

    PossiblyIncomplete { gas_used: U256, gas_limit: U256 },

    VerificationFailed { failure: VerificationFailure },

    Failed { reason: String },

    /// The watch ended without a terminal record state
    WatchStopped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub record_id: Uuid,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl LifecycleEvent {
    pub fn new(record_id: Uuid, kind: EventKind) -> Self {
        Self {
            record_id,
            at: Utc::now(),
            kind,
        }
    }

    pub fn confirmed(record_id: Uuid, receipt: &Receipt, confirmations: u64) -> Self {
        Self::new(
            record_id,
            EventKind::Confirmed {
                tx_hash: receipt.tx_hash,
                block: receipt.block,
                confirmations,
            },
        )
    }

    /// No further events follow for this record
    pub fn is_final(&self) -> bool {
        matches!(
            self.kind,
            EventKind::Confirmed { .. }
                | EventKind::Failed { .. }
                | EventKind::Cancelled { .. }
                | EventKind::WatchStopped { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            EventKind::Submitted { .. } => "submitted",
            EventKind::Included { .. } => "included",
            EventKind::ConfirmationProgress { .. } => "confirmation_progress",
            EventKind::ReorgDetected { .. } => "reorg_detected",
            EventKind::ConfirmationTimeout { .. } => "confirmation_timeout",
            EventKind::Stuck { .. } => "stuck",
            EventKind::Accelerated { .. } => "accelerated",
            EventKind::CancellationSent { .. } => "cancellation_sent",
            EventKind::Replaced { .. } => "replaced",
            EventKind::Cancelled { .. } => "cancelled",
            EventKind::Confirmed { .. } => "confirmed",
            EventKind::PossiblyIncomplete { .. } => "possibly_incomplete",
            EventKind::VerificationFailed { .. } => "verification_failed",
            EventKind::Failed { .. } => "failed",
            EventKind::WatchStopped { .. } => "watch_stopped",
        }
    }
}

/// Broadcast bus for lifecycle events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishing with no subscribers is not an error
    pub fn publish(&self, event: LifecycleEvent) {
        debug!("Event {} for record {}", event.name(), event.record_id);
        let _ = self.sender.send(event);
    }

    pub fn emit(&self, record_id: Uuid, kind: EventKind) {
        self.publish(LifecycleEvent::new(record_id, kind));
    }

    /// Every event for every record
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    /// Events for one record, ending after its final event. Events dropped
    /// because the subscriber lagged are skipped.
    pub fn updates_for(&self, record_id: Uuid) -> BoxStream<'static, LifecycleEvent> {
        let receiver = self.sender.subscribe();

        stream::unfold(Some(receiver), move |state| async move {
            let mut receiver = state?;
            loop {
                match receiver.recv().await {
                    Ok(event) if event.record_id == record_id => {
                        let next = if event.is_final() { None } else { Some(receiver) };
                        return Some((event, next));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Update stream for {} lagged by {} events", record_id, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
