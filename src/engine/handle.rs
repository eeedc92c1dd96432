//! Caller-side handle to one watched transaction

use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, LifecycleEvent};
use crate::monitor::{TxOutcome, WatchRequest};
use crate::tx::{StuckAction, TransactionRecord};

use ethers::types::H256;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Commands for a running watch loop
#[derive(Clone)]
pub(crate) struct WatchCommands {
    pub stop: Arc<watch::Sender<bool>>,
    pub commands: mpsc::Sender<WatchRequest>,
}

impl WatchCommands {
    pub async fn send(&self, id: Uuid, action: StuckAction) -> EngineResult<H256> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(WatchRequest { action, reply })
            .await
            .map_err(|_| ended(id))?;
        response.await.map_err(|_| ended(id))?
    }

    pub fn stop(&self) {
        self.stop.send_replace(true);
    }
}

fn ended(id: Uuid) -> EngineError {
    EngineError::InvalidAction(format!("watch for {} has ended", id))
}

pub struct WatchHandle {
    id: Uuid,
    snapshot: watch::Receiver<TransactionRecord>,
    updates: Option<BoxStream<'static, LifecycleEvent>>,
    events: EventBus,
    control: WatchCommands,
    task: JoinHandle<EngineResult<TxOutcome>>,
}

impl WatchHandle {
    pub(crate) fn new(
        id: Uuid,
        snapshot: watch::Receiver<TransactionRecord>,
        updates: BoxStream<'static, LifecycleEvent>,
        events: EventBus,
        control: WatchCommands,
        task: JoinHandle<EngineResult<TxOutcome>>,
    ) -> Self {
        Self {
            id,
            snapshot,
            updates: Some(updates),
            events,
            control,
            task,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Latest persisted state of the record
    pub fn snapshot(&self) -> TransactionRecord {
        self.snapshot.borrow().clone()
    }

    /// Lifecycle events of this record, ending after the final one.
    ///
    /// The first call replays everything since submission; later calls only
    /// see events published after they were made.
    pub fn updates(&mut self) -> BoxStream<'static, LifecycleEvent> {
        self.updates
            .take()
            .unwrap_or_else(|| self.events.updates_for(self.id))
    }

    /// Rebroadcast the pending transaction at a higher gas price
    pub async fn accelerate(&self) -> EngineResult<H256> {
        self.control.send(self.id, StuckAction::Accelerate).await
    }

    /// Consume the nonce with a zero-value self-transfer
    pub async fn cancel_onchain(&self) -> EngineResult<H256> {
        self.control.send(self.id, StuckAction::Cancel).await
    }

    /// Stop watching. The transaction itself is left alone.
    pub fn stop(&self) {
        self.control.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the watch loop to settle
    pub async fn wait(self) -> EngineResult<TxOutcome> {
        let id = self.id;
        self.task
            .await
            .map_err(|e| EngineError::Internal(format!("watch task for {} failed: {}", id, e)))?
    }
}
