//! Transaction engine: the entry point that wires every component together
//!
//! `TxEngine::submit` builds, signs and broadcasts a caller intent, then hands
//! the record to its own watch task. Callers follow it through the returned
//! `WatchHandle` or by record id.

mod handle;

pub use handle::WatchHandle;

use handle::WatchCommands;

use crate::chain::{ReorgMonitor, SharedLedger};
use crate::config::Settings;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, LifecycleEvent, DEFAULT_EVENT_CAPACITY};
use crate::monitor::{
    ConfirmationTracker, ExecutionVerifier, StuckTransactionHandler, Watch, WatchControl,
    DEFAULT_GAS_WARNING_BPS,
};
use crate::reader::BatchReader;
use crate::state::{RecordStats, RecordStore};
use crate::tx::{
    Broadcaster, ConfirmationPolicy, ConfirmationTiers, NonceAllocator, RetryPolicy, Signers,
    StuckAction, TransactionBuilder, TransactionIntent, TransactionRecord, TxStatus,
};
use crate::tx::gas::DEFAULT_GAS_LIMIT_BUFFER_PERCENT;

use dashmap::DashMap;
use ethers::types::{H256, U256};
use futures::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Queued caller commands per watch
const COMMAND_CAPACITY: usize = 8;

/// Tunables the engine is built with
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub tiers: ConfirmationTiers,
    pub retry: RetryPolicy,
    pub gas_limit_buffer_percent: u64,
    pub gas_warning_bps: u64,
    pub cache_ttl: Duration,
    pub reorg_retention_blocks: u64,
    pub event_capacity: usize,
}

impl EngineOptions {
    pub fn from_settings(settings: &Settings) -> EngineResult<Self> {
        let tiers = settings
            .confirmation
            .tiers()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        Ok(Self {
            tiers,
            retry: settings.retry.policy(),
            gas_limit_buffer_percent: settings.engine.gas_limit_buffer_percent,
            gas_warning_bps: settings.verification.gas_warning_bps(),
            cache_ttl: Duration::from_secs(settings.cache.ttl_secs),
            reorg_retention_blocks: settings.engine.reorg_retention_blocks,
            event_capacity: settings.engine.event_capacity,
        })
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            tiers: ConfirmationTiers {
                negligible_value: U256::exp10(15),
                large_value: U256::exp10(19),
                timeout: Duration::from_secs(60),
                poll_interval: Duration::from_secs(2),
            },
            retry: RetryPolicy::default(),
            gas_limit_buffer_percent: DEFAULT_GAS_LIMIT_BUFFER_PERCENT,
            gas_warning_bps: DEFAULT_GAS_WARNING_BPS,
            cache_ttl: Duration::from_secs(30),
            reorg_retention_blocks: 256,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub records: RecordStats,
    pub active_watches: usize,
}

/// Live watch, reachable by record id
struct WatchSlot {
    control: WatchCommands,
    snapshot: watch::Receiver<TransactionRecord>,
}

pub struct TxEngine {
    client: SharedLedger,
    builder: TransactionBuilder,
    broadcaster: Arc<Broadcaster>,
    nonces: Arc<NonceAllocator>,
    tracker: Arc<ConfirmationTracker>,
    reader: Arc<BatchReader>,
    store: Arc<dyn RecordStore>,
    events: EventBus,
    tiers: ConfirmationTiers,
    watches: Arc<DashMap<Uuid, WatchSlot>>,
}

impl TxEngine {
    pub fn new(
        client: SharedLedger,
        signers: Signers,
        store: Arc<dyn RecordStore>,
        options: EngineOptions,
    ) -> Self {
        let events = EventBus::new(options.event_capacity);
        let nonces = Arc::new(NonceAllocator::new(client.clone()));
        let builder = TransactionBuilder::new(
            client.clone(),
            nonces.clone(),
            options.gas_limit_buffer_percent,
        );
        let broadcaster = Arc::new(Broadcaster::new(
            client.clone(),
            signers,
            nonces.clone(),
            options.retry.clone(),
            events.clone(),
        ));
        let reader = Arc::new(BatchReader::new(client.clone(), options.cache_ttl));
        let reorg = Arc::new(ReorgMonitor::new(client.clone(), options.reorg_retention_blocks));
        let stuck = Arc::new(StuckTransactionHandler::new(
            client.clone(),
            broadcaster.clone(),
            nonces.clone(),
            events.clone(),
            options.retry.clone(),
        ));
        let verifier = Arc::new(ExecutionVerifier::new(reader.clone(), options.gas_warning_bps));
        let tracker = Arc::new(ConfirmationTracker::new(
            client.clone(),
            reorg,
            stuck,
            verifier,
            nonces.clone(),
            broadcaster.clone(),
            store.clone(),
            events.clone(),
            options.retry,
        ));

        Self {
            client,
            builder,
            broadcaster,
            nonces,
            tracker,
            reader,
            store,
            events,
            tiers: options.tiers,
            watches: Arc::new(DashMap::new()),
        }
    }

    /// Build, sign and broadcast `intent`, then watch it until it settles
    pub async fn submit(&self, intent: TransactionIntent) -> EngineResult<WatchHandle> {
        let from = intent
            .from
            .unwrap_or_else(|| self.broadcaster.signers().primary());
        // unknown senders fail before a nonce is reserved
        self.broadcaster.signers().get(&from)?;

        let request = self.builder.build(from, &intent).await?;
        let policy = self
            .tiers
            .policy_for(intent.value, &intent.data, intent.confirmations);

        let mut record = TransactionRecord::new(request, policy.required_confirmations);
        record.verification = intent.verification.filter(|spec| !spec.is_empty());
        record.stuck_action = intent.stuck_action;
        info!(
            "Submitting {} from {:?} at nonce {} ({} confirmations)",
            record.id,
            from,
            record.nonce(),
            policy.required_confirmations
        );

        let updates = self.events.updates_for(record.id);
        self.persist(&record).await;
        let submitted = self.broadcaster.submit(&mut record).await;
        self.persist(&record).await;
        submitted?;

        Ok(self.spawn_watch(record, policy, updates))
    }

    fn spawn_watch(
        &self,
        record: TransactionRecord,
        policy: ConfirmationPolicy,
        updates: BoxStream<'static, LifecycleEvent>,
    ) -> WatchHandle {
        let id = record.id;
        let (stop_tx, stop_rx) = watch::channel(false);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (snapshot_tx, snapshot_rx) = watch::channel(record.clone());
        let control = WatchCommands {
            stop: Arc::new(stop_tx),
            commands: command_tx,
        };

        self.watches.insert(
            id,
            WatchSlot {
                control: control.clone(),
                snapshot: snapshot_rx.clone(),
            },
        );
        crate::metrics::set_active_watches(self.watches.len());

        let tracker = self.tracker.clone();
        let watches = self.watches.clone();
        let watch = Watch::new(record, policy).with_snapshot(snapshot_tx);
        let task = tokio::spawn(async move {
            let result = tracker
                .run(
                    watch,
                    WatchControl {
                        stop: stop_rx,
                        commands: command_rx,
                    },
                )
                .await;
            watches.remove(&id);
            crate::metrics::set_active_watches(watches.len());
            result
        });

        WatchHandle::new(id, snapshot_rx, updates, self.events.clone(), control, task)
    }

    /// Latest known state of a record, live or stored
    pub async fn record(&self, id: Uuid) -> EngineResult<TransactionRecord> {
        if let Some(slot) = self.watches.get(&id) {
            return Ok(slot.snapshot.borrow().clone());
        }
        self.store
            .get(id)
            .await?
            .ok_or(EngineError::TransactionNotFound { id })
    }

    pub async fn accelerate(&self, id: Uuid) -> EngineResult<H256> {
        self.command(id, StuckAction::Accelerate).await
    }

    /// Replace the pending transaction with a zero-value self-transfer
    pub async fn cancel(&self, id: Uuid) -> EngineResult<H256> {
        self.command(id, StuckAction::Cancel).await
    }

    async fn command(&self, id: Uuid, action: StuckAction) -> EngineResult<H256> {
        let control = self.control(id).await?;
        control.send(id, action).await
    }

    /// Stop the local watch; nothing is sent to the network
    pub async fn stop_watch(&self, id: Uuid) -> EngineResult<()> {
        self.control(id).await?.stop();
        Ok(())
    }

    async fn control(&self, id: Uuid) -> EngineResult<WatchCommands> {
        if let Some(slot) = self.watches.get(&id) {
            return Ok(slot.control.clone());
        }
        match self.store.get(id).await? {
            Some(record) => Err(EngineError::InvalidAction(format!(
                "transaction {} is {} and not being watched",
                id, record.status
            ))),
            None => Err(EngineError::TransactionNotFound { id }),
        }
    }

    /// Resume watches for records that were in flight when the process stopped
    pub async fn recover(&self) -> EngineResult<Vec<WatchHandle>> {
        let records = self.store.load_active().await?;
        let mut handles = Vec::new();

        for mut record in records {
            if self.watches.contains_key(&record.id) {
                continue;
            }

            let interrupted = match record.status {
                TxStatus::Built | TxStatus::Signed => true,
                TxStatus::Broadcast => record.attempts.is_empty(),
                _ => false,
            };
            if interrupted {
                warn!(
                    "Record {} was {} at shutdown, marking failed",
                    record.id, record.status
                );
                record.fail(&EngineError::Internal(
                    "interrupted before broadcast".to_string(),
                ))?;
                self.persist(&record).await;
                continue;
            }
            if record.status == TxStatus::Broadcast {
                record.transition(TxStatus::Pending)?;
            }

            self.nonces
                .track_submitted(record.account(), record.nonce())
                .await;
            let policy = ConfirmationPolicy {
                required_confirmations: record.required_confirmations,
                timeout: self.tiers.timeout,
                poll_interval: self.tiers.poll_interval,
            };
            info!(
                "Resuming watch for {} ({}, nonce {})",
                record.id,
                record.status,
                record.nonce()
            );

            let updates = self.events.updates_for(record.id);
            handles.push(self.spawn_watch(record, policy, updates));
        }

        info!("Recovered {} in-flight transactions", handles.len());
        Ok(handles)
    }

    /// Every lifecycle event of every record
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub async fn stats(&self) -> EngineResult<EngineStats> {
        Ok(EngineStats {
            records: self.store.stats().await?,
            active_watches: self.watches.len(),
        })
    }

    /// Ledger reachable and store healthy
    pub async fn health_check(&self) -> EngineResult<u64> {
        let head = self
            .client
            .block_number()
            .await
            .map_err(|e| EngineError::chain(self.client.chain_id(), e))?;
        self.store.health_check().await?;
        Ok(head)
    }

    pub fn reader(&self) -> Arc<BatchReader> {
        self.reader.clone()
    }

    pub fn chain_id(&self) -> u64 {
        self.client.chain_id()
    }

    /// Stop every watch loop
    pub fn stop_all(&self) {
        for slot in self.watches.iter() {
            slot.control.stop();
        }
        info!("Stopped {} watches", self.watches.len());
    }

    /// Drop expired cached reads every `every`
    pub fn spawn_cache_purge(&self, every: Duration) -> JoinHandle<()> {
        let reader = self.reader.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let purged = reader.purge_expired();
                if purged > 0 {
                    debug!("Purged {} expired reads", purged);
                }
            }
        })
    }

    async fn persist(&self, record: &TransactionRecord) {
        if let Err(e) = self.store.save(record).await {
            warn!("Failed to persist record {}: {}", record.id, e);
        }
    }
}
