//! Nonce allocation for reliable transaction submission
//!
//! Handles:
//! - Serialized, gap-free reservation per account
//! - Release of nonces whose build or broadcast failed, for reuse by the next reservation
//! - Resync after the network reports a nonce as already used

use crate::chain::SharedLedger;
use crate::error::{EngineError, EngineResult};

use dashmap::DashMap;
use ethers::types::Address;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// Handed out, not yet accepted by the network
    Reserved,
    /// Accepted by the network, not yet mined
    Submitted,
}

/// Per-account nonce state
#[derive(Debug, Default)]
struct AccountNonces {
    /// Next never-issued nonce, `None` until first synced
    next: Option<u64>,
    in_flight: BTreeMap<u64, Slot>,
    /// Nonces below `next` handed back after a failure
    released: BTreeSet<u64>,
}

impl AccountNonces {
    /// Pull `next` down over released nonces that now sit at the top
    fn collapse(&mut self) {
        while let Some(next) = self.next {
            if next > 0 && self.released.remove(&(next - 1)) {
                self.next = Some(next - 1);
            } else {
                break;
            }
        }
    }
}

/// Single writer of the next-nonce counter for every account
pub struct NonceAllocator {
    client: SharedLedger,
    accounts: DashMap<Address, Arc<Mutex<AccountNonces>>>,
}

impl NonceAllocator {
    pub fn new(client: SharedLedger) -> Self {
        Self {
            client,
            accounts: DashMap::new(),
        }
    }

    fn account(&self, account: Address) -> Arc<Mutex<AccountNonces>> {
        self.accounts.entry(account).or_default().clone()
    }

    /// Reserve the next nonce for `account`. Reservations for one account are serialized.
    pub async fn reserve(&self, account: Address) -> EngineResult<u64> {
        let slot = self.account(account);
        let mut state = slot.lock().await;

        if let Some(nonce) = state.released.pop_first() {
            state.in_flight.insert(nonce, Slot::Reserved);
            debug!("Reusing released nonce {} for {:?}", nonce, account);
            return Ok(nonce);
        }

        let next = match state.next {
            // nothing tracked locally: the network count is the only source of truth
            _ if state.in_flight.is_empty() => {
                let network = self.fetch(account).await?;
                state.next.map_or(network, |local| local.max(network))
            }
            Some(next) => next,
            None => self.fetch(account).await?,
        };

        state.next = Some(next + 1);
        state.in_flight.insert(next, Slot::Reserved);
        debug!("Allocated nonce {} for {:?}", next, account);
        Ok(next)
    }

    /// The network accepted a transaction at `nonce`
    pub async fn mark_submitted(&self, account: Address, nonce: u64) {
        let slot = self.account(account);
        let mut state = slot.lock().await;
        state.in_flight.insert(nonce, Slot::Submitted);
    }

    /// Hand back a nonce whose build or broadcast failed. Each reservation is released at most once.
    pub async fn release(&self, account: Address, nonce: u64) -> EngineResult<()> {
        let slot = self.account(account);
        let mut state = slot.lock().await;

        if state.in_flight.remove(&nonce).is_none() {
            return Err(EngineError::Nonce {
                account,
                message: format!("nonce {} is not in flight", nonce),
            });
        }

        if state.next == Some(nonce + 1) {
            state.next = Some(nonce);
            state.collapse();
        } else {
            state.released.insert(nonce);
        }

        crate::metrics::record_nonce_released(self.client.chain_id());
        debug!("Released nonce {} for {:?}", nonce, account);
        Ok(())
    }

    /// A transaction at `nonce` was mined (successfully or not)
    pub async fn confirm(&self, account: Address, nonce: u64) {
        let slot = self.account(account);
        let mut state = slot.lock().await;
        state.in_flight.remove(&nonce);
    }

    /// The network rejected `stale` as already used. Drop it and resync the
    /// counter; the next reservation lands above both the network count and `stale`.
    pub async fn resync(&self, account: Address, stale: u64) -> EngineResult<()> {
        let network = self.fetch(account).await?;
        let floor = network.max(stale + 1);

        let slot = self.account(account);
        let mut state = slot.lock().await;

        state.in_flight.remove(&stale);
        state.released.retain(|n| *n >= floor);
        let next = state.next.map_or(floor, |local| local.max(floor));
        state.next = Some(next);

        warn!(
            "Nonce {} for {:?} already used, next nonce is now {}",
            stale, account, next
        );
        Ok(())
    }

    /// Seed a nonce recovered from storage as submitted
    pub async fn track_submitted(&self, account: Address, nonce: u64) {
        let slot = self.account(account);
        let mut state = slot.lock().await;

        state.in_flight.insert(nonce, Slot::Submitted);
        state.released.remove(&nonce);
        let next = state.next.map_or(nonce + 1, |local| local.max(nonce + 1));
        state.next = Some(next);
    }

    /// Nonces currently reserved or submitted
    pub async fn in_flight(&self, account: Address) -> Vec<u64> {
        match self.accounts.get(&account).map(|s| s.clone()) {
            Some(slot) => slot.lock().await.in_flight.keys().copied().collect(),
            None => Vec::new(),
        }
    }

    async fn fetch(&self, account: Address) -> EngineResult<u64> {
        self.client
            .transaction_count(account)
            .await
            .map_err(|e| EngineError::Nonce {
                account,
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLedger;
    use tokio_test::assert_err;

    fn account() -> Address {
        Address::repeat_byte(0x11)
    }

    fn allocator(start: u64) -> (Arc<FakeLedger>, NonceAllocator) {
        let ledger = Arc::new(FakeLedger::new(1));
        ledger.set_account_nonce(account(), start);
        (ledger.clone(), NonceAllocator::new(ledger))
    }

    #[tokio::test]
    async fn concurrent_reservations_are_distinct_and_gap_free() {
        let (ledger, allocator) = allocator(5);
        let allocator = Arc::new(allocator);

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let allocator = allocator.clone();
                tokio::spawn(async move { allocator.reserve(account()).await.unwrap() })
            })
            .collect();

        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap());
        }
        nonces.sort_unstable();

        assert_eq!(nonces, (5..25).collect::<Vec<_>>());
        assert_eq!(ledger.count_calls(), 1);
    }

    #[tokio::test]
    async fn released_nonce_is_reused_before_new_ones() {
        let (_, allocator) = allocator(5);
        let a = allocator.reserve(account()).await.unwrap();
        let b = allocator.reserve(account()).await.unwrap();
        let c = allocator.reserve(account()).await.unwrap();
        assert_eq!((a, b, c), (5, 6, 7));

        allocator.release(account(), b).await.unwrap();
        assert_eq!(allocator.reserve(account()).await.unwrap(), 6);
        assert_eq!(allocator.reserve(account()).await.unwrap(), 8);
    }

    #[tokio::test]
    async fn double_release_is_rejected() {
        let (_, allocator) = allocator(0);
        let nonce = allocator.reserve(account()).await.unwrap();
        allocator.release(account(), nonce).await.unwrap();
        assert_err!(allocator.release(account(), nonce).await);
    }

    #[tokio::test]
    async fn releasing_the_top_rolls_the_counter_back() {
        let (_, allocator) = allocator(5);
        let a = allocator.reserve(account()).await.unwrap();
        let b = allocator.reserve(account()).await.unwrap();

        allocator.release(account(), a).await.unwrap();
        allocator.release(account(), b).await.unwrap();

        assert!(allocator.in_flight(account()).await.is_empty());
        assert_eq!(allocator.reserve(account()).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn resync_skips_past_a_used_nonce_even_if_the_node_lags() {
        let (ledger, allocator) = allocator(5);
        let stale = allocator.reserve(account()).await.unwrap();
        assert_eq!(stale, 5);

        // node still reports 5 as the next nonce
        ledger.set_reported_count(account(), 5);
        allocator.resync(account(), stale).await.unwrap();
        assert_eq!(allocator.reserve(account()).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn tracked_submissions_avoid_the_network() {
        let (ledger, allocator) = allocator(0);
        allocator.track_submitted(account(), 9).await;
        assert_eq!(allocator.reserve(account()).await.unwrap(), 10);
        assert_eq!(ledger.count_calls(), 0);
    }

    #[tokio::test]
    async fn confirmed_nonces_leave_flight() {
        let (_, allocator) = allocator(3);
        let nonce = allocator.reserve(account()).await.unwrap();
        allocator.mark_submitted(account(), nonce).await;
        allocator.confirm(account(), nonce).await;
        assert!(allocator.in_flight(account()).await.is_empty());
        assert_err!(allocator.release(account(), nonce).await);
    }
}
