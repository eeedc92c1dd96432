//! Reorg detection for tracked inclusion blocks
//!
//! A transaction's inclusion only counts while the block hash recorded at
//! inclusion is still the canonical hash at that height. Shallow reorgs
//! after one or two confirmations are the common case, so every poll
//! re-fetches the block until the required depth is reached.

use super::SharedLedger;
use crate::error::ChainError;
use crate::tx::BlockReference;

use dashmap::DashMap;
use ethers::types::H256;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgCheck {
    Canonical,
    /// The chain now has `observed` at that height (`None` if it has no block there)
    Displaced { observed: Option<H256> },
}

/// Remembers the hash last seen at every observed height
pub struct ReorgMonitor {
    client: SharedLedger,
    observed: DashMap<u64, H256>,
    /// Heights further than this below head are forgotten
    retention: u64,
}

impl ReorgMonitor {
    pub fn new(client: SharedLedger, retention: u64) -> Self {
        Self {
            client,
            observed: DashMap::new(),
            retention,
        }
    }

    /// Remember `block` as the hash at its height. Returns the hash seen there before.
    pub fn observe(&self, block: &BlockReference) -> Option<H256> {
        let previous = self.observed.insert(block.number, block.hash);
        if let Some(previous) = previous {
            if previous != block.hash {
                debug!(
                    "Block {} hash changed from {:?} to {:?}",
                    block.number, previous, block.hash
                );
            }
        }
        previous
    }

    /// Re-fetch the block at `inclusion.number` and compare hashes
    pub async fn check(&self, inclusion: &BlockReference) -> Result<ReorgCheck, ChainError> {
        let observed = self.client.block(inclusion.number).await?.map(|b| b.hash);

        let previous = match observed {
            Some(hash) => self.observe(&BlockReference {
                number: inclusion.number,
                hash,
            }),
            None => self.observed.remove(&inclusion.number).map(|(_, hash)| hash),
        };

        if observed == Some(inclusion.hash) {
            return Ok(ReorgCheck::Canonical);
        }

        warn!(
            "Reorg detected on chain {}: block {} expected {:?}, found {:?} (last seen {:?})",
            self.client.chain_id(),
            inclusion.number,
            inclusion.hash,
            observed,
            previous
        );
        crate::metrics::record_reorg(self.client.chain_id());

        Ok(ReorgCheck::Displaced { observed })
    }

    /// Drop heights that fell out of the retention window
    pub fn prune(&self, head: u64) {
        let floor = head.saturating_sub(self.retention);
        self.observed.retain(|number, _| *number >= floor);
    }
}
