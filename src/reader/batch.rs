//! Cached contract reads with batching of misses

use super::cache::ReadCache;
use crate::chain::{ReadCall, SharedLedger};
use crate::error::ChainError;

use ethers::types::Bytes;
use std::time::Duration;
use tracing::debug;

pub struct BatchReader {
    client: SharedLedger,
    cache: ReadCache<ReadCall, Bytes>,
}

impl BatchReader {
    pub fn new(client: SharedLedger, ttl: Duration) -> Self {
        Self {
            client,
            cache: ReadCache::new("contract_reads", ttl),
        }
    }

    pub async fn read(&self, call: &ReadCall) -> Result<Bytes, ChainError> {
        self.cache
            .get_or_fetch(call, || self.client.call(call))
            .await
    }

    /// Results in the order of `calls`. Cache hits are served locally and the
    /// misses go out as a single batch. A failed call never fails its siblings.
    pub async fn aggregate(&self, calls: &[ReadCall]) -> Result<Vec<Result<Bytes, ChainError>>, ChainError> {
        let mut results: Vec<Option<Result<Bytes, ChainError>>> = calls
            .iter()
            .map(|call| self.cache.lookup(call).map(Ok))
            .collect();

        let missing: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_none())
            .map(|(i, _)| i)
            .collect();

        if !missing.is_empty() {
            let batch: Vec<ReadCall> = missing.iter().map(|i| calls[*i].clone()).collect();
            debug!("Batching {} of {} reads", batch.len(), calls.len());

            let fetched = self.client.call_batch(&batch).await?;
            if fetched.len() != batch.len() {
                return Err(ChainError::Transport(format!(
                    "batch returned {} results for {} calls",
                    fetched.len(),
                    batch.len()
                )));
            }

            for ((idx, call), result) in missing.into_iter().zip(batch).zip(fetched) {
                if let Ok(value) = &result {
                    self.cache.insert(call, value.clone());
                }
                results[idx] = Some(result);
            }
        }

        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(ChainError::Transport("missing batch result".into()))))
            .collect())
    }

    pub fn invalidate(&self, call: &ReadCall) {
        self.cache.invalidate(call);
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
