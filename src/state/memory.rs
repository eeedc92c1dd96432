//! In-memory record store, used when no database is configured

use super::{RecordStats, RecordStore};
use crate::error::EngineResult;
use crate::tx::TransactionRecord;

use async_trait::async_trait;
use dashmap::DashMap;
use uuid::Uuid;

/// Records are lost on restart
#[derive(Default)]
pub struct MemoryRecordStore {
    records: DashMap<Uuid, TransactionRecord>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn save(&self, record: &TransactionRecord) -> EngineResult<()> {
        self.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> EngineResult<Option<TransactionRecord>> {
        Ok(self.records.get(&id).map(|r| r.clone()))
    }

    async fn load_active(&self) -> EngineResult<Vec<TransactionRecord>> {
        let mut active: Vec<_> = self
            .records
            .iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.clone())
            .collect();
        active.sort_by_key(|r| r.created_at);
        Ok(active)
    }

    async fn stats(&self) -> EngineResult<RecordStats> {
        let mut stats = RecordStats::default();
        for record in self.records.iter() {
            *stats
                .by_status
                .entry(record.status.as_str().to_string())
                .or_default() += 1;
            stats.total += 1;
        }
        Ok(stats)
    }

    async fn health_check(&self) -> EngineResult<()> {
        Ok(())
    }
}
