//! Record persistence
//!
//! Handles:
//! - Saving every record state change
//! - Reloading in-flight records for restart recovery
//! - Per-status statistics

mod manager;
mod memory;

pub use manager::PgRecordStore;
pub use memory::MemoryRecordStore;

use crate::error::EngineResult;
use crate::tx::TransactionRecord;

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Record counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordStats {
    pub by_status: BTreeMap<String, u64>,
    pub total: u64,
}

impl RecordStats {
    pub fn count(&self, status: &str) -> u64 {
        self.by_status.get(status).copied().unwrap_or(0)
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or overwrite the record with the same id
    async fn save(&self, record: &TransactionRecord) -> EngineResult<()>;

    async fn get(&self, id: Uuid) -> EngineResult<Option<TransactionRecord>>;

    /// Records not yet in a terminal state
    async fn load_active(&self) -> EngineResult<Vec<TransactionRecord>>;

    async fn stats(&self) -> EngineResult<RecordStats>;

    async fn health_check(&self) -> EngineResult<()>;
}
