//! PostgreSQL record store

use super::{RecordStats, RecordStore};
use crate::config::DatabaseConfig;
use crate::error::{EngineError, EngineResult};
use crate::tx::TransactionRecord;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

/// Records as JSONB, with the columns recovery and stats filter on
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn new(config: &DatabaseConfig) -> EngineResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> EngineResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tx_records (
                id UUID PRIMARY KEY,
                chain_id BIGINT NOT NULL,
                account VARCHAR(42) NOT NULL,
                nonce BIGINT NOT NULL,
                status VARCHAR(20) NOT NULL,
                tx_hash VARCHAR(66),
                record JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tx_records_status
            ON tx_records (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_tx_records_account_nonce
            ON tx_records (chain_id, account, nonce)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn save(&self, record: &TransactionRecord) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tx_records
                (id, chain_id, account, nonce, status, tx_hash, record, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id)
            DO UPDATE SET nonce = $4, status = $5, tx_hash = $6, record = $7, updated_at = $9
            "#,
        )
        .bind(record.id)
        .bind(record.request.chain_id as i64)
        .bind(format!("{:?}", record.account()))
        .bind(record.nonce() as i64)
        .bind(record.status.as_str())
        .bind(record.tx_hash().map(|h| format!("{:?}", h)))
        .bind(Json(record))
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        debug!("Saved record {} as {}", record.id, record.status);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> EngineResult<Option<TransactionRecord>> {
        let row = sqlx::query("SELECT record FROM tx_records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| decode(&r)).transpose()
    }

    async fn load_active(&self) -> EngineResult<Vec<TransactionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM tx_records
            WHERE status NOT IN ('confirmed', 'failed', 'replaced')
            ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode).collect()
    }

    async fn stats(&self) -> EngineResult<RecordStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM tx_records GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = RecordStats::default();
        for row in rows {
            let count = row.get::<i64, _>("count") as u64;
            stats.by_status.insert(row.get("status"), count);
            stats.total += count;
        }
        Ok(stats)
    }

    async fn health_check(&self) -> EngineResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn decode(row: &sqlx::postgres::PgRow) -> EngineResult<TransactionRecord> {
    let Json(record): Json<TransactionRecord> = row
        .try_get("record")
        .map_err(|e| EngineError::Internal(format!("corrupt record row: {}", e)))?;
    Ok(record)
}
