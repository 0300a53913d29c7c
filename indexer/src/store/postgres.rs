use std::str::FromStr;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, QueryBuilder, postgres::PgPoolOptions, types::Json};
use tracing::info;

use super::{
    EventQuery, EventReader, PoolEventRecord, PositionEventRecord, TransferRecord, parse_pool,
};
use crate::{
    checkpoint::CheckpointStore,
    error::StoreError,
    types::{Checkpoint, DecodedEvent, PoolEventName, PositionInfo, hex_address},
    writer::{EventStore, UpsertOutcome},
};

const TRANSFER_COLUMNS: &str = "tx_hash, log_index, token_id::text AS token_id, from_address, \
     to_address, block_number, block_timestamp, metadata";

const POSITION_COLUMNS: &str = "tx_hash, log_index, token_id::text AS token_id, pool, event_type, \
     block_number, block_timestamp, tick_lower, tick_upper, liquidity_delta::text AS liquidity_delta, \
     amount0::text AS amount0, amount1::text AS amount1, price, usd_value, metadata";

const POOL_COLUMNS: &str = "tx_hash, log_index, pool, event_name, block_number, block_timestamp, \
     sender, owner, recipient, tick_lower, tick_upper, tick, liquidity::text AS liquidity, \
     amount::text AS amount, amount0::text AS amount0, amount1::text AS amount1, \
     sqrt_price_x96::text AS sqrt_price_x96, price, metadata";

#[derive(Clone, Debug)]
pub struct PgStore {
    pub pool: Pool<Postgres>,
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    source: String,
    key: String,
    last_block: i64,
    events_count: i64,
    updated_at: DateTime<Utc>,
}

impl From<CheckpointRow> for Checkpoint {
    fn from(row: CheckpointRow) -> Self {
        Checkpoint {
            source: row.source,
            key: row.key,
            last_block: row.last_block.max(0) as u64,
            events_count: row.events_count.max(0) as u64,
            updated_at: row.updated_at,
        }
    }
}

fn numeric(value: &str) -> Result<BigDecimal, StoreError> {
    BigDecimal::from_str(value).map_err(|e| StoreError::Row(format!("invalid numeric {value}: {e}")))
}

fn opt_numeric(value: Option<&String>) -> Result<Option<BigDecimal>, StoreError> {
    value.map(|v| numeric(v)).transpose()
}

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        PgStore { pool }
    }

    pub async fn from_db_url(db_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Creates the ledger and checkpoint tables and their indexes if missing.
    pub async fn create_tables(&self) -> Result<(), StoreError> {
        let tables = [
            r#"
            CREATE TABLE IF NOT EXISTS position_transfers (
                tx_hash VARCHAR(66) NOT NULL,
                log_index BIGINT NOT NULL,
                token_id NUMERIC(78, 0) NOT NULL,
                from_address VARCHAR(42) NOT NULL,
                to_address VARCHAR(42) NOT NULL,
                block_number BIGINT NOT NULL,
                block_timestamp BIGINT,
                metadata JSONB NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                PRIMARY KEY (tx_hash, log_index)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS position_events (
                tx_hash VARCHAR(66) NOT NULL,
                log_index BIGINT NOT NULL,
                token_id NUMERIC(78, 0) NOT NULL,
                pool VARCHAR(42),
                event_type VARCHAR(16) NOT NULL,
                block_number BIGINT NOT NULL,
                block_timestamp BIGINT,
                tick_lower INTEGER,
                tick_upper INTEGER,
                liquidity_delta NUMERIC(78, 0),
                amount0 NUMERIC(78, 0),
                amount1 NUMERIC(78, 0),
                price DOUBLE PRECISION,
                usd_value DOUBLE PRECISION,
                metadata JSONB NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                PRIMARY KEY (tx_hash, log_index)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS pool_events (
                tx_hash VARCHAR(66) NOT NULL,
                log_index BIGINT NOT NULL,
                pool VARCHAR(42) NOT NULL,
                event_name VARCHAR(16) NOT NULL,
                block_number BIGINT NOT NULL,
                block_timestamp BIGINT,
                sender VARCHAR(42),
                owner VARCHAR(42),
                recipient VARCHAR(42),
                tick_lower INTEGER,
                tick_upper INTEGER,
                tick INTEGER,
                liquidity NUMERIC(78, 0),
                amount NUMERIC(78, 0),
                amount0 NUMERIC(78, 0),
                amount1 NUMERIC(78, 0),
                sqrt_price_x96 NUMERIC(78, 0),
                price DOUBLE PRECISION,
                metadata JSONB NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                PRIMARY KEY (tx_hash, log_index)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sync_checkpoints (
                source VARCHAR(64) NOT NULL,
                key VARCHAR(128) NOT NULL,
                last_block BIGINT NOT NULL,
                events_count BIGINT NOT NULL DEFAULT 0,
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                PRIMARY KEY (source, key)
            )
            "#,
        ];

        for table_sql in tables {
            sqlx::query(table_sql).execute(&self.pool).await?;
        }

        let indexes = vec![
            "CREATE INDEX IF NOT EXISTS idx_transfers_token ON position_transfers(token_id)",
            "CREATE INDEX IF NOT EXISTS idx_transfers_block ON position_transfers(block_number, log_index)",
            "CREATE INDEX IF NOT EXISTS idx_position_events_token ON position_events(token_id)",
            "CREATE INDEX IF NOT EXISTS idx_position_events_pool ON position_events(pool)",
            "CREATE INDEX IF NOT EXISTS idx_position_events_block ON position_events(block_number, log_index)",
            "CREATE INDEX IF NOT EXISTS idx_position_events_unresolved ON position_events(token_id) WHERE pool IS NULL",
            "CREATE INDEX IF NOT EXISTS idx_pool_events_pool ON pool_events(pool)",
            "CREATE INDEX IF NOT EXISTS idx_pool_events_block ON pool_events(block_number, log_index)",
            "CREATE INDEX IF NOT EXISTS idx_pool_events_created ON pool_events(pool) WHERE event_name = 'POOL_CREATED'",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        info!("database tables ready");
        Ok(())
    }

    async fn upsert_transfer(&self, record: &TransferRecord) -> Result<bool, StoreError> {
        let inserted = sqlx::query_scalar::<_, bool>(
            r#"
            INSERT INTO position_transfers
                (tx_hash, log_index, token_id, from_address, to_address, block_number, block_timestamp, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (tx_hash, log_index) DO UPDATE SET
                block_timestamp = COALESCE(EXCLUDED.block_timestamp, position_transfers.block_timestamp),
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&record.tx_hash)
        .bind(record.log_index)
        .bind(numeric(&record.token_id)?)
        .bind(&record.from_address)
        .bind(&record.to_address)
        .bind(record.block_number)
        .bind(record.block_timestamp)
        .bind(Json(&record.metadata))
        .fetch_one(&self.pool)
        .await?;
        Ok(inserted)
    }

    async fn upsert_position_event(&self, record: &PositionEventRecord) -> Result<bool, StoreError> {
        let inserted = sqlx::query_scalar::<_, bool>(
            r#"
            INSERT INTO position_events
                (tx_hash, log_index, token_id, pool, event_type, block_number, block_timestamp,
                 tick_lower, tick_upper, liquidity_delta, amount0, amount1, price, usd_value, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (tx_hash, log_index) DO UPDATE SET
                block_timestamp = COALESCE(EXCLUDED.block_timestamp, position_events.block_timestamp),
                pool = COALESCE(position_events.pool, EXCLUDED.pool),
                tick_lower = COALESCE(position_events.tick_lower, EXCLUDED.tick_lower),
                tick_upper = COALESCE(position_events.tick_upper, EXCLUDED.tick_upper),
                price = COALESCE(EXCLUDED.price, position_events.price),
                usd_value = COALESCE(EXCLUDED.usd_value, position_events.usd_value),
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&record.tx_hash)
        .bind(record.log_index)
        .bind(numeric(&record.token_id)?)
        .bind(&record.pool)
        .bind(&record.event_type)
        .bind(record.block_number)
        .bind(record.block_timestamp)
        .bind(record.tick_lower)
        .bind(record.tick_upper)
        .bind(opt_numeric(record.liquidity_delta.as_ref())?)
        .bind(opt_numeric(record.amount0.as_ref())?)
        .bind(opt_numeric(record.amount1.as_ref())?)
        .bind(record.price)
        .bind(record.usd_value)
        .bind(Json(&record.metadata))
        .fetch_one(&self.pool)
        .await?;
        Ok(inserted)
    }

    async fn upsert_pool_event(&self, record: &PoolEventRecord) -> Result<bool, StoreError> {
        let inserted = sqlx::query_scalar::<_, bool>(
            r#"
            INSERT INTO pool_events
                (tx_hash, log_index, pool, event_name, block_number, block_timestamp, sender, owner,
                 recipient, tick_lower, tick_upper, tick, liquidity, amount, amount0, amount1,
                 sqrt_price_x96, price, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (tx_hash, log_index) DO UPDATE SET
                block_timestamp = COALESCE(EXCLUDED.block_timestamp, pool_events.block_timestamp),
                price = COALESCE(EXCLUDED.price, pool_events.price),
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&record.tx_hash)
        .bind(record.log_index)
        .bind(&record.pool)
        .bind(&record.event_name)
        .bind(record.block_number)
        .bind(record.block_timestamp)
        .bind(&record.sender)
        .bind(&record.owner)
        .bind(&record.recipient)
        .bind(record.tick_lower)
        .bind(record.tick_upper)
        .bind(record.tick)
        .bind(opt_numeric(record.liquidity.as_ref())?)
        .bind(opt_numeric(record.amount.as_ref())?)
        .bind(opt_numeric(record.amount0.as_ref())?)
        .bind(opt_numeric(record.amount1.as_ref())?)
        .bind(opt_numeric(record.sqrt_price_x96.as_ref())?)
        .bind(record.price)
        .bind(Json(&record.metadata))
        .fetch_one(&self.pool)
        .await?;
        Ok(inserted)
    }
}

fn push_block_range(builder: &mut QueryBuilder<'_, Postgres>, query: &EventQuery) {
    if let Some(from) = query.from_block {
        builder.push(" AND block_number >= ").push_bind(from);
    }
    if let Some(to) = query.to_block {
        builder.push(" AND block_number <= ").push_bind(to);
    }
}

fn push_page(builder: &mut QueryBuilder<'_, Postgres>, query: &EventQuery) {
    builder
        .push(" ORDER BY block_number, log_index LIMIT ")
        .push_bind(query.limit())
        .push(" OFFSET ")
        .push_bind(query.offset());
}

#[async_trait]
impl EventStore for PgStore {
    async fn upsert_event(&self, event: &DecodedEvent) -> Result<UpsertOutcome, StoreError> {
        let inserted = match event {
            DecodedEvent::Transfer(e) => self.upsert_transfer(&e.into()).await?,
            DecodedEvent::Position(e) => self.upsert_position_event(&e.into()).await?,
            DecodedEvent::Pool(e) => self.upsert_pool_event(&e.into()).await?,
        };
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn unresolved_positions(&self, limit: i64) -> Result<Vec<U256>, StoreError> {
        let token_ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT token_id::text
            FROM position_events
            WHERE pool IS NULL
            ORDER BY 1
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        token_ids
            .iter()
            .map(|t| {
                t.parse::<U256>()
                    .map_err(|e| StoreError::Row(format!("invalid token id {t}: {e}")))
            })
            .collect()
    }

    async fn assign_pool(&self, token_id: U256, info: &PositionInfo) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE position_events
            SET pool = $2,
                tick_lower = COALESCE(tick_lower, $3),
                tick_upper = COALESCE(tick_upper, $4),
                updated_at = NOW()
            WHERE token_id = $1 AND pool IS NULL
            "#,
        )
        .bind(numeric(&token_id.to_string())?)
        .bind(hex_address(&info.pool))
        .bind(info.tick_lower)
        .bind(info.tick_upper)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    async fn get(&self, source: &str, key: &str) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT source, key, last_block, events_count, updated_at
            FROM sync_checkpoints
            WHERE source = $1 AND key = $2
            "#,
        )
        .bind(source)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Checkpoint::from))
    }

    async fn set(
        &self,
        source: &str,
        key: &str,
        last_block: u64,
        events_delta: u64,
    ) -> Result<Checkpoint, StoreError> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            INSERT INTO sync_checkpoints (source, key, last_block, events_count, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (source, key) DO UPDATE SET
                last_block = GREATEST(sync_checkpoints.last_block, EXCLUDED.last_block),
                events_count = sync_checkpoints.events_count + EXCLUDED.events_count,
                updated_at = NOW()
            RETURNING source, key, last_block, events_count, updated_at
            "#,
        )
        .bind(source)
        .bind(key)
        .bind(last_block as i64)
        .bind(events_delta as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn reset(&self, source: &str, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sync_checkpoints WHERE source = $1 AND key = $2")
            .bind(source)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<Checkpoint>, StoreError> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT source, key, last_block, events_count, updated_at
            FROM sync_checkpoints
            ORDER BY source, key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Checkpoint::from).collect())
    }
}

#[async_trait]
impl EventReader for PgStore {
    async fn transfers(&self, query: &EventQuery) -> Result<Vec<TransferRecord>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {TRANSFER_COLUMNS} FROM position_transfers WHERE TRUE"
        ));
        if let Some(token_id) = &query.token_id {
            builder.push(" AND token_id = ").push_bind(numeric(token_id)?);
        }
        push_block_range(&mut builder, query);
        push_page(&mut builder, query);

        Ok(builder
            .build_query_as::<TransferRecord>()
            .fetch_all(&self.pool)
            .await?)
    }

    async fn position_events(
        &self,
        query: &EventQuery,
    ) -> Result<Vec<PositionEventRecord>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {POSITION_COLUMNS} FROM position_events WHERE TRUE"
        ));
        if let Some(token_id) = &query.token_id {
            builder.push(" AND token_id = ").push_bind(numeric(token_id)?);
        }
        if let Some(pool) = query.pool() {
            builder.push(" AND pool = ").push_bind(pool);
        }
        if let Some(event_type) = query.position_event_type()? {
            builder.push(" AND event_type = ").push_bind(event_type.as_str());
        }
        push_block_range(&mut builder, query);
        push_page(&mut builder, query);

        Ok(builder
            .build_query_as::<PositionEventRecord>()
            .fetch_all(&self.pool)
            .await?)
    }

    async fn pool_events(&self, query: &EventQuery) -> Result<Vec<PoolEventRecord>, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {POOL_COLUMNS} FROM pool_events WHERE TRUE"
        ));
        if let Some(pool) = query.pool() {
            builder.push(" AND pool = ").push_bind(pool);
        }
        if let Some(event_name) = query.pool_event_name()? {
            builder.push(" AND event_name = ").push_bind(event_name.as_str());
        }
        push_block_range(&mut builder, query);
        push_page(&mut builder, query);

        Ok(builder
            .build_query_as::<PoolEventRecord>()
            .fetch_all(&self.pool)
            .await?)
    }

    async fn created_pools(&self) -> Result<Vec<Address>, StoreError> {
        let pools: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT pool FROM pool_events WHERE event_name = $1 ORDER BY pool",
        )
        .bind(PoolEventName::PoolCreated.as_str())
        .fetch_all(&self.pool)
        .await?;
        pools.iter().map(|pool| parse_pool(pool)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_accepts_full_uint256_range() {
        let max = U256::MAX.to_string();
        assert!(numeric(&max).is_ok());
        assert!(matches!(numeric("0xabc"), Err(StoreError::Row(_))));
    }

    #[test]
    fn test_page_clause_binds_limit_and_offset() {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT 1 FROM pool_events WHERE TRUE");
        push_block_range(
            &mut builder,
            &EventQuery {
                from_block: Some(5),
                ..Default::default()
            },
        );
        push_page(&mut builder, &EventQuery::default());
        assert_eq!(
            builder.sql(),
            "SELECT 1 FROM pool_events WHERE TRUE AND block_number >= $1 ORDER BY block_number, log_index LIMIT $2 OFFSET $3"
        );
    }
}
