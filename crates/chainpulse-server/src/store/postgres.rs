use async_trait::async_trait;
use chainpulse_common::{AccountActivity, Block, PulseError, TimeBucketStat, Transaction, TransactionRow};
use sqlx::PgPool;

use super::{SpanSummary, Store};
use crate::activity;

const BLOCK_COLUMNS: &str = "number, hash, parent_hash, timestamp, gas_used, gas_limit, base_fee_per_gas, miner, transaction_count, size_bytes, indexed_at";

const TX_COLUMNS: &str = "hash, block_number, block_hash, transaction_index, from_address, to_address, value, gas, gas_price, max_fee_per_gas, max_priority_fee_per_gas, input, nonce, tx_type, status, timestamp";

const CURSOR_KEY: &str = "last_indexed_block";

/// Postgres-backed store. All rows are scoped to one network.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    network: String,
}

impl PgStore {
    pub fn new(pool: PgPool, network: impl Into<String>) -> Self {
        Self {
            pool,
            network: network.into(),
        }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> Result<(), PulseError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_block(&self, block: &Block) -> Result<bool, PulseError> {
        // Content at a height is treated as immutable: a repeat is duplicate delivery.
        let result = sqlx::query(
            "INSERT INTO blocks (network, number, hash, parent_hash, timestamp, gas_used, gas_limit, base_fee_per_gas, miner, transaction_count, size_bytes, indexed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (network, number) DO NOTHING"
        )
        .bind(&self.network)
        .bind(block.number)
        .bind(&block.hash)
        .bind(&block.parent_hash)
        .bind(block.timestamp)
        .bind(block.gas_used)
        .bind(block.gas_limit)
        .bind(block.base_fee_per_gas.clone())
        .bind(&block.miner)
        .bind(block.transaction_count)
        .bind(block.size_bytes)
        .bind(block.indexed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn ingest_transaction(&self, tx: &Transaction) -> Result<bool, PulseError> {
        let (gas_price, max_fee, max_priority_fee) = tx.fee.columns();

        let mut db_tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO transactions (network, hash, block_number, block_hash, transaction_index, from_address, to_address, value, gas, gas_price, max_fee_per_gas, max_priority_fee_per_gas, input, nonce, tx_type, status, timestamp)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
             ON CONFLICT (network, hash) DO NOTHING"
        )
        .bind(&self.network)
        .bind(&tx.hash)
        .bind(tx.block_number)
        .bind(&tx.block_hash)
        .bind(tx.transaction_index)
        .bind(&tx.from_address)
        .bind(&tx.to_address)
        .bind(&tx.value)
        .bind(tx.gas)
        .bind(gas_price.cloned())
        .bind(max_fee.cloned())
        .bind(max_priority_fee.cloned())
        .bind(&tx.input)
        .bind(tx.nonce)
        .bind(tx.tx_type)
        .bind(tx.status)
        .bind(tx.timestamp)
        .execute(&mut *db_tx)
        .await?
        .rows_affected()
            == 1;

        if !inserted {
            db_tx.rollback().await?;
            return Ok(false);
        }

        // Deltas arrive address-ordered, so concurrent ingests lock rows in the same order.
        for delta in activity::deltas_for(tx) {
            sqlx::query(
                "INSERT INTO account_activity (network, address, transaction_count, first_seen_block, last_seen_block)
                 VALUES ($1, $2, $3, $4, $4)
                 ON CONFLICT (network, address) DO UPDATE SET
                    transaction_count = account_activity.transaction_count + EXCLUDED.transaction_count,
                    first_seen_block = LEAST(account_activity.first_seen_block, EXCLUDED.first_seen_block),
                    last_seen_block = GREATEST(account_activity.last_seen_block, EXCLUDED.last_seen_block)"
            )
            .bind(&self.network)
            .bind(&delta.address)
            .bind(delta.sent.max(0))
            .bind(delta.block)
            .execute(&mut *db_tx)
            .await?;
        }

        db_tx.commit().await?;
        Ok(true)
    }

    async fn get_block(&self, number: i64) -> Result<Option<Block>, PulseError> {
        let block = sqlx::query_as::<_, Block>(&format!(
            "SELECT {} FROM blocks WHERE network = $1 AND number = $2",
            BLOCK_COLUMNS
        ))
        .bind(&self.network)
        .bind(number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(block)
    }

    async fn get_blocks(&self, start: i64, count: i64) -> Result<Vec<Block>, PulseError> {
        let blocks = sqlx::query_as::<_, Block>(&format!(
            "SELECT {} FROM blocks
             WHERE network = $1 AND number >= $2 AND number < $2 + $3
             ORDER BY number ASC",
            BLOCK_COLUMNS
        ))
        .bind(&self.network)
        .bind(start)
        .bind(count.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(blocks)
    }

    async fn get_transaction(&self, hash: &str) -> Result<Option<Transaction>, PulseError> {
        let row = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions WHERE network = $1 AND hash = $2",
            TX_COLUMNS
        ))
        .bind(&self.network)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Transaction::try_from).transpose()
    }

    async fn get_account_activity(&self, address: &str) -> Result<Option<AccountActivity>, PulseError> {
        let activity = sqlx::query_as::<_, AccountActivity>(
            "SELECT address, transaction_count, first_seen_block, last_seen_block
             FROM account_activity
             WHERE network = $1 AND address = $2",
        )
        .bind(&self.network)
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        Ok(activity)
    }

    async fn get_account_transactions(&self, address: &str, limit: i64) -> Result<Vec<Transaction>, PulseError> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {} FROM transactions
             WHERE network = $1 AND (from_address = $2 OR to_address = $2)
             ORDER BY block_number DESC, transaction_index DESC
             LIMIT $3",
            TX_COLUMNS
        ))
        .bind(&self.network)
        .bind(address)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Transaction::try_from).collect()
    }

    async fn span_summary(&self, since: i64, until: i64) -> Result<SpanSummary, PulseError> {
        let (block_count, transaction_count, first_timestamp, last_timestamp): (i64, i64, Option<i64>, Option<i64>) =
            sqlx::query_as(
                "SELECT COUNT(*), COALESCE(SUM(transaction_count), 0)::BIGINT, MIN(timestamp), MAX(timestamp)
                 FROM blocks
                 WHERE network = $1 AND timestamp >= $2 AND timestamp <= $3",
            )
            .bind(&self.network)
            .bind(since)
            .bind(until)
            .fetch_one(&self.pool)
            .await?;

        Ok(SpanSummary {
            block_count,
            transaction_count,
            first_timestamp,
            last_timestamp,
        })
    }

    async fn rollup(&self, since: i64, until: i64, bucket_seconds: i64) -> Result<Vec<TimeBucketStat>, PulseError> {
        if bucket_seconds <= 0 {
            return Err(PulseError::InvalidInput("bucket size must be positive".to_string()));
        }

        let series = sqlx::query_as::<_, TimeBucketStat>(
            "WITH b AS (
                SELECT (timestamp / $4) * $4 AS bucket_start,
                       COUNT(*) AS block_count,
                       SUM(transaction_count) AS transaction_count,
                       SUM(gas_used) AS gas_used_total
                FROM blocks
                WHERE network = $1 AND timestamp >= $2 AND timestamp <= $3
                GROUP BY 1
             ), v AS (
                SELECT (timestamp / $4) * $4 AS bucket_start, SUM(value) AS value_total
                FROM transactions
                WHERE network = $1 AND timestamp >= $2 AND timestamp <= $3
                GROUP BY 1
             )
             SELECT b.bucket_start,
                    b.transaction_count::BIGINT AS transaction_count,
                    b.block_count,
                    b.gas_used_total::BIGINT AS gas_used_total,
                    COALESCE(v.value_total, 0) AS value_total
             FROM b LEFT JOIN v USING (bucket_start)
             ORDER BY b.bucket_start ASC",
        )
        .bind(&self.network)
        .bind(since)
        .bind(until)
        .bind(bucket_seconds)
        .fetch_all(&self.pool)
        .await?;

        Ok(series)
    }

    async fn get_cursor(&self) -> Result<Option<u64>, PulseError> {
        let result: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM indexer_state WHERE network = $1 AND key = $2"
        )
        .bind(&self.network)
        .bind(CURSOR_KEY)
        .fetch_optional(&self.pool)
        .await?;

        result
            .map(|(value,)| {
                value
                    .parse::<u64>()
                    .map_err(|e| PulseError::Malformed(format!("stored cursor {:?}: {}", value, e)))
            })
            .transpose()
    }

    async fn set_cursor(&self, height: u64) -> Result<(), PulseError> {
        sqlx::query(
            "INSERT INTO indexer_state (network, key, value, updated_at)
             VALUES ($1, $2, $3, NOW())
             ON CONFLICT (network, key) DO UPDATE SET value = $3, updated_at = NOW()"
        )
        .bind(&self.network)
        .bind(CURSOR_KEY)
        .bind(height.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
