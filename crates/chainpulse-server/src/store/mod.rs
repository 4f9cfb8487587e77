//! Normalized storage for one network.
//!
//! Writes are conflict-safe upserts keyed by block number and transaction
//! hash, so replaying a height is always a no-op.

mod memory;
mod postgres;

use async_trait::async_trait;
use chainpulse_common::{AccountActivity, Block, PulseError, TimeBucketStat, Transaction};
use serde::Serialize;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Block and transaction totals over a timestamp window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpanSummary {
    pub block_count: i64,
    pub transaction_count: i64,
    pub first_timestamp: Option<i64>,
    pub last_timestamp: Option<i64>,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap liveness check.
    async fn ping(&self) -> Result<(), PulseError>;

    /// Insert a block row. Returns `false` when the height was already stored.
    async fn insert_block(&self, block: &Block) -> Result<bool, PulseError>;

    /// Insert a transaction row and, only if the hash was new, fold its
    /// activity deltas in the same unit of work. Returns whether the row was new.
    async fn ingest_transaction(&self, tx: &Transaction) -> Result<bool, PulseError>;

    async fn get_block(&self, number: i64) -> Result<Option<Block>, PulseError>;

    /// Stored blocks in `[start, start + count)`, ascending. Gaps are omitted.
    async fn get_blocks(&self, start: i64, count: i64) -> Result<Vec<Block>, PulseError>;

    async fn get_transaction(&self, hash: &str) -> Result<Option<Transaction>, PulseError>;

    async fn get_account_activity(&self, address: &str) -> Result<Option<AccountActivity>, PulseError>;

    /// Newest-first transactions sent or received by `address`.
    async fn get_account_transactions(&self, address: &str, limit: i64) -> Result<Vec<Transaction>, PulseError>;

    async fn span_summary(&self, since: i64, until: i64) -> Result<SpanSummary, PulseError>;

    /// Precomputed series over `[since, until]` in `bucket_seconds` buckets, oldest first.
    async fn rollup(&self, since: i64, until: i64, bucket_seconds: i64) -> Result<Vec<TimeBucketStat>, PulseError>;

    /// Last fully ingested height.
    async fn get_cursor(&self) -> Result<Option<u64>, PulseError>;

    async fn set_cursor(&self, height: u64) -> Result<(), PulseError>;
}
