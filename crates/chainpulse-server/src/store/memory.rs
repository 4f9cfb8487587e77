use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chainpulse_common::{AccountActivity, Block, PulseError, TimeBucketStat, Transaction};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::{SpanSummary, Store};
use crate::activity;

#[derive(Default)]
struct Tables {
    blocks: BTreeMap<i64, Block>,
    transactions: HashMap<String, Transaction>,
    activity: HashMap<String, AccountActivity>,
    cursor: Option<u64>,
}

/// In-process store. Every transaction ingest runs under one lock, which
/// gives the same insert-then-merge atomicity the Postgres store gets from
/// a database transaction.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), PulseError> {
        Ok(())
    }

    async fn insert_block(&self, block: &Block) -> Result<bool, PulseError> {
        let mut tables = self.tables.lock();
        if tables.blocks.contains_key(&block.number) {
            return Ok(false);
        }
        tables.blocks.insert(block.number, block.clone());
        Ok(true)
    }

    async fn ingest_transaction(&self, tx: &Transaction) -> Result<bool, PulseError> {
        let mut tables = self.tables.lock();
        if tables.transactions.contains_key(&tx.hash) {
            return Ok(false);
        }
        tables.transactions.insert(tx.hash.clone(), tx.clone());

        for delta in activity::deltas_for(tx) {
            let existing = tables.activity.remove(&delta.address);
            let merged = activity::merge(existing, &delta);
            tables.activity.insert(delta.address, merged);
        }
        Ok(true)
    }

    async fn get_block(&self, number: i64) -> Result<Option<Block>, PulseError> {
        Ok(self.tables.lock().blocks.get(&number).cloned())
    }

    async fn get_blocks(&self, start: i64, count: i64) -> Result<Vec<Block>, PulseError> {
        if count <= 0 {
            return Ok(Vec::new());
        }
        let tables = self.tables.lock();
        Ok(tables
            .blocks
            .range(start..start.saturating_add(count))
            .map(|(_, block)| block.clone())
            .collect())
    }

    async fn get_transaction(&self, hash: &str) -> Result<Option<Transaction>, PulseError> {
        Ok(self.tables.lock().transactions.get(hash).cloned())
    }

    async fn get_account_activity(&self, address: &str) -> Result<Option<AccountActivity>, PulseError> {
        Ok(self.tables.lock().activity.get(address).cloned())
    }

    async fn get_account_transactions(&self, address: &str, limit: i64) -> Result<Vec<Transaction>, PulseError> {
        let tables = self.tables.lock();
        let mut matches: Vec<Transaction> = tables
            .transactions
            .values()
            .filter(|tx| tx.from_address == address || tx.to_address.as_deref() == Some(address))
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            (b.block_number, b.transaction_index).cmp(&(a.block_number, a.transaction_index))
        });
        matches.truncate(limit.max(0) as usize);
        Ok(matches)
    }

    async fn span_summary(&self, since: i64, until: i64) -> Result<SpanSummary, PulseError> {
        let tables = self.tables.lock();
        let mut summary = SpanSummary::default();
        for block in tables
            .blocks
            .values()
            .filter(|b| b.timestamp >= since && b.timestamp <= until)
        {
            summary.block_count += 1;
            summary.transaction_count += block.transaction_count as i64;
            summary.first_timestamp = Some(summary.first_timestamp.map_or(block.timestamp, |t| t.min(block.timestamp)));
            summary.last_timestamp = Some(summary.last_timestamp.map_or(block.timestamp, |t| t.max(block.timestamp)));
        }
        Ok(summary)
    }

    async fn rollup(&self, since: i64, until: i64, bucket_seconds: i64) -> Result<Vec<TimeBucketStat>, PulseError> {
        if bucket_seconds <= 0 {
            return Err(PulseError::InvalidInput("bucket size must be positive".to_string()));
        }
        let bucket_of = |ts: i64| ts.div_euclid(bucket_seconds) * bucket_seconds;
        let tables = self.tables.lock();
        let mut buckets: BTreeMap<i64, TimeBucketStat> = BTreeMap::new();

        for block in tables
            .blocks
            .values()
            .filter(|b| b.timestamp >= since && b.timestamp <= until)
        {
            let start = bucket_of(block.timestamp);
            let entry = buckets.entry(start).or_insert_with(|| empty_bucket(start));
            entry.block_count += 1;
            entry.transaction_count += block.transaction_count as i64;
            entry.gas_used_total += block.gas_used;
        }

        for tx in tables
            .transactions
            .values()
            .filter(|t| t.timestamp >= since && t.timestamp <= until)
        {
            if let Some(entry) = buckets.get_mut(&bucket_of(tx.timestamp)) {
                entry.value_total += &tx.value;
            }
        }

        Ok(buckets.into_values().collect())
    }

    async fn get_cursor(&self) -> Result<Option<u64>, PulseError> {
        Ok(self.tables.lock().cursor)
    }

    async fn set_cursor(&self, height: u64) -> Result<(), PulseError> {
        self.tables.lock().cursor = Some(height);
        Ok(())
    }
}

fn empty_bucket(bucket_start: i64) -> TimeBucketStat {
    TimeBucketStat {
        bucket_start,
        transaction_count: 0,
        block_count: 0,
        gas_used_total: 0,
        value_total: BigDecimal::from(0),
    }
}
