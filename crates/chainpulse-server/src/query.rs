//! The read interface served to consumers.
//!
//! Each network gets one [`QueryService`]. It answers from the store when the
//! store is reachable and has data, from the cache when a copy is fresh, and
//! from the chain otherwise. Answers built from a scan say so.

use alloy::primitives::{Address, B256};
use bigdecimal::BigDecimal;
use chainpulse_common::{AccountActivity, Block, DataSource, PulseError, Receipt, Transaction};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::analytics::{
    AnalyticsBackend, AnalyticsRange, AnalyticsReport, IndexedAnalytics, ScanAnalytics, Window, DEFAULT_TARGET_POINTS,
};
use crate::cache::{CacheBackend, CacheKey, ReadThroughCache, TtlPolicy};
use crate::indexer::normalize;
use crate::rpc::{BlockId, ChainError, ChainRpc};
use crate::scanner::{ScanLimits, Scanner};
use crate::store::Store;

pub const MAX_BLOCKS_PER_PAGE: u64 = 100;
pub const MAX_ACCOUNT_TRANSACTIONS: usize = 100;
const GAP_FETCH_CONCURRENCY: usize = 10;

/// Result of a lookup by id.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    Unavailable(String),
    /// The node answered with something we cannot normalize.
    Malformed(String),
}

impl<T> Lookup<T> {
    /// `what` names the entity in the not-found error.
    pub fn into_result(self, what: impl Into<String>) -> Result<T, PulseError> {
        match self {
            Lookup::Found(value) => Ok(value),
            Lookup::NotFound => Err(PulseError::NotFound(what.into())),
            Lookup::Unavailable(reason) => Err(PulseError::Unavailable(reason)),
            Lookup::Malformed(reason) => Err(PulseError::Malformed(reason)),
        }
    }

    fn from_chain_error(err: ChainError) -> Self {
        match err {
            ChainError::NotFound(_) => Lookup::NotFound,
            ChainError::Malformed(reason) => Lookup::Malformed(reason),
            other => Lookup::Unavailable(other.to_string()),
        }
    }
}

/// A block header, with bodies when asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDetails {
    #[serde(flatten)]
    pub block: Block,
    pub transaction_hashes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transactions: Option<Vec<Transaction>>,
}

impl BlockDetails {
    fn header(block: Block) -> Self {
        Self {
            block,
            transaction_hashes: Vec::new(),
            transactions: None,
        }
    }

    fn without_bodies(mut self) -> Self {
        self.transactions = None;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountOverview {
    pub address: String,
    pub balance: BigDecimal,
    pub nonce: u64,
    pub is_contract: bool,
    /// `None` when the address was never indexed or the index is down
    pub activity: Option<AccountActivity>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountTransactions {
    pub source: DataSource,
    pub partial: bool,
    pub transactions: Vec<Transaction>,
}

/// Remembers whether the store answered a ping, for `ttl`.
pub struct IndexProbe {
    store: Arc<dyn Store>,
    ttl: Duration,
    last: Mutex<Option<(bool, Instant)>>,
}

impl IndexProbe {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            last: Mutex::new(None),
        }
    }

    pub async fn available(&self) -> bool {
        let cached = *self.last.lock();
        if let Some((available, checked_at)) = cached {
            if checked_at.elapsed() < self.ttl {
                return available;
            }
        }

        let available = match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Index unavailable, falling back to chain: {}", e);
                false
            }
        };
        *self.last.lock() = Some((available, Instant::now()));
        available
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    pub ttl: TtlPolicy,
    pub index_probe_ttl: Duration,
    pub scan: ScanLimits,
    pub analytics_max_blocks: u64,
    pub analytics_target_points: u64,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            ttl: TtlPolicy::default(),
            index_probe_ttl: Duration::from_secs(10),
            scan: ScanLimits::default(),
            analytics_max_blocks: 500,
            analytics_target_points: DEFAULT_TARGET_POINTS,
        }
    }
}

pub struct QueryService {
    network: String,
    chain: Arc<dyn ChainRpc>,
    store: Arc<dyn Store>,
    cache: ReadThroughCache,
    probe: IndexProbe,
    scanner: Scanner,
    indexed_analytics: IndexedAnalytics,
    scan_analytics: ScanAnalytics,
}

impl QueryService {
    pub fn new(
        network: impl Into<String>,
        chain: Arc<dyn ChainRpc>,
        store: Arc<dyn Store>,
        cache: Arc<dyn CacheBackend>,
        options: QueryOptions,
    ) -> Self {
        let network = network.into();
        let scanner = Scanner::new(network.clone(), chain.clone(), options.scan);
        Self {
            cache: ReadThroughCache::new(cache, options.ttl),
            probe: IndexProbe::new(store.clone(), options.index_probe_ttl),
            indexed_analytics: IndexedAnalytics::new(store.clone(), options.analytics_target_points),
            scan_analytics: ScanAnalytics::new(
                scanner.clone(),
                options.analytics_max_blocks,
                options.analytics_target_points,
            ),
            scanner,
            network,
            chain,
            store,
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    pub async fn get_latest_block_number(&self) -> Result<u64, PulseError> {
        Ok(self.chain.latest_block_number().await?)
    }

    /// Head used to pick a TTL. Unknown when the chain does not answer.
    async fn latest_for_ttl(&self) -> Option<u64> {
        self.chain.latest_block_number().await.ok()
    }

    pub async fn get_block(&self, id: BlockId, include_txs: bool) -> Lookup<BlockDetails> {
        let key = CacheKey::new("block", &self.network, id.to_string());
        if let Some(details) = self.cache.get::<BlockDetails>(&key).await {
            return Lookup::Found(if include_txs { details } else { details.without_bodies() });
        }

        let details = match self.fetch_block(id).await {
            Ok(details) => details,
            Err(e) => return Lookup::from_chain_error(e),
        };

        let ttl = self
            .cache
            .policy()
            .ttl_for(details.block.number as u64, self.latest_for_ttl().await);
        self.cache.put(&key, &details, ttl).await;

        Lookup::Found(if include_txs { details } else { details.without_bodies() })
    }

    async fn fetch_block(&self, id: BlockId) -> Result<BlockDetails, ChainError> {
        let raw = self.chain.get_block(id, true).await?;
        let block = normalize::block(&raw).map_err(|e| ChainError::Malformed(e.to_string()))?;

        let mut transaction_hashes = Vec::with_capacity(raw.transactions.len());
        let mut transactions = Vec::with_capacity(raw.transactions.len());
        for entry in &raw.transactions {
            match entry {
                serde_json::Value::String(hash) => transaction_hashes.push(hash.to_lowercase()),
                _ => match normalize::transaction_entry(entry, &block) {
                    Ok(Some(tx)) => {
                        transaction_hashes.push(tx.hash.clone());
                        transactions.push(tx);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(network = %self.network, "Block {}: {}", block.number, e);
                    }
                },
            }
        }

        Ok(BlockDetails {
            block,
            transaction_hashes,
            transactions: Some(transactions),
        })
    }

    /// Headers for `[start, start + count)`, ascending. At most 100; heights
    /// the chain does not have are left out.
    pub async fn get_blocks(&self, start: u64, count: u64) -> Result<Vec<BlockDetails>, PulseError> {
        let count = count.min(MAX_BLOCKS_PER_PAGE);
        if count == 0 {
            return Ok(Vec::new());
        }
        let end = start.saturating_add(count);

        let mut found: BTreeMap<u64, BlockDetails> = BTreeMap::new();
        if self.probe.available().await {
            match self.store.get_blocks(start as i64, count as i64).await {
                Ok(rows) => {
                    for row in rows {
                        found.insert(row.number as u64, BlockDetails::header(row));
                    }
                }
                Err(e) => tracing::warn!(network = %self.network, "Store read failed, using chain: {}", e),
            }
        }

        let gaps: Vec<u64> = (start..end).filter(|n| !found.contains_key(n)).collect();
        let fetched: Vec<(u64, Lookup<BlockDetails>)> = stream::iter(gaps)
            .map(|n| async move { (n, self.get_block(BlockId::Number(n), false).await) })
            .buffered(GAP_FETCH_CONCURRENCY)
            .collect()
            .await;

        for (n, lookup) in fetched {
            match lookup {
                Lookup::Found(details) => {
                    found.insert(n, details);
                }
                Lookup::NotFound => {}
                Lookup::Unavailable(reason) => return Err(PulseError::Unavailable(reason)),
                Lookup::Malformed(reason) => return Err(PulseError::Malformed(reason)),
            }
        }

        Ok(found.into_values().collect())
    }

    pub async fn get_transaction(&self, hash: B256) -> Lookup<Transaction> {
        let hash_str = format!("{:?}", hash);

        if self.probe.available().await {
            match self.store.get_transaction(&hash_str).await {
                Ok(Some(tx)) => return Lookup::Found(tx),
                Ok(None) => {}
                Err(e) => tracing::warn!(network = %self.network, "Store read failed, using chain: {}", e),
            }
        }

        let key = CacheKey::new("transaction", &self.network, hash_str);
        if let Some(tx) = self.cache.get::<Transaction>(&key).await {
            return Lookup::Found(tx);
        }

        let raw = match self.chain.get_transaction(hash).await {
            Ok(raw) => raw,
            Err(e) => return Lookup::from_chain_error(e),
        };
        // Pending transactions have no block yet and are reported as absent.
        let (Some(block_number), Some(block_hash)) = (raw.block_number, raw.block_hash) else {
            return Lookup::NotFound;
        };

        let timestamp = match self.block_timestamp(block_number).await {
            Ok(ts) => ts,
            Err(e) => return Lookup::from_chain_error(e),
        };

        let tx = match normalize::transaction(&raw, block_number as i64, &format!("{:?}", block_hash), timestamp) {
            Ok(tx) => tx,
            Err(e) => return Lookup::Malformed(e.to_string()),
        };

        let ttl = self.cache.policy().ttl_for(block_number, self.latest_for_ttl().await);
        self.cache.put(&key, &tx, ttl).await;
        Lookup::Found(tx)
    }

    async fn block_timestamp(&self, number: u64) -> Result<i64, ChainError> {
        if self.probe.available().await {
            if let Ok(Some(block)) = self.store.get_block(number as i64).await {
                return Ok(block.timestamp);
            }
        }
        let raw = self.chain.get_block(BlockId::Number(number), false).await?;
        i64::try_from(raw.timestamp).map_err(|_| ChainError::Malformed(format!("timestamp {}", raw.timestamp)))
    }

    pub async fn get_transaction_receipt(&self, hash: B256) -> Lookup<Receipt> {
        let key = CacheKey::new("receipt", &self.network, format!("{:?}", hash));
        if let Some(receipt) = self.cache.get::<Receipt>(&key).await {
            return Lookup::Found(receipt);
        }

        let receipt = match self.chain.get_transaction_receipt(hash).await {
            Ok(raw) => match normalize::receipt(&raw) {
                Ok(receipt) => receipt,
                Err(e) => return Lookup::Malformed(e.to_string()),
            },
            Err(e) => return Lookup::from_chain_error(e),
        };

        let ttl = self
            .cache
            .policy()
            .ttl_for(receipt.block_number as u64, self.latest_for_ttl().await);
        self.cache.put(&key, &receipt, ttl).await;
        Lookup::Found(receipt)
    }

    pub async fn get_account_activity(&self, address: Address) -> Lookup<AccountActivity> {
        if !self.probe.available().await {
            return Lookup::Unavailable("index unavailable".to_string());
        }
        match self.store.get_account_activity(&format!("{:?}", address)).await {
            Ok(Some(activity)) => Lookup::Found(activity),
            Ok(None) => Lookup::NotFound,
            Err(e) => Lookup::Unavailable(e.to_string()),
        }
    }

    pub async fn get_account_overview(&self, address: Address) -> Result<AccountOverview, PulseError> {
        let (balance, nonce, code) = tokio::try_join!(
            self.chain.get_balance(address),
            self.chain.get_transaction_count(address),
            self.chain.get_code(address),
        )?;

        let activity = match self.get_account_activity(address).await {
            Lookup::Found(activity) => Some(activity),
            Lookup::NotFound | Lookup::Unavailable(_) | Lookup::Malformed(_) => None,
        };

        Ok(AccountOverview {
            address: format!("{:?}", address),
            balance: normalize::decimal(balance)?,
            nonce,
            is_contract: !code.is_empty(),
            activity,
        })
    }

    /// Newest-first transactions for `address`, from the index when it has
    /// any, else from a bounded scan of recent blocks.
    pub async fn get_account_transactions(
        &self,
        address: Address,
        limit: usize,
    ) -> Result<AccountTransactions, PulseError> {
        let limit = limit.clamp(1, MAX_ACCOUNT_TRANSACTIONS);

        if self.probe.available().await {
            match self
                .store
                .get_account_transactions(&format!("{:?}", address), limit as i64)
                .await
            {
                Ok(transactions) if !transactions.is_empty() => {
                    return Ok(AccountTransactions {
                        source: DataSource::Indexed,
                        partial: false,
                        transactions,
                    });
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(network = %self.network, "Store read failed, scanning: {}", e),
            }
        }

        let mut report = self.scanner.scan_account(address).await?;
        report.transactions.truncate(limit);
        Ok(AccountTransactions {
            source: DataSource::Scan,
            partial: report.partial,
            transactions: report.transactions,
        })
    }

    /// Analytics for the window ending now, cached for the short TTL.
    pub async fn get_analytics(&self, range: AnalyticsRange) -> Result<AnalyticsReport, PulseError> {
        let key = CacheKey::new("analytics", &self.network, range.as_str());
        if let Some(report) = self.cache.get::<AnalyticsReport>(&key).await {
            return Ok(report);
        }

        let report = self.analytics_for(Window::ending_at(range, Utc::now().timestamp())).await?;
        self.cache.put(&key, &report, self.cache.policy().short_ttl).await;
        Ok(report)
    }

    /// Uncached analytics over an explicit window.
    ///
    /// The index answers only when it reaches back to the window start.
    /// Otherwise the chain is scanned, and a partial indexed report is kept
    /// for when that scan cannot run.
    pub async fn analytics_for(&self, window: Window) -> Result<AnalyticsReport, PulseError> {
        let mut indexed_partial = None;
        if self.probe.available().await {
            match self.indexed_analytics.report(window).await {
                Ok(report) if report.stats.block_count > 0 && !report.partial => return Ok(report),
                Ok(report) if report.stats.block_count > 0 => {
                    tracing::debug!(network = %self.network, "Index does not cover {} window, scanning", window.range);
                    indexed_partial = Some(report);
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(network = %self.network, "Indexed analytics failed, scanning: {}", e),
            }
        }

        match (self.scan_analytics.report(window).await, indexed_partial) {
            (Ok(report), _) => Ok(report),
            (Err(e), Some(report)) => {
                tracing::warn!(network = %self.network, "Analytics scan failed, serving partial index: {}", e);
                Ok(report)
            }
            (Err(e), None) => Err(e),
        }
    }
}

/// Query services by network name.
#[derive(Clone, Default)]
pub struct QueryRegistry {
    services: HashMap<String, Arc<QueryService>>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service: QueryService) {
        self.services.insert(service.network().to_string(), Arc::new(service));
    }

    pub fn get(&self, network: &str) -> Result<Arc<QueryService>, PulseError> {
        self.services
            .get(network)
            .cloned()
            .ok_or_else(|| PulseError::NotFound(format!("network {}", network)))
    }

    pub fn networks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }
}
