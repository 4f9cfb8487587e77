//! Bounded raw-RPC scans used when the index cannot answer.
//!
//! Blocks are walked newest first in fixed-size batches. Each batch is
//! fetched concurrently but consumed in height order, and batches are
//! spaced out by a delay so a scan never floods the node.

use alloy::primitives::Address;
use chainpulse_common::Transaction;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use crate::indexer::normalize;
use crate::rpc::{BlockId, ChainError, ChainRpc, RpcBlock};

#[derive(Debug, Clone, Copy)]
pub struct ScanLimits {
    pub batch_size: usize,
    pub max_blocks: u64,
    pub max_results: usize,
    pub batch_delay: Duration,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            batch_size: 20,
            max_blocks: 1000,
            max_results: 25,
            batch_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub blocks_scanned: u64,
    /// Heights that could not be fetched; included in `blocks_scanned`.
    pub failed_blocks: u64,
    pub batches: u64,
    pub reached_genesis: bool,
    pub stopped: bool,
}

impl WalkStats {
    /// Nothing was seen: every height visited failed to fetch.
    pub fn all_failed(&self) -> bool {
        self.blocks_scanned > 0 && self.failed_blocks == self.blocks_scanned
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub transactions: Vec<Transaction>,
    pub blocks_scanned: u64,
    pub failed_blocks: u64,
    pub batches: u64,
    /// Always set: a scan only ever sees a recent window.
    pub partial: bool,
}

#[derive(Clone)]
pub struct Scanner {
    network: String,
    chain: Arc<dyn ChainRpc>,
    limits: ScanLimits,
}

impl Scanner {
    pub fn new(network: impl Into<String>, chain: Arc<dyn ChainRpc>, limits: ScanLimits) -> Self {
        Self {
            network: network.into(),
            chain,
            limits,
        }
    }

    pub fn chain(&self) -> &Arc<dyn ChainRpc> {
        &self.chain
    }

    /// Visit up to `max_blocks` blocks from `head` downwards until `visit` breaks.
    ///
    /// Blocks that fail to fetch are logged, counted in `failed_blocks` and
    /// skipped; they still count towards the block budget.
    pub async fn walk<F>(&self, head: u64, max_blocks: u64, mut visit: F) -> WalkStats
    where
        F: FnMut(&RpcBlock) -> ControlFlow<()>,
    {
        let batch_size = self.limits.batch_size.max(1) as u64;
        let mut stats = WalkStats::default();
        let mut next = Some(head);

        while let Some(top) = next {
            let remaining = max_blocks.saturating_sub(stats.blocks_scanned);
            if remaining == 0 {
                break;
            }
            let count = batch_size.min(remaining).min(top + 1);

            if stats.batches > 0 && !self.limits.batch_delay.is_zero() {
                tokio::time::sleep(self.limits.batch_delay).await;
            }
            stats.batches += 1;
            metrics::counter!("chainpulse_scanner_batches_total", "network" => self.network.clone()).increment(1);

            let chain = &self.chain;
            let mut fetched = stream::iter((0..count).map(|i| top - i))
                .map(|height| async move { (height, chain.get_block(BlockId::Number(height), true).await) })
                .buffered(count as usize);

            while let Some((height, result)) = fetched.next().await {
                stats.blocks_scanned += 1;
                match result {
                    Ok(block) => {
                        if visit(&block).is_break() {
                            stats.stopped = true;
                            break;
                        }
                    }
                    Err(e) => {
                        stats.failed_blocks += 1;
                        tracing::warn!(network = %self.network, "Scan skipped block {}: {}", height, e);
                    }
                }
            }
            if stats.stopped {
                break;
            }

            next = top.checked_sub(count);
            if next.is_none() {
                stats.reached_genesis = true;
            }
        }

        stats
    }

    /// Recent transactions sent or received by `address`, newest first.
    ///
    /// Fails with a transport error when no block in the walk could be fetched.
    pub async fn scan_account(&self, address: Address) -> Result<ScanReport, ChainError> {
        let head = self.chain.latest_block_number().await?;
        let wanted = format!("{:?}", address);
        let max_results = self.limits.max_results;
        let mut transactions = Vec::new();

        let stats = self
            .walk(head, self.limits.max_blocks, |raw| {
                let block = match normalize::block(raw) {
                    Ok(block) => block,
                    Err(e) => {
                        tracing::warn!(network = %self.network, "Scan skipped block {}: {}", raw.number, e);
                        return ControlFlow::Continue(());
                    }
                };
                for entry in &raw.transactions {
                    let Ok(Some(tx)) = normalize::transaction_entry(entry, &block) else {
                        continue;
                    };
                    let sent = tx.from_address.eq_ignore_ascii_case(&wanted);
                    let received = tx
                        .to_address
                        .as_deref()
                        .is_some_and(|to| to.eq_ignore_ascii_case(&wanted));
                    if sent || received {
                        transactions.push(tx);
                        if transactions.len() >= max_results {
                            return ControlFlow::Break(());
                        }
                    }
                }
                ControlFlow::Continue(())
            })
            .await;

        if stats.all_failed() {
            metrics::counter!("chainpulse_scanner_failures_total", "network" => self.network.clone()).increment(1);
            return Err(ChainError::Transport(format!(
                "scan for {} could not fetch any of {} blocks",
                wanted, stats.blocks_scanned
            )));
        }

        tracing::debug!(
            network = %self.network,
            "Scanned {} blocks ({} failed) in {} batches for {}: {} matches",
            stats.blocks_scanned,
            stats.failed_blocks,
            stats.batches,
            wanted,
            transactions.len()
        );

        Ok(ScanReport {
            transactions,
            blocks_scanned: stats.blocks_scanned,
            failed_blocks: stats.failed_blocks,
            batches: stats.batches,
            partial: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{addr, hash_of, transfer, FakeChain};

    fn limits(batch_size: usize, max_blocks: u64, max_results: usize) -> ScanLimits {
        ScanLimits {
            batch_size,
            max_blocks,
            max_results,
            batch_delay: Duration::ZERO,
        }
    }

    fn chain_with(blocks: u64, tx_every: u64) -> Arc<FakeChain> {
        let chain = Arc::new(FakeChain::new());
        for n in 0..blocks {
            let txs = if n % tx_every == 0 {
                vec![transfer(hash_of(n + 1), addr(0x0a), Some(addr(0x0b)))]
            } else {
                vec![]
            };
            chain.push_block(n, 1_000 + n, txs);
        }
        chain
    }

    #[tokio::test]
    async fn test_block_budget_bounds_batches() {
        let chain = chain_with(5_000, 1_000_000);
        let scanner = Scanner::new("testnet", chain.clone(), limits(20, 1_000, 25));

        let report = scanner.scan_account(addr(0x0a)).await.unwrap();
        assert!(report.transactions.is_empty());
        assert_eq!(report.blocks_scanned, 1_000);
        assert_eq!(report.batches, 50);
        assert!(report.partial);
        assert_eq!(chain.calls("eth_getBlock"), 1_000);
    }

    #[tokio::test]
    async fn test_result_ceiling_drops_rest_of_batch() {
        let chain = chain_with(500, 1);
        let scanner = Scanner::new("testnet", chain, limits(20, 1_000, 25));

        let report = scanner.scan_account(addr(0x0b)).await.unwrap();
        assert_eq!(report.transactions.len(), 25);
        assert_eq!(report.batches, 2);
        assert_eq!(report.blocks_scanned, 25);
        // Newest first
        assert_eq!(report.transactions[0].block_number, 499);
        assert_eq!(report.transactions[24].block_number, 475);
    }

    #[tokio::test]
    async fn test_stops_at_genesis() {
        let chain = chain_with(30, 10);
        let scanner = Scanner::new("testnet", chain, limits(20, 1_000, 25));

        let report = scanner.scan_account(addr(0x0a)).await.unwrap();
        assert_eq!(report.blocks_scanned, 30);
        assert_eq!(report.batches, 2);
        let heights: Vec<i64> = report.transactions.iter().map(|t| t.block_number).collect();
        assert_eq!(heights, vec![20, 10, 0]);
    }

    #[tokio::test]
    async fn test_match_ignores_case_and_failed_blocks_are_skipped() {
        let chain = chain_with(10, 1);
        chain.fail_block(9, ChainError::Transport("reset".into()));
        let scanner = Scanner::new("testnet", chain, limits(4, 100, 100));

        let report = scanner.scan_account(addr(0x0a)).await.unwrap();
        assert_eq!(report.blocks_scanned, 10);
        assert_eq!(report.failed_blocks, 1);
        assert_eq!(report.transactions.len(), 9);
    }

    #[tokio::test]
    async fn test_scan_with_every_fetch_failing_is_an_error() {
        let chain = chain_with(20, 1);
        for height in 0..20 {
            chain.fail_block(
                height,
                ChainError::RetryExhausted {
                    attempts: 3,
                    last_error: "connection refused".into(),
                },
            );
        }
        let scanner = Scanner::new("testnet", chain, limits(20, 100, 25));

        let err = scanner.scan_account(addr(0x0a)).await.unwrap_err();
        assert!(matches!(err, ChainError::Transport(_)), "unexpected error: {err}");

        // The queued failures are spent; the next scan sees the blocks again.
        let report = scanner.scan_account(addr(0x0a)).await.unwrap();
        assert_eq!(report.failed_blocks, 0);
        assert_eq!(report.transactions.len(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_are_spaced_by_delay() {
        let chain = chain_with(60, 1_000_000);
        let scanner = Scanner::new(
            "testnet",
            chain,
            ScanLimits {
                batch_delay: Duration::from_millis(100),
                ..limits(20, 60, 25)
            },
        );

        let started = tokio::time::Instant::now();
        let stats = scanner.walk(59, 60, |_| ControlFlow::Continue(())).await;
        assert_eq!(stats.batches, 3);
        assert!(stats.reached_genesis);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(300));
    }
}
