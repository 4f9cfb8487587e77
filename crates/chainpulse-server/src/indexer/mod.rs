//! Block ingestion: one height at a time, strictly in order.

pub mod normalize;

use chainpulse_common::{PulseError, Transaction};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::IngestConfig;
use crate::rpc::{BlockId, ChainError, ChainRpc};
use crate::store::Store;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("malformed block: {0}")]
    Malformed(String),

    #[error(transparent)]
    Store(#[from] PulseError),

    #[error("backfill stopped at block {height} after {attempts} attempts, resume with --from {height}: {reason}")]
    BackfillStopped {
        height: u64,
        attempts: u32,
        reason: String,
        completed: BackfillReport,
    },
}

/// Attempts per height before a backfill gives up.
pub const BACKFILL_ATTEMPTS: u32 = 5;

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Ingested { height: u64, new_transactions: usize, head: u64 },
    CaughtUp { head: u64 },
    NotYetAvailable { height: u64 },
    Failed { height: u64, reason: String },
    SkippedMalformed { height: u64, reason: String },
}

impl TickOutcome {
    /// How long to wait before the next tick.
    pub fn next_delay(&self, poll_interval: Duration) -> Duration {
        match self {
            TickOutcome::Ingested { height, head, .. } if height < head => Duration::ZERO,
            TickOutcome::SkippedMalformed { .. } => Duration::ZERO,
            _ => poll_interval,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BlockStats {
    pub new_block: bool,
    pub new_transactions: usize,
    pub skipped_transactions: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackfillReport {
    pub blocks: u64,
    pub new_transactions: usize,
    pub skipped_blocks: u64,
}

pub struct Ingestor {
    network: String,
    chain: Arc<dyn ChainRpc>,
    store: Arc<dyn Store>,
    config: IngestConfig,
    next_height: u64,
}

impl Ingestor {
    /// Resume after the persisted cursor, else from `start_block`, else from the chain head.
    pub async fn start(
        network: impl Into<String>,
        chain: Arc<dyn ChainRpc>,
        store: Arc<dyn Store>,
        config: IngestConfig,
        start_block: Option<u64>,
    ) -> Result<Self, IngestError> {
        let network = network.into();
        let next_height = match store.get_cursor().await? {
            Some(cursor) => cursor + 1,
            None => match start_block {
                Some(start) => start,
                None => chain.latest_block_number().await?,
            },
        };
        tracing::info!(network = %network, "Starting ingestion at block {}", next_height);

        Ok(Self {
            network,
            chain,
            store,
            config,
            next_height,
        })
    }

    pub fn next_height(&self) -> u64 {
        self.next_height
    }

    /// Tail the chain forever.
    pub async fn run(mut self) {
        loop {
            let outcome = self.tick().await;
            let delay = outcome.next_delay(self.config.poll_interval);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Attempt the next height once. The cursor only moves on success or on a malformed header.
    pub async fn tick(&mut self) -> TickOutcome {
        let height = self.next_height;
        let outcome = match tokio::time::timeout(self.config.tick_timeout, self.try_tick(height)).await {
            Ok(outcome) => outcome,
            Err(_) => TickOutcome::Failed {
                height,
                reason: format!("tick timed out after {:?}", self.config.tick_timeout),
            },
        };

        match &outcome {
            TickOutcome::Ingested { height, new_transactions, head } => {
                tracing::debug!(
                    network = %self.network,
                    "Ingested block {} ({} new transactions, head {})",
                    height,
                    new_transactions,
                    head
                );
                metrics::gauge!("chainpulse_ingest_height", "network" => self.network.clone()).set(*height as f64);
                self.next_height = height + 1;
            }
            TickOutcome::SkippedMalformed { height, reason } => {
                tracing::error!(network = %self.network, "Skipping block {}: {}", height, reason);
                self.next_height = height + 1;
            }
            TickOutcome::Failed { height, reason } => {
                tracing::warn!(network = %self.network, "Block {} failed, retrying next tick: {}", height, reason);
                metrics::counter!("chainpulse_ingest_failures_total", "network" => self.network.clone()).increment(1);
            }
            TickOutcome::NotYetAvailable { height } => {
                tracing::debug!(network = %self.network, "Block {} not available yet", height);
            }
            TickOutcome::CaughtUp { .. } => {}
        }

        outcome
    }

    async fn try_tick(&self, height: u64) -> TickOutcome {
        let head = match self.chain.latest_block_number().await {
            Ok(head) => head,
            Err(e) => {
                return TickOutcome::Failed {
                    height,
                    reason: e.to_string(),
                }
            }
        };
        if height > head {
            return TickOutcome::CaughtUp { head };
        }

        match self.ingest_height(height).await {
            Ok(stats) => TickOutcome::Ingested {
                height,
                new_transactions: stats.new_transactions,
                head,
            },
            Err(IngestError::Chain(e)) if e.is_not_found() => TickOutcome::NotYetAvailable { height },
            Err(IngestError::Chain(ChainError::Malformed(reason))) | Err(IngestError::Malformed(reason)) => {
                // Move past the bad height so one record cannot stall the loop.
                match self.store.set_cursor(height).await {
                    Ok(()) => TickOutcome::SkippedMalformed { height, reason },
                    Err(e) => TickOutcome::Failed {
                        height,
                        reason: e.to_string(),
                    },
                }
            }
            Err(e) => TickOutcome::Failed {
                height,
                reason: e.to_string(),
            },
        }
    }

    /// Ingest `height` and persist it as the cursor.
    pub async fn ingest_height(&self, height: u64) -> Result<BlockStats, IngestError> {
        let stats = self.ingest_block(height).await?;
        self.store.set_cursor(height).await?;
        Ok(stats)
    }

    /// Ingest every height in `[from, to]` without touching the live cursor.
    ///
    /// A height that fails is retried after the poll interval, up to
    /// [`BACKFILL_ATTEMPTS`] times. Malformed blocks are skipped.
    pub async fn backfill(&self, from: u64, to: u64) -> Result<BackfillReport, IngestError> {
        let mut report = BackfillReport::default();
        for height in from..=to {
            let mut attempt = 1;
            loop {
                match self.ingest_block(height).await {
                    Ok(stats) => {
                        report.blocks += 1;
                        report.new_transactions += stats.new_transactions;
                        break;
                    }
                    Err(IngestError::Malformed(reason)) | Err(IngestError::Chain(ChainError::Malformed(reason))) => {
                        tracing::error!(network = %self.network, "Skipping block {}: {}", height, reason);
                        report.skipped_blocks += 1;
                        break;
                    }
                    Err(e) if attempt < BACKFILL_ATTEMPTS => {
                        tracing::warn!(
                            network = %self.network,
                            "Backfill block {} failed (attempt {}/{}): {}",
                            height,
                            attempt,
                            BACKFILL_ATTEMPTS,
                            e
                        );
                        metrics::counter!("chainpulse_ingest_failures_total", "network" => self.network.clone())
                            .increment(1);
                        attempt += 1;
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                    Err(e) => {
                        return Err(IngestError::BackfillStopped {
                            height,
                            attempts: attempt,
                            reason: e.to_string(),
                            completed: report,
                        })
                    }
                }
            }
            if (height - from + 1) % 1000 == 0 {
                tracing::info!(network = %self.network, "Backfill at block {} of {}", height, to);
            }
        }
        Ok(report)
    }

    async fn ingest_block(&self, height: u64) -> Result<BlockStats, IngestError> {
        let raw = self.chain.get_block(BlockId::Number(height), true).await?;
        let block = normalize::block(&raw).map_err(|e| IngestError::Malformed(e.to_string()))?;

        let mut stats = BlockStats {
            new_block: self.store.insert_block(&block).await?,
            ..Default::default()
        };

        let mut transactions: Vec<Transaction> = Vec::with_capacity(raw.transactions.len());
        for entry in &raw.transactions {
            match normalize::transaction_entry(entry, &block) {
                Ok(Some(tx)) => transactions.push(tx),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(network = %self.network, "Skipping transaction in block {}: {}", height, e);
                    stats.skipped_transactions += 1;
                }
            }
        }

        let pending: Vec<_> = transactions.iter().map(|tx| self.store.ingest_transaction(tx)).collect();
        let results: Vec<Result<bool, PulseError>> = stream::iter(pending)
            .buffer_unordered(self.config.tx_concurrency.max(1))
            .collect()
            .await;
        for result in results {
            if result? {
                stats.new_transactions += 1;
            }
        }

        if stats.new_block {
            metrics::counter!("chainpulse_blocks_ingested_total", "network" => self.network.clone()).increment(1);
        }
        metrics::counter!("chainpulse_transactions_ingested_total", "network" => self.network.clone())
            .increment(stats.new_transactions as u64);

        Ok(stats)
    }
}
