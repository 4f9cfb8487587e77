//! Time-bucketed chain statistics.
//!
//! Bucket width adapts to the span the data actually covers rather than the
//! span that was asked for: a 24h request answered from a few hundred
//! scanned blocks gets minute buckets, not hour buckets with one point.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chainpulse_common::{DataSource, PulseError, TimeBucketStat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::ControlFlow;
use std::str::FromStr;
use std::sync::Arc;

use crate::indexer::normalize;
use crate::rpc::{RpcBlock, RpcTransaction};
use crate::scanner::Scanner;
use crate::store::Store;

/// Allowed bucket widths in seconds, smallest first.
pub const BUCKET_LADDER: [i64; 6] = [30, 60, 300, 900, 1800, 3600];

pub const DEFAULT_TARGET_POINTS: u64 = 15;

/// Bucket width for a series spanning `span` seconds with about `target_points` points.
pub fn bucket_seconds(span: i64, target_points: u64) -> i64 {
    let target = i64::try_from(target_points.max(1)).unwrap_or(i64::MAX);
    let ideal = (span.max(0) / target).max(BUCKET_LADDER[0]);
    BUCKET_LADDER
        .iter()
        .copied()
        .find(|&width| width >= ideal)
        .unwrap_or(BUCKET_LADDER[BUCKET_LADDER.len() - 1])
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnalyticsRange {
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "6h")]
    SixHours,
    #[default]
    #[serde(rename = "24h")]
    Day,
}

impl AnalyticsRange {
    pub fn seconds(self) -> i64 {
        match self {
            AnalyticsRange::OneHour => 3_600,
            AnalyticsRange::SixHours => 6 * 3_600,
            AnalyticsRange::Day => 24 * 3_600,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AnalyticsRange::OneHour => "1h",
            AnalyticsRange::SixHours => "6h",
            AnalyticsRange::Day => "24h",
        }
    }
}

impl FromStr for AnalyticsRange {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(AnalyticsRange::OneHour),
            "6h" => Ok(AnalyticsRange::SixHours),
            "24h" => Ok(AnalyticsRange::Day),
            other => Err(PulseError::InvalidInput(format!(
                "unsupported range {:?}, expected 1h, 6h or 24h",
                other
            ))),
        }
    }
}

impl fmt::Display for AnalyticsRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested window `[since, until]` in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub range: AnalyticsRange,
    pub since: i64,
    pub until: i64,
}

impl Window {
    pub fn ending_at(range: AnalyticsRange, until: i64) -> Self {
        Self {
            range,
            since: until - range.seconds(),
            until,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockSample {
    pub number: u64,
    pub timestamp: i64,
    pub tx_count: i64,
    pub gas_used: i64,
    pub value_total: BigDecimal,
}

impl BlockSample {
    fn from_block(block: &RpcBlock) -> Self {
        let value_total = block
            .transactions
            .iter()
            .filter(|entry| entry.is_object())
            .filter_map(|entry| serde_json::from_value::<RpcTransaction>(entry.clone()).ok())
            .filter_map(|tx| normalize::decimal(tx.value).ok())
            .fold(BigDecimal::from(0), |acc, value| acc + value);

        Self {
            number: block.number,
            timestamp: i64::try_from(block.timestamp).unwrap_or(i64::MAX),
            tx_count: block.transactions.len() as i64,
            gas_used: i64::try_from(block.gas_used).unwrap_or(i64::MAX),
            value_total,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsStats {
    pub tps: f64,
    pub avg_block_time: f64,
    pub avg_tx_per_block: f64,
    pub total_transactions: i64,
    pub block_count: i64,
    pub span_seconds: i64,
    pub bucket_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsReport {
    pub range: AnalyticsRange,
    pub stats: AnalyticsStats,
    pub time_series: Vec<TimeBucketStat>,
    pub source: DataSource,
    pub partial: bool,
}

/// Bucket samples and derive rates. Samples may arrive in any order; block
/// times are measured between consecutive samples as given.
pub fn aggregate(samples: &[BlockSample], target_points: u64) -> (AnalyticsStats, Vec<TimeBucketStat>) {
    let (Some(min_ts), Some(max_ts)) = (
        samples.iter().map(|s| s.timestamp).min(),
        samples.iter().map(|s| s.timestamp).max(),
    ) else {
        return (
            AnalyticsStats {
                bucket_seconds: bucket_seconds(0, target_points),
                ..Default::default()
            },
            Vec::new(),
        );
    };

    let span = max_ts - min_ts;
    let width = bucket_seconds(span, target_points);
    let mut buckets: BTreeMap<i64, TimeBucketStat> = BTreeMap::new();

    for sample in samples {
        let start = sample.timestamp.div_euclid(width) * width;
        let bucket = buckets.entry(start).or_insert_with(|| TimeBucketStat {
            bucket_start: start,
            transaction_count: 0,
            block_count: 0,
            gas_used_total: 0,
            value_total: BigDecimal::from(0),
        });
        bucket.transaction_count += sample.tx_count;
        bucket.block_count += 1;
        bucket.gas_used_total = bucket.gas_used_total.saturating_add(sample.gas_used);
        bucket.value_total += &sample.value_total;
    }

    let total_transactions: i64 = samples.iter().map(|s| s.tx_count).sum();
    let block_count = samples.len() as i64;
    let avg_block_time = if samples.len() < 2 {
        0.0
    } else {
        let deltas: i64 = samples
            .windows(2)
            .map(|pair| (pair[0].timestamp - pair[1].timestamp).abs())
            .sum();
        deltas as f64 / (samples.len() - 1) as f64
    };

    let stats = AnalyticsStats {
        tps: rate(total_transactions, span),
        avg_block_time,
        avg_tx_per_block: rate(total_transactions, block_count),
        total_transactions,
        block_count,
        span_seconds: span,
        bucket_seconds: width,
    };
    (stats, buckets.into_values().collect())
}

fn rate(numerator: i64, denominator: i64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[async_trait]
pub trait AnalyticsBackend: Send + Sync {
    async fn report(&self, window: Window) -> Result<AnalyticsReport, PulseError>;
}

/// Statistics from a bounded newest-first chain scan.
pub struct ScanAnalytics {
    scanner: Scanner,
    max_blocks: u64,
    target_points: u64,
}

impl ScanAnalytics {
    pub fn new(scanner: Scanner, max_blocks: u64, target_points: u64) -> Self {
        Self {
            scanner,
            max_blocks,
            target_points,
        }
    }
}

#[async_trait]
impl AnalyticsBackend for ScanAnalytics {
    async fn report(&self, window: Window) -> Result<AnalyticsReport, PulseError> {
        let head = self.scanner.chain().latest_block_number().await?;
        let mut samples = Vec::new();
        let mut covered = false;

        let walk = self
            .scanner
            .walk(head, self.max_blocks, |block| {
                let sample = BlockSample::from_block(block);
                if sample.timestamp < window.since {
                    covered = true;
                    return ControlFlow::Break(());
                }
                if sample.timestamp <= window.until {
                    samples.push(sample);
                }
                ControlFlow::Continue(())
            })
            .await;

        if walk.all_failed() {
            return Err(PulseError::Unavailable(format!(
                "analytics scan could not fetch any of {} blocks",
                walk.blocks_scanned
            )));
        }

        let (stats, time_series) = aggregate(&samples, self.target_points);
        Ok(AnalyticsReport {
            range: window.range,
            stats,
            time_series,
            source: DataSource::Scan,
            // A failed height may have been inside the window.
            partial: walk.failed_blocks > 0 || !(covered || walk.reached_genesis),
        })
    }
}

/// Statistics from store rollups.
pub struct IndexedAnalytics {
    store: Arc<dyn Store>,
    target_points: u64,
}

impl IndexedAnalytics {
    pub fn new(store: Arc<dyn Store>, target_points: u64) -> Self {
        Self { store, target_points }
    }

    /// Whether the index reaches back to the start of `window`: its oldest
    /// block in the window sits within one bucket of `since`, or it holds a
    /// block from the preceding window.
    async fn covers_start(
        &self,
        window: Window,
        first_timestamp: Option<i64>,
        width: i64,
    ) -> Result<bool, PulseError> {
        match first_timestamp {
            None => Ok(false),
            Some(first) if first - window.since <= width => Ok(true),
            Some(_) => {
                let before = self
                    .store
                    .span_summary(window.since - window.range.seconds(), window.since - 1)
                    .await?;
                Ok(before.block_count > 0)
            }
        }
    }
}

#[async_trait]
impl AnalyticsBackend for IndexedAnalytics {
    async fn report(&self, window: Window) -> Result<AnalyticsReport, PulseError> {
        let summary = self.store.span_summary(window.since, window.until).await?;
        let span = match (summary.first_timestamp, summary.last_timestamp) {
            (Some(first), Some(last)) => last - first,
            _ => 0,
        };
        let width = bucket_seconds(span, self.target_points);

        let time_series = if summary.block_count > 0 {
            self.store.rollup(window.since, window.until, width).await?
        } else {
            Vec::new()
        };

        let avg_block_time = if summary.block_count < 2 {
            0.0
        } else {
            span as f64 / (summary.block_count - 1) as f64
        };

        let covered = self.covers_start(window, summary.first_timestamp, width).await?;

        Ok(AnalyticsReport {
            range: window.range,
            stats: AnalyticsStats {
                tps: rate(summary.transaction_count, span),
                avg_block_time,
                avg_tx_per_block: rate(summary.transaction_count, summary.block_count),
                total_transactions: summary.transaction_count,
                block_count: summary.block_count,
                span_seconds: span,
                bucket_seconds: width,
            },
            time_series,
            source: DataSource::Indexed,
            partial: !covered,
        })
    }
}
