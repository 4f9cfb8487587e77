use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::cache::TtlPolicy;
use crate::rpc::RetryPolicy;
use crate::scanner::ScanLimits;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// RPC endpoint per network name
    pub networks: BTreeMap<String, String>,
    pub rpc_timeout: Duration,
    pub rpc_retry: RetryPolicy,
    pub rpc_requests_per_second: u32,
    pub start_block: Option<u64>,
    pub ingest: IngestConfig,
    pub scan: ScanLimits,
    pub analytics_max_blocks: u64,
    pub analytics_target_points: u64,
    pub cache_capacity: usize,
    pub cache_ttl: TtlPolicy,
    pub index_probe_ttl: Duration,
    pub api_host: String,
    pub api_port: u16,
    pub metrics_addr: Option<String>,
}

/// Live-tailing knobs for one ingestor.
#[derive(Debug, Clone, Copy)]
pub struct IngestConfig {
    pub poll_interval: Duration,
    pub tick_timeout: Duration,
    pub tx_concurrency: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            tick_timeout: Duration::from_millis(30_000),
            tx_concurrency: 8,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let network_names = env::var("NETWORKS").unwrap_or_else(|_| "mainnet".to_string());
        let fallback_rpc_url = env::var("RPC_URL").ok();

        let mut networks = BTreeMap::new();
        for name in network_names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let key = format!("RPC_URL_{}", name.to_uppercase().replace('-', "_"));
            let url = env::var(&key)
                .ok()
                .or_else(|| fallback_rpc_url.clone())
                .with_context(|| format!("{} or RPC_URL must be set", key))?;
            networks.insert(name.to_lowercase(), url);
        }
        if networks.is_empty() {
            anyhow::bail!("NETWORKS must name at least one network");
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            db_max_connections: parse_var("DB_MAX_CONNECTIONS", 20)?,
            networks,
            rpc_timeout: Duration::from_millis(parse_var("RPC_TIMEOUT_MS", 10_000)?),
            rpc_retry: RetryPolicy {
                max_attempts: parse_var("RPC_MAX_ATTEMPTS", 3)?,
                delay: Duration::from_millis(parse_var("RPC_RETRY_DELAY_MS", 1_000)?),
            },
            rpc_requests_per_second: parse_var("RPC_REQUESTS_PER_SECOND", 100)?,
            start_block: env::var("START_BLOCK")
                .ok()
                .map(|v| v.parse())
                .transpose()
                .context("Invalid START_BLOCK")?,
            ingest: IngestConfig {
                poll_interval: Duration::from_millis(parse_var("POLL_INTERVAL_MS", 1_000)?),
                tick_timeout: Duration::from_millis(parse_var("TICK_TIMEOUT_MS", 30_000)?),
                tx_concurrency: parse_var("TX_CONCURRENCY", 8)?,
            },
            scan: ScanLimits {
                batch_size: parse_var("SCAN_BATCH_SIZE", 20)?,
                max_blocks: parse_var("SCAN_MAX_BLOCKS", 1_000)?,
                max_results: parse_var("SCAN_MAX_RESULTS", 25)?,
                batch_delay: Duration::from_millis(parse_var("SCAN_BATCH_DELAY_MS", 100)?),
            },
            analytics_max_blocks: parse_var("ANALYTICS_MAX_BLOCKS", 500)?,
            analytics_target_points: parse_var("ANALYTICS_TARGET_POINTS", 15)?,
            cache_capacity: parse_var("CACHE_CAPACITY", 10_000)?,
            cache_ttl: TtlPolicy {
                deep_threshold: parse_var("CACHE_DEEP_THRESHOLD", 12)?,
                long_ttl: Duration::from_secs(parse_var("CACHE_LONG_TTL_SECS", 3_600)?),
                short_ttl: Duration::from_secs(parse_var("CACHE_SHORT_TTL_SECS", 60)?),
            },
            index_probe_ttl: Duration::from_secs(parse_var("INDEX_PROBE_TTL_SECS", 10)?),
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            api_port: parse_var("API_PORT", 3000)?,
            metrics_addr: env::var("METRICS_ADDR").ok().filter(|a| !a.is_empty()),
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse().with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}
