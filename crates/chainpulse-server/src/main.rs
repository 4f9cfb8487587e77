use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use chainpulse_server::api::{self, AppState};
use chainpulse_server::cache::{CacheBackend, MemoryCache};
use chainpulse_server::config::Config;
use chainpulse_server::indexer::Ingestor;
use chainpulse_server::query::{QueryOptions, QueryRegistry, QueryService};
use chainpulse_server::rpc::{ChainRegistry, ChainRpc, HttpChainClient};
use chainpulse_server::store::{MemoryStore, PgStore, Store};

/// Retry delays for exponential backoff (in seconds)
const RETRY_DELAYS: &[u64] = &[5, 10, 20, 30, 60];
const MAX_RETRY_DELAY: u64 = 60;

#[derive(Parser)]
#[command(name = "chainpulse")]
#[command(about = "Multi-network EVM ingestion and analytics service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Tail every configured network and serve the HTTP API (default)
    Serve,
    /// Ingest a fixed range of heights for one network, then exit
    Backfill {
        #[arg(long)]
        network: String,
        #[arg(long)]
        from: u64,
        #[arg(long)]
        to: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr.parse().with_context(|| format!("Invalid METRICS_ADDR {}", addr))?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        tracing::info!("Serving metrics on {}", addr);
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Backfill { network, from, to } => backfill(config, &network, from, to).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "chainpulse=info,chainpulse_server=info,tower_http=debug,sqlx=warn".into());
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn build_chains(config: &Config) -> Result<ChainRegistry> {
    let mut chains = ChainRegistry::new();
    for (network, url) in &config.networks {
        let client = HttpChainClient::new(
            network.clone(),
            url.clone(),
            config.rpc_timeout,
            config.rpc_retry,
            Some(config.rpc_requests_per_second),
        )
        .with_context(|| format!("Failed to create RPC client for {}", network))?;
        chains.insert(network.clone(), Arc::new(client));
    }
    Ok(chains)
}

/// One store per network: Postgres when `DATABASE_URL` is set, else in memory.
async fn build_stores(config: &Config) -> Result<Vec<(String, Arc<dyn Store>)>> {
    let pool = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database and running migrations");
            let pool = chainpulse_common::db::connect(url, config.db_max_connections)
                .await
                .context("Failed to prepare database")?;
            Some(pool)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, indexing into memory only");
            None
        }
    };

    Ok(config
        .networks
        .keys()
        .map(|network| {
            let store: Arc<dyn Store> = match &pool {
                Some(pool) => Arc::new(PgStore::new(pool.clone(), network.clone())),
                None => Arc::new(MemoryStore::new()),
            };
            (network.clone(), store)
        })
        .collect())
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!("Starting chainpulse for {} network(s)", config.networks.len());

    let chains = build_chains(&config)?;
    let stores = build_stores(&config).await?;
    let cache: Arc<dyn CacheBackend> = Arc::new(MemoryCache::new(config.cache_capacity));

    let options = QueryOptions {
        ttl: config.cache_ttl,
        index_probe_ttl: config.index_probe_ttl,
        scan: config.scan,
        analytics_max_blocks: config.analytics_max_blocks,
        analytics_target_points: config.analytics_target_points,
    };

    let mut queries = QueryRegistry::new();
    for (network, store) in &stores {
        let chain = chains
            .get(network)
            .with_context(|| format!("No RPC client for {}", network))?;
        queries.insert(QueryService::new(
            network.clone(),
            chain.clone(),
            store.clone(),
            cache.clone(),
            options,
        ));

        let network = network.clone();
        let chain = chain.clone();
        let store = store.clone();
        let ingest = config.ingest;
        let start_block = config.start_block;
        tokio::spawn(async move {
            run_with_retry(|| {
                let network = network.clone();
                let chain = chain.clone();
                let store = store.clone();
                async move {
                    let ingestor = Ingestor::start(network, chain, store, ingest, start_block).await?;
                    ingestor.run().await;
                    Ok(())
                }
            })
            .await
        });
    }

    tracing::info!("Serving networks: {}", queries.networks().join(", "));
    let app = api::router(Arc::new(AppState { queries }));
    let addr = format!("{}:{}", config.api_host, config.api_port);
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn backfill(config: Config, network: &str, from: u64, to: u64) -> Result<()> {
    if from > to {
        anyhow::bail!("--from ({}) must not exceed --to ({})", from, to);
    }
    if config.database_url.is_none() {
        anyhow::bail!("DATABASE_URL must be set for backfill");
    }

    let chains = build_chains(&config)?;
    let chain: Arc<dyn ChainRpc> = chains
        .get(network)
        .with_context(|| format!("Unknown network {}", network))?;
    let store = build_stores(&config)
        .await?
        .into_iter()
        .find_map(|(name, store)| (name == network).then_some(store))
        .with_context(|| format!("Unknown network {}", network))?;

    tracing::info!(network = %network, "Backfilling blocks {} to {}", from, to);
    let ingestor = Ingestor::start(network, chain, store, config.ingest, Some(from)).await?;
    let report = ingestor
        .backfill(from, to)
        .await
        .with_context(|| format!("Backfill of {} failed", network))?;
    tracing::info!(
        network = %network,
        "Backfill done: {} blocks, {} new transactions, {} skipped",
        report.blocks,
        report.new_transactions,
        report.skipped_blocks
    );
    Ok(())
}

/// Run an async function with exponential backoff retry.
/// Per-height failures are handled inside the ingestor; this covers startup
/// failures such as an unreachable database or node.
async fn run_with_retry<F, Fut>(f: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut retry_count = 0;

    loop {
        match f().await {
            Ok(()) => {
                retry_count = 0;
            }
            Err(e) => {
                let delay = RETRY_DELAYS
                    .get(retry_count)
                    .copied()
                    .unwrap_or(MAX_RETRY_DELAY);

                tracing::error!(
                    "Ingestor failed: {:#}. Restarting in {}s (attempt {})...",
                    e,
                    delay,
                    retry_count + 1
                );

                tokio::time::sleep(Duration::from_secs(delay)).await;
                retry_count += 1;
            }
        }
    }
}
