use alloy::primitives::{Address, Bytes, B256, U256, U64};
use alloy::rpc::types::TransactionReceipt;
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::types::{RpcBlock, RpcTransaction};
use super::{BlockId, ChainError, ChainRpc};

type SharedRateLimiter = Arc<RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>>;

/// Bounded attempts with a fixed delay between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// JSON-RPC client for a single network endpoint.
pub struct HttpChainClient {
    network: String,
    client: reqwest::Client,
    rpc_url: String,
    retry: RetryPolicy,
    rate_limiter: Option<SharedRateLimiter>,
    next_id: AtomicU64,
}

impl HttpChainClient {
    pub fn new(
        network: impl Into<String>,
        rpc_url: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
        requests_per_second: Option<u32>,
    ) -> Result<Self, ChainError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::Transport(format!("failed to build HTTP client: {}", e)))?;

        let rate_limiter = requests_per_second
            .and_then(NonZeroU32::new)
            .map(|rps| Arc::new(RateLimiter::direct(Quota::per_second(rps))));

        Ok(Self {
            network: network.into(),
            client,
            rpc_url: rpc_url.into(),
            retry,
            rate_limiter,
            next_id: AtomicU64::new(1),
        })
    }

    /// Send a request, retrying transport failures with a fixed delay.
    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ChainError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.send_once(method, &params).await {
                Err(ChainError::Transport(e)) => {
                    tracing::warn!(
                        network = %self.network,
                        "RPC {} failed (attempt {}/{}): {}",
                        method,
                        attempt,
                        max_attempts,
                        e
                    );
                    last_error = e;
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry.delay).await;
                    }
                }
                result => {
                    if attempt > 1 && result.is_ok() {
                        tracing::info!(network = %self.network, "RPC {} succeeded after {} retries", method, attempt - 1);
                    }
                    return result;
                }
            }
        }

        Err(ChainError::RetryExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn send_once<T: DeserializeOwned>(&self, method: &str, params: &Value) -> Result<T, ChainError> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ChainError::Transport(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(ChainError::Rpc {
                code: status.as_u16() as i64,
                message: format!("HTTP {}", status),
            });
        }

        // Anything that is not a JSON-RPC envelope (a proxy error page, a
        // truncated body) counts as a transport failure.
        let envelope: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| ChainError::Transport(format!("{}: unreadable response: {}", method, e)))?;

        if let Some(error) = envelope.error {
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        match envelope.result {
            None | Some(Value::Null) => Err(ChainError::NotFound(format!("{} {}", method, params))),
            Some(result) => serde_json::from_value(result)
                .map_err(|e| ChainError::Malformed(format!("{}: {}", method, e))),
        }
    }
}

#[async_trait]
impl ChainRpc for HttpChainClient {
    async fn latest_block_number(&self) -> Result<u64, ChainError> {
        let number: U64 = self.request("eth_blockNumber", json!([])).await?;
        Ok(number.to())
    }

    async fn get_block(&self, id: BlockId, include_txs: bool) -> Result<RpcBlock, ChainError> {
        match id {
            BlockId::Number(number) => {
                self.request(
                    "eth_getBlockByNumber",
                    json!([format!("0x{:x}", number), include_txs]),
                )
                .await
            }
            BlockId::Hash(hash) => {
                self.request("eth_getBlockByHash", json!([format!("{:?}", hash), include_txs]))
                    .await
            }
        }
    }

    async fn get_transaction(&self, hash: B256) -> Result<RpcTransaction, ChainError> {
        self.request("eth_getTransactionByHash", json!([format!("{:?}", hash)]))
            .await
    }

    async fn get_transaction_receipt(&self, hash: B256) -> Result<TransactionReceipt, ChainError> {
        self.request("eth_getTransactionReceipt", json!([format!("{:?}", hash)]))
            .await
    }

    async fn get_balance(&self, address: Address) -> Result<U256, ChainError> {
        self.request("eth_getBalance", json!([format!("{:?}", address), "latest"]))
            .await
    }

    async fn get_transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        let nonce: U64 = self
            .request("eth_getTransactionCount", json!([format!("{:?}", address), "latest"]))
            .await?;
        Ok(nonce.to())
    }

    async fn get_code(&self, address: Address) -> Result<Bytes, ChainError> {
        self.request("eth_getCode", json!([format!("{:?}", address), "latest"]))
            .await
    }
}
