//! Chain client: the JSON-RPC read surface, one client per network.

mod client;
mod error;
mod types;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::rpc::types::TransactionReceipt;
use async_trait::async_trait;
use chainpulse_common::PulseError;

pub use client::{HttpChainClient, RetryPolicy};
pub use error::ChainError;
pub use types::{RpcBlock, RpcTransaction};

/// Block selector accepted by [`ChainRpc::get_block`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockId {
    Number(u64),
    Hash(B256),
}

impl FromStr for BlockId {
    type Err = PulseError;

    /// Accepts a decimal height, a `0x` hex height, or a 32-byte block hash.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || PulseError::InvalidInput(format!("invalid block id: {}", s));

        if let Some(hex_digits) = s.strip_prefix("0x") {
            if hex_digits.len() == 64 {
                return s.parse::<B256>().map(BlockId::Hash).map_err(|_| invalid());
            }
            return u64::from_str_radix(hex_digits, 16)
                .map(BlockId::Number)
                .map_err(|_| invalid());
        }
        s.parse::<u64>().map(BlockId::Number).map_err(|_| invalid())
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Number(n) => write!(f, "{}", n),
            BlockId::Hash(h) => write!(f, "{:?}", h),
        }
    }
}

impl From<u64> for BlockId {
    fn from(number: u64) -> Self {
        BlockId::Number(number)
    }
}

/// Read-only view of an EVM node.
#[async_trait]
pub trait ChainRpc: Send + Sync {
    async fn latest_block_number(&self) -> Result<u64, ChainError>;

    async fn get_block(&self, id: BlockId, include_txs: bool) -> Result<RpcBlock, ChainError>;

    async fn get_transaction(&self, hash: B256) -> Result<RpcTransaction, ChainError>;

    async fn get_transaction_receipt(&self, hash: B256) -> Result<TransactionReceipt, ChainError>;

    async fn get_balance(&self, address: Address) -> Result<U256, ChainError>;

    async fn get_transaction_count(&self, address: Address) -> Result<u64, ChainError>;

    async fn get_code(&self, address: Address) -> Result<Bytes, ChainError>;
}

/// Chain clients by network name, built once at startup.
#[derive(Clone, Default)]
pub struct ChainRegistry {
    clients: BTreeMap<String, Arc<dyn ChainRpc>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, network: impl Into<String>, client: Arc<dyn ChainRpc>) {
        self.clients.insert(network.into(), client);
    }

    pub fn get(&self, network: &str) -> Option<Arc<dyn ChainRpc>> {
        self.clients.get(network).cloned()
    }
}
