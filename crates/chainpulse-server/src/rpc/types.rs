//! Wire shapes of the JSON-RPC responses we consume.
//!
//! Receipts decode straight into alloy's `TransactionReceipt`.

use alloy::primitives::{Address, Bytes, B256, U256};
use serde::Deserialize;

/// `eth_getBlockBy*` result. Transactions stay raw so that bare hashes and
/// malformed bodies can be skipped one by one during normalization.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcBlock {
    #[serde(with = "alloy::serde::quantity")]
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    #[serde(with = "alloy::serde::quantity")]
    pub timestamp: u64,
    #[serde(with = "alloy::serde::quantity")]
    pub gas_used: u64,
    #[serde(with = "alloy::serde::quantity")]
    pub gas_limit: u64,
    #[serde(default)]
    pub base_fee_per_gas: Option<U256>,
    pub miner: Address,
    #[serde(default, with = "alloy::serde::quantity::opt")]
    pub size: Option<u64>,
    #[serde(default)]
    pub transactions: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub hash: B256,
    #[serde(default, with = "alloy::serde::quantity::opt")]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub block_hash: Option<B256>,
    #[serde(default, with = "alloy::serde::quantity::opt")]
    pub transaction_index: Option<u64>,
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    pub value: U256,
    #[serde(with = "alloy::serde::quantity")]
    pub gas: u64,
    #[serde(default)]
    pub gas_price: Option<U256>,
    #[serde(default)]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default)]
    pub max_priority_fee_per_gas: Option<U256>,
    pub input: Bytes,
    #[serde(with = "alloy::serde::quantity")]
    pub nonce: u64,
    #[serde(default, rename = "type", with = "alloy::serde::quantity::opt")]
    pub tx_type: Option<u64>,
}
