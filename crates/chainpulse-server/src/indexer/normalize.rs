//! Raw RPC shapes to stored rows.

use alloy::consensus::TxReceipt;
use alloy::primitives::U256;
use alloy::rpc::types::TransactionReceipt;
use bigdecimal::BigDecimal;
use chainpulse_common::{Block, PulseError, Receipt, Transaction, TxFee};
use chrono::Utc;
use serde_json::Value;
use std::str::FromStr;

use crate::rpc::{RpcBlock, RpcTransaction};

pub fn block(raw: &RpcBlock) -> Result<Block, PulseError> {
    Ok(Block {
        number: to_i64(raw.number, "block number")?,
        hash: format!("{:?}", raw.hash),
        parent_hash: format!("{:?}", raw.parent_hash),
        timestamp: to_i64(raw.timestamp, "timestamp")?,
        gas_used: to_i64(raw.gas_used, "gasUsed")?,
        gas_limit: to_i64(raw.gas_limit, "gasLimit")?,
        base_fee_per_gas: raw.base_fee_per_gas.map(decimal).transpose()?,
        miner: format!("{:?}", raw.miner),
        transaction_count: i32::try_from(raw.transactions.len())
            .map_err(|_| PulseError::Malformed("too many transactions".to_string()))?,
        size_bytes: raw.size.map(|s| to_i64(s, "size")).transpose()?,
        indexed_at: Utc::now(),
    })
}

/// Normalize one entry of a block's `transactions` array.
///
/// Returns `Ok(None)` for bare hashes, which carry nothing to store.
pub fn transaction_entry(entry: &Value, block: &Block) -> Result<Option<Transaction>, PulseError> {
    if entry.is_string() {
        return Ok(None);
    }
    let raw: RpcTransaction = serde_json::from_value(entry.clone())
        .map_err(|e| PulseError::Malformed(format!("transaction in block {}: {}", block.number, e)))?;
    transaction(&raw, block.number, &block.hash, block.timestamp).map(Some)
}

/// Normalize a mined transaction. `timestamp` comes from its block.
pub fn transaction(
    raw: &RpcTransaction,
    block_number: i64,
    block_hash: &str,
    timestamp: i64,
) -> Result<Transaction, PulseError> {
    let hash = format!("{:?}", raw.hash);

    // Pre-typed-envelope nodes omit `type`. Those are legacy.
    let tx_type = match raw.tx_type {
        Some(t) => i16::try_from(t)
            .map_err(|_| PulseError::Malformed(format!("transaction {} has type {}", hash, t)))?,
        None => 0,
    };

    let fee = TxFee::from_columns(
        tx_type,
        raw.gas_price.map(decimal).transpose()?,
        raw.max_fee_per_gas.map(decimal).transpose()?,
        raw.max_priority_fee_per_gas.map(decimal).transpose()?,
    )
    .map_err(|e| PulseError::Malformed(format!("transaction {}: {}", hash, e)))?;

    let transaction_index = raw
        .transaction_index
        .ok_or_else(|| PulseError::Malformed(format!("transaction {} has no index", hash)))?;

    Ok(Transaction {
        block_number,
        block_hash: block_hash.to_string(),
        transaction_index: i32::try_from(transaction_index)
            .map_err(|_| PulseError::Malformed(format!("transaction {} index out of range", hash)))?,
        from_address: format!("{:?}", raw.from),
        to_address: raw.to.map(|to| format!("{:?}", to)),
        value: decimal(raw.value)?,
        gas: to_i64(raw.gas, "gas")?,
        fee,
        input: format!("0x{}", hex::encode(&raw.input)),
        nonce: to_i64(raw.nonce, "nonce")?,
        tx_type,
        status: None,
        timestamp,
        hash,
    })
}

/// Pre-Byzantium receipts carry a state root instead of a status, reported as `None`.
pub fn receipt(raw: &TransactionReceipt) -> Result<Receipt, PulseError> {
    let hash = format!("{:?}", raw.transaction_hash);
    let (Some(block_number), Some(block_hash)) = (raw.block_number, raw.block_hash) else {
        return Err(PulseError::Malformed(format!("receipt {} has no block", hash)));
    };

    Ok(Receipt {
        block_number: to_i64(block_number, "block number")?,
        block_hash: format!("{:?}", block_hash),
        status: raw.inner.status_or_post_state().as_eip658(),
        gas_used: to_i64(raw.gas_used, "gasUsed")?,
        effective_gas_price: Some(decimal(U256::from(raw.effective_gas_price))?),
        contract_address: raw.contract_address.map(|a| format!("{:?}", a)),
        transaction_hash: hash,
    })
}

pub fn decimal(value: U256) -> Result<BigDecimal, PulseError> {
    BigDecimal::from_str(&value.to_string())
        .map_err(|e| PulseError::Malformed(format!("invalid integer {}: {}", value, e)))
}

fn to_i64(value: u64, field: &str) -> Result<i64, PulseError> {
    i64::try_from(value).map_err(|_| PulseError::Malformed(format!("{} {} out of range", field, value)))
}
