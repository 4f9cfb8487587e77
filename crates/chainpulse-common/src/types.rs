use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::PulseError;

/// Block data as stored in the database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Block {
    pub number: i64,
    pub hash: String,
    pub parent_hash: String,
    pub timestamp: i64,
    pub gas_used: i64,
    pub gas_limit: i64,
    pub base_fee_per_gas: Option<BigDecimal>,
    pub miner: String,
    pub transaction_count: i32,
    pub size_bytes: Option<i64>,
    pub indexed_at: DateTime<Utc>,
}

/// Fee fields of a transaction, by transaction kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TxFee {
    /// Type 0
    Legacy { gas_price: BigDecimal },
    /// Type 1 (EIP-2930)
    AccessList { gas_price: BigDecimal },
    /// Type 2 and every later kind priced with EIP-1559 fee caps
    DynamicFee {
        max_fee_per_gas: BigDecimal,
        max_priority_fee_per_gas: BigDecimal,
    },
}

impl TxFee {
    /// Build the fee variant for `tx_type` from its nullable column values.
    /// Fails when a field the kind requires is missing.
    pub fn from_columns(
        tx_type: i16,
        gas_price: Option<BigDecimal>,
        max_fee_per_gas: Option<BigDecimal>,
        max_priority_fee_per_gas: Option<BigDecimal>,
    ) -> Result<Self, PulseError> {
        match tx_type {
            0 | 1 => {
                let gas_price = gas_price.ok_or_else(|| {
                    PulseError::Malformed(format!("type {} transaction without gasPrice", tx_type))
                })?;
                Ok(if tx_type == 0 {
                    TxFee::Legacy { gas_price }
                } else {
                    TxFee::AccessList { gas_price }
                })
            }
            t if t >= 2 => match (max_fee_per_gas, max_priority_fee_per_gas) {
                (Some(max_fee_per_gas), Some(max_priority_fee_per_gas)) => Ok(TxFee::DynamicFee {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                }),
                _ => Err(PulseError::Malformed(format!(
                    "type {} transaction without fee caps",
                    t
                ))),
            },
            t => Err(PulseError::Malformed(format!("unknown transaction type {}", t))),
        }
    }

    /// Column values `(gas_price, max_fee_per_gas, max_priority_fee_per_gas)`.
    pub fn columns(&self) -> (Option<&BigDecimal>, Option<&BigDecimal>, Option<&BigDecimal>) {
        match self {
            TxFee::Legacy { gas_price } | TxFee::AccessList { gas_price } => {
                (Some(gas_price), None, None)
            }
            TxFee::DynamicFee {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => (None, Some(max_fee_per_gas), Some(max_priority_fee_per_gas)),
        }
    }
}

/// Normalized transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub block_number: i64,
    pub block_hash: String,
    pub transaction_index: i32,
    pub from_address: String,
    /// `None` for contract creation
    pub to_address: Option<String>,
    pub value: BigDecimal,
    pub gas: i64,
    pub fee: TxFee,
    /// `0x`-prefixed calldata
    pub input: String,
    pub nonce: i64,
    pub tx_type: i16,
    pub status: Option<bool>,
    pub timestamp: i64,
}

/// Transaction data as stored in the database
#[derive(Debug, Clone, FromRow)]
pub struct TransactionRow {
    pub hash: String,
    pub block_number: i64,
    pub block_hash: String,
    pub transaction_index: i32,
    pub from_address: String,
    pub to_address: Option<String>,
    pub value: BigDecimal,
    pub gas: i64,
    pub gas_price: Option<BigDecimal>,
    pub max_fee_per_gas: Option<BigDecimal>,
    pub max_priority_fee_per_gas: Option<BigDecimal>,
    pub input: String,
    pub nonce: i64,
    pub tx_type: i16,
    pub status: Option<bool>,
    pub timestamp: i64,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = PulseError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let fee = TxFee::from_columns(
            row.tx_type,
            row.gas_price,
            row.max_fee_per_gas,
            row.max_priority_fee_per_gas,
        )
        .map_err(|e| PulseError::Malformed(format!("transaction {}: {}", row.hash, e)))?;

        Ok(Transaction {
            hash: row.hash,
            block_number: row.block_number,
            block_hash: row.block_hash,
            transaction_index: row.transaction_index,
            from_address: row.from_address,
            to_address: row.to_address,
            value: row.value,
            gas: row.gas,
            fee,
            input: row.input,
            nonce: row.nonce,
            tx_type: row.tx_type,
            status: row.status,
            timestamp: row.timestamp,
        })
    }
}

/// Per-address activity counters as stored in the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct AccountActivity {
    pub address: String,
    /// Transactions sent by this address. Never decreases.
    pub transaction_count: i64,
    pub first_seen_block: i64,
    pub last_seen_block: i64,
}

/// One point of a time series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct TimeBucketStat {
    pub bucket_start: i64,
    pub transaction_count: i64,
    pub block_count: i64,
    pub gas_used_total: i64,
    pub value_total: BigDecimal,
}

/// Transaction receipt, read from the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_hash: String,
    pub block_number: i64,
    pub block_hash: String,
    /// `None` on pre-Byzantium receipts
    pub status: Option<bool>,
    pub gas_used: i64,
    pub effective_gas_price: Option<BigDecimal>,
    pub contract_address: Option<String>,
}

/// Where a query answer came from. Scan answers are best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Indexed,
    Scan,
}

/// Lowercase, `0x`-prefixed form of an address or hash.
pub fn normalize_hex(value: &str) -> String {
    let value = value.trim().to_lowercase();
    if value.starts_with("0x") {
        value
    } else {
        format!("0x{}", value)
    }
}
