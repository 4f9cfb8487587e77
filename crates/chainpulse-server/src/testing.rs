//! In-memory chain used by unit tests.

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::rpc::types::TransactionReceipt;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chainpulse_common::{AccountActivity, Block, PulseError, TimeBucketStat, Transaction};

use crate::rpc::{BlockId, ChainError, ChainRpc, RpcBlock, RpcTransaction};
use crate::store::{SpanSummary, Store};

pub fn addr(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

pub fn hash_of(n: u64) -> B256 {
    B256::left_padding_from(&n.to_be_bytes())
}

/// A legacy transfer body; block fields are filled in by [`FakeChain::push_block`].
pub fn transfer(hash: B256, from: Address, to: Option<Address>) -> Value {
    json!({
        "hash": format!("{:?}", hash),
        "from": format!("{:?}", from),
        "to": to.map(|t| format!("{:?}", t)),
        "value": "0x1",
        "gas": "0x5208",
        "gasPrice": "0x1",
        "input": "0x",
        "nonce": "0x0",
        "type": "0x0"
    })
}

#[derive(Default)]
struct FakeState {
    head: u64,
    blocks: BTreeMap<u64, Value>,
    pending: Vec<Value>,
    block_failures: HashMap<u64, VecDeque<ChainError>>,
    block_delay: Option<Duration>,
    balances: HashMap<Address, U256>,
    nonces: HashMap<Address, u64>,
    codes: HashMap<Address, Bytes>,
    calls: HashMap<&'static str, usize>,
}

#[derive(Default)]
pub struct FakeChain {
    state: Mutex<FakeState>,
}

impl FakeChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add block `number` holding `txs`, raising the head if needed.
    pub fn push_block(&self, number: u64, timestamp: u64, txs: Vec<Value>) {
        let block_hash = format!("{:?}", hash_of(number));
        let txs: Vec<Value> = txs
            .into_iter()
            .enumerate()
            .map(|(index, mut tx)| {
                if let Some(body) = tx.as_object_mut() {
                    body.insert("blockNumber".into(), json!(format!("0x{:x}", number)));
                    body.insert("blockHash".into(), json!(block_hash));
                    body.insert("transactionIndex".into(), json!(format!("0x{:x}", index)));
                }
                tx
            })
            .collect();

        let block = json!({
            "number": format!("0x{:x}", number),
            "hash": block_hash,
            "parentHash": format!("{:?}", hash_of(number.saturating_sub(1))),
            "timestamp": format!("0x{:x}", timestamp),
            "gasUsed": format!("0x{:x}", 21_000 * txs.len() as u64),
            "gasLimit": "0x1c9c380",
            "miner": format!("{:?}", addr(0xee)),
            "transactions": txs
        });
        self.push_raw_block(number, block);
    }

    /// Store an arbitrary body at `number`, well-formed or not.
    pub fn push_raw_block(&self, number: u64, block: Value) {
        let mut state = self.state.lock();
        state.blocks.insert(number, block);
        state.head = state.head.max(number);
    }

    /// Known to the node but not mined yet.
    pub fn push_pending(&self, tx: Value) {
        self.state.lock().pending.push(tx);
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().head = head;
    }

    /// Make the next fetch of `height` fail with `err`.
    pub fn fail_block(&self, height: u64, err: ChainError) {
        self.state
            .lock()
            .block_failures
            .entry(height)
            .or_default()
            .push_back(err);
    }

    pub fn delay_blocks(&self, delay: Duration) {
        self.state.lock().block_delay = Some(delay);
    }

    pub fn set_account(&self, address: Address, balance: U256, nonce: u64, code: Bytes) {
        let mut state = self.state.lock();
        state.balances.insert(address, balance);
        state.nonces.insert(address, nonce);
        state.codes.insert(address, code);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.state.lock().calls.get(method).copied().unwrap_or(0)
    }

    fn record(&self, method: &'static str) {
        *self.state.lock().calls.entry(method).or_default() += 1;
    }

    fn find_transaction(&self, hash: B256) -> Option<Value> {
        let wanted = format!("{:?}", hash);
        let state = self.state.lock();
        state
            .blocks
            .values()
            .filter_map(|b| b.get("transactions").and_then(Value::as_array))
            .flatten()
            .chain(state.pending.iter())
            .find(|tx| tx.get("hash").and_then(Value::as_str) == Some(wanted.as_str()))
            .cloned()
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ChainError> {
    serde_json::from_value(value).map_err(|e| ChainError::Malformed(e.to_string()))
}

#[async_trait]
impl ChainRpc for FakeChain {
    async fn latest_block_number(&self) -> Result<u64, ChainError> {
        self.record("eth_blockNumber");
        Ok(self.state.lock().head)
    }

    async fn get_block(&self, id: BlockId, include_txs: bool) -> Result<RpcBlock, ChainError> {
        self.record("eth_getBlock");
        let delay = self.state.lock().block_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let found = {
            let mut state = self.state.lock();
            match id {
                BlockId::Number(n) => {
                    if let Some(err) = state.block_failures.get_mut(&n).and_then(VecDeque::pop_front) {
                        return Err(err);
                    }
                    state.blocks.get(&n).cloned()
                }
                BlockId::Hash(h) => {
                    let wanted = format!("{:?}", h);
                    state
                        .blocks
                        .values()
                        .find(|b| b.get("hash").and_then(Value::as_str) == Some(wanted.as_str()))
                        .cloned()
                }
            }
        };

        let mut block = found.ok_or_else(|| ChainError::NotFound(format!("block {}", id)))?;
        if !include_txs {
            if let Some(txs) = block.get_mut("transactions").and_then(Value::as_array_mut) {
                for tx in txs.iter_mut() {
                    if let Some(hash) = tx.get("hash").cloned() {
                        *tx = hash;
                    }
                }
            }
        }
        decode(block)
    }

    async fn get_transaction(&self, hash: B256) -> Result<RpcTransaction, ChainError> {
        self.record("eth_getTransactionByHash");
        let tx = self
            .find_transaction(hash)
            .ok_or_else(|| ChainError::NotFound(format!("transaction {:?}", hash)))?;
        decode(tx)
    }

    async fn get_transaction_receipt(&self, hash: B256) -> Result<TransactionReceipt, ChainError> {
        self.record("eth_getTransactionReceipt");
        let tx = self
            .find_transaction(hash)
            .ok_or_else(|| ChainError::NotFound(format!("receipt {:?}", hash)))?;
        decode(json!({
            "type": tx.get("type").cloned().unwrap_or_else(|| json!("0x0")),
            "status": "0x1",
            "cumulativeGasUsed": "0x5208",
            "logs": [],
            "logsBloom": format!("0x{}", "00".repeat(256)),
            "transactionHash": tx["hash"],
            "transactionIndex": tx["transactionIndex"],
            "blockNumber": tx["blockNumber"],
            "blockHash": tx["blockHash"],
            "gasUsed": "0x5208",
            "effectiveGasPrice": "0x1",
            "from": tx["from"],
            "to": tx["to"],
            "contractAddress": null
        }))
    }

    async fn get_balance(&self, address: Address) -> Result<U256, ChainError> {
        self.record("eth_getBalance");
        Ok(self.state.lock().balances.get(&address).copied().unwrap_or_default())
    }

    async fn get_transaction_count(&self, address: Address) -> Result<u64, ChainError> {
        self.record("eth_getTransactionCount");
        Ok(self.state.lock().nonces.get(&address).copied().unwrap_or_default())
    }

    async fn get_code(&self, address: Address) -> Result<Bytes, ChainError> {
        self.record("eth_getCode");
        Ok(self.state.lock().codes.get(&address).cloned().unwrap_or_default())
    }
}

/// A store whose database is down. Counts every call made past the ping.
#[derive(Default)]
pub struct UnreachableStore {
    calls: AtomicUsize,
}

impl UnreachableStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn down<T>(&self) -> Result<T, PulseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(PulseError::Unavailable("connection refused".into()))
    }
}

#[async_trait]
impl Store for UnreachableStore {
    async fn ping(&self) -> Result<(), PulseError> {
        Err(PulseError::Unavailable("connection refused".into()))
    }

    async fn insert_block(&self, _block: &Block) -> Result<bool, PulseError> {
        self.down()
    }

    async fn ingest_transaction(&self, _tx: &Transaction) -> Result<bool, PulseError> {
        self.down()
    }

    async fn get_block(&self, _number: i64) -> Result<Option<Block>, PulseError> {
        self.down()
    }

    async fn get_blocks(&self, _start: i64, _count: i64) -> Result<Vec<Block>, PulseError> {
        self.down()
    }

    async fn get_transaction(&self, _hash: &str) -> Result<Option<Transaction>, PulseError> {
        self.down()
    }

    async fn get_account_activity(&self, _address: &str) -> Result<Option<AccountActivity>, PulseError> {
        self.down()
    }

    async fn get_account_transactions(&self, _address: &str, _limit: i64) -> Result<Vec<Transaction>, PulseError> {
        self.down()
    }

    async fn span_summary(&self, _since: i64, _until: i64) -> Result<SpanSummary, PulseError> {
        self.down()
    }

    async fn rollup(&self, _since: i64, _until: i64, _bucket_seconds: i64) -> Result<Vec<TimeBucketStat>, PulseError> {
        self.down()
    }

    async fn get_cursor(&self) -> Result<Option<u64>, PulseError> {
        self.down()
    }

    async fn set_cursor(&self, _height: u64) -> Result<(), PulseError> {
        self.down()
    }
}
