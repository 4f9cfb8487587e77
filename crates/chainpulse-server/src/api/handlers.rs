use alloy::primitives::{Address, B256};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use chainpulse_common::{AccountActivity, PulseError, Receipt, Transaction};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use super::error::ApiResult;
use super::AppState;
use crate::analytics::{AnalyticsRange, AnalyticsReport};
use crate::query::{AccountOverview, AccountTransactions, BlockDetails};
use crate::rpc::BlockId;

const DEFAULT_BLOCKS_PER_PAGE: u64 = 20;
const DEFAULT_ACCOUNT_TRANSACTIONS: usize = 25;

#[derive(Debug, Serialize)]
pub struct LatestBlock {
    pub network: String,
    pub number: u64,
}

#[derive(Debug, Deserialize)]
pub struct BlocksParams {
    pub start: Option<u64>,
    pub count: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct BlockParams {
    #[serde(default)]
    pub include_txs: bool,
}

#[derive(Debug, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct AnalyticsParams {
    pub range: Option<String>,
}

fn parse_hash(raw: &str) -> Result<B256, PulseError> {
    B256::from_str(raw.trim()).map_err(|_| PulseError::InvalidInput(format!("invalid hash: {}", raw)))
}

fn parse_address(raw: &str) -> Result<Address, PulseError> {
    Address::from_str(raw.trim()).map_err(|_| PulseError::InvalidInput(format!("invalid address: {}", raw)))
}

pub async fn get_latest_block(
    State(state): State<Arc<AppState>>,
    Path(network): Path<String>,
) -> ApiResult<Json<LatestBlock>> {
    let service = state.queries.get(&network)?;
    let number = service.get_latest_block_number().await?;
    Ok(Json(LatestBlock { network, number }))
}

/// Without `start`, the page ends at the chain head.
pub async fn list_blocks(
    State(state): State<Arc<AppState>>,
    Path(network): Path<String>,
    Query(params): Query<BlocksParams>,
) -> ApiResult<Json<Vec<BlockDetails>>> {
    let service = state.queries.get(&network)?;
    let count = params.count.unwrap_or(DEFAULT_BLOCKS_PER_PAGE);
    let start = match params.start {
        Some(start) => start,
        None => {
            let head = service.get_latest_block_number().await?;
            (head + 1).saturating_sub(count.min(crate::query::MAX_BLOCKS_PER_PAGE))
        }
    };
    Ok(Json(service.get_blocks(start, count).await?))
}

pub async fn get_block(
    State(state): State<Arc<AppState>>,
    Path((network, id)): Path<(String, String)>,
    Query(params): Query<BlockParams>,
) -> ApiResult<Json<BlockDetails>> {
    let service = state.queries.get(&network)?;
    let id: BlockId = id.parse()?;
    let details = service
        .get_block(id, params.include_txs)
        .await
        .into_result(format!("block {}", id))?;
    Ok(Json(details))
}

pub async fn get_transaction(
    State(state): State<Arc<AppState>>,
    Path((network, hash)): Path<(String, String)>,
) -> ApiResult<Json<Transaction>> {
    let service = state.queries.get(&network)?;
    let hash = parse_hash(&hash)?;
    let tx = service
        .get_transaction(hash)
        .await
        .into_result(format!("transaction {:?}", hash))?;
    Ok(Json(tx))
}

pub async fn get_transaction_receipt(
    State(state): State<Arc<AppState>>,
    Path((network, hash)): Path<(String, String)>,
) -> ApiResult<Json<Receipt>> {
    let service = state.queries.get(&network)?;
    let hash = parse_hash(&hash)?;
    let receipt = service
        .get_transaction_receipt(hash)
        .await
        .into_result(format!("receipt {:?}", hash))?;
    Ok(Json(receipt))
}

pub async fn get_address(
    State(state): State<Arc<AppState>>,
    Path((network, address)): Path<(String, String)>,
) -> ApiResult<Json<AccountOverview>> {
    let service = state.queries.get(&network)?;
    let address = parse_address(&address)?;
    Ok(Json(service.get_account_overview(address).await?))
}

pub async fn get_address_activity(
    State(state): State<Arc<AppState>>,
    Path((network, address)): Path<(String, String)>,
) -> ApiResult<Json<AccountActivity>> {
    let service = state.queries.get(&network)?;
    let address = parse_address(&address)?;
    let activity = service
        .get_account_activity(address)
        .await
        .into_result(format!("address {:?}", address))?;
    Ok(Json(activity))
}

pub async fn get_address_transactions(
    State(state): State<Arc<AppState>>,
    Path((network, address)): Path<(String, String)>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Json<AccountTransactions>> {
    let service = state.queries.get(&network)?;
    let address = parse_address(&address)?;
    let limit = params.limit.unwrap_or(DEFAULT_ACCOUNT_TRANSACTIONS);
    Ok(Json(service.get_account_transactions(address, limit).await?))
}

pub async fn get_analytics(
    State(state): State<Arc<AppState>>,
    Path(network): Path<String>,
    Query(params): Query<AnalyticsParams>,
) -> ApiResult<Json<AnalyticsReport>> {
    let service = state.queries.get(&network)?;
    let range = match params.range.as_deref() {
        Some(raw) => raw.parse()?,
        None => AnalyticsRange::default(),
    };
    Ok(Json(service.get_analytics(range).await?))
}
