//! HTTP shell over the query services.

pub mod error;
pub mod handlers;

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::query::QueryRegistry;

pub struct AppState {
    pub queries: QueryRegistry,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Blocks
        .route("/api/{network}/blocks/latest", get(handlers::get_latest_block))
        .route("/api/{network}/blocks", get(handlers::list_blocks))
        .route("/api/{network}/blocks/{id}", get(handlers::get_block))
        // Transactions
        .route("/api/{network}/transactions/{hash}", get(handlers::get_transaction))
        .route("/api/{network}/transactions/{hash}/receipt", get(handlers::get_transaction_receipt))
        // Addresses
        .route("/api/{network}/addresses/{address}", get(handlers::get_address))
        .route("/api/{network}/addresses/{address}/activity", get(handlers::get_address_activity))
        .route("/api/{network}/addresses/{address}/transactions", get(handlers::get_address_transactions))
        // Analytics
        .route("/api/{network}/analytics", get(handlers::get_analytics))
        // Health
        .route("/health", get(|| async { "OK" }))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
