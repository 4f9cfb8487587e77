pub mod activity;
pub mod analytics;
pub mod api;
pub mod cache;
pub mod config;
pub mod indexer;
pub mod query;
pub mod rpc;
pub mod scanner;
pub mod store;

#[cfg(test)]
mod testing;
