//! Tail loop against a JSON-RPC node that stalls or sits behind a failing proxy.

use std::sync::Arc;
use std::time::Duration;

use chainpulse_server::config::IngestConfig;
use chainpulse_server::indexer::{Ingestor, TickOutcome};
use chainpulse_server::rpc::{HttpChainClient, RetryPolicy};
use chainpulse_server::store::{MemoryStore, Store};
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BLOCK_HASH: &str = "0x000000000000000000000000000000000000000000000000000000000000000a";

fn rpc_result(result: Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result}))
}

fn block_ten() -> Value {
    json!({
        "number": "0xa",
        "hash": BLOCK_HASH,
        "parentHash": "0x0000000000000000000000000000000000000000000000000000000000000009",
        "timestamp": "0x64",
        "gasUsed": "0x5208",
        "gasLimit": "0x1c9c380",
        "miner": "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee",
        "transactions": [{
            "hash": "0x00000000000000000000000000000000000000000000000000000000000000f1",
            "blockNumber": "0xa",
            "blockHash": BLOCK_HASH,
            "transactionIndex": "0x0",
            "from": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            "to": "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb",
            "value": "0xde0b6b3a7640000",
            "gas": "0x5208",
            "maxFeePerGas": "0x3b9aca00",
            "maxPriorityFeePerGas": "0x1",
            "input": "0x",
            "nonce": "0x0",
            "type": "0x2"
        }]
    })
}

async fn get_block_calls(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| {
            serde_json::from_slice::<Value>(&r.body)
                .map(|b| b["method"] == "eth_getBlockByNumber")
                .unwrap_or(false)
        })
        .count()
}

#[tokio::test]
async fn test_stalled_height_is_retried_next_tick() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "eth_blockNumber"})))
        .respond_with(rpc_result(json!("0xa")))
        .mount(&server)
        .await;
    // Three attempts that all outlive the client timeout, then a healthy node.
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "eth_getBlockByNumber"})))
        .respond_with(rpc_result(block_ten()).set_delay(Duration::from_secs(2)))
        .up_to_n_times(3)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "eth_getBlockByNumber"})))
        .respond_with(rpc_result(block_ten()))
        .mount(&server)
        .await;

    let chain = Arc::new(
        HttpChainClient::new(
            "testnet",
            server.uri(),
            Duration::from_millis(200),
            RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_millis(10),
            },
            None,
        )
        .unwrap(),
    );
    let store = Arc::new(MemoryStore::new());
    let mut ingestor = Ingestor::start("testnet", chain, store.clone(), IngestConfig::default(), Some(10))
        .await
        .unwrap();

    match ingestor.tick().await {
        TickOutcome::Failed { height, reason } => {
            assert_eq!(height, 10);
            assert!(reason.contains("retries exhausted"), "unexpected reason: {}", reason);
        }
        other => panic!("expected a failed tick, got {:?}", other),
    }
    assert_eq!(get_block_calls(&server).await, 3);
    assert_eq!(ingestor.next_height(), 10);
    assert_eq!(store.get_cursor().await.unwrap(), None);

    match ingestor.tick().await {
        TickOutcome::Ingested {
            height,
            new_transactions,
            ..
        } => {
            assert_eq!(height, 10);
            assert_eq!(new_transactions, 1);
        }
        other => panic!("expected the height to be ingested, got {:?}", other),
    }
    assert_eq!(ingestor.next_height(), 11);
    assert_eq!(store.get_cursor().await.unwrap(), Some(10));

    let sender = store
        .get_account_activity("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sender.transaction_count, 1);
    assert_eq!(sender.first_seen_block, 10);
}

#[tokio::test]
async fn test_proxy_error_page_does_not_skip_height() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "eth_blockNumber"})))
        .respond_with(rpc_result(json!("0xa")))
        .mount(&server)
        .await;
    // A gateway answering 200 with an HTML page for every attempt of the first tick.
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "eth_getBlockByNumber"})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string("<html><body><h1>502 Bad Gateway</h1></body></html>"),
        )
        .up_to_n_times(3)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"method": "eth_getBlockByNumber"})))
        .respond_with(rpc_result(block_ten()))
        .mount(&server)
        .await;

    let chain = Arc::new(
        HttpChainClient::new(
            "testnet",
            server.uri(),
            Duration::from_secs(1),
            RetryPolicy {
                max_attempts: 3,
                delay: Duration::from_millis(10),
            },
            None,
        )
        .unwrap(),
    );
    let store = Arc::new(MemoryStore::new());
    let mut ingestor = Ingestor::start("testnet", chain, store.clone(), IngestConfig::default(), Some(10))
        .await
        .unwrap();

    match ingestor.tick().await {
        TickOutcome::Failed { height, reason } => {
            assert_eq!(height, 10);
            assert!(reason.contains("retries exhausted"), "unexpected reason: {}", reason);
        }
        other => panic!("expected a failed tick, got {:?}", other),
    }
    assert_eq!(get_block_calls(&server).await, 3);
    assert_eq!(ingestor.next_height(), 10);
    assert_eq!(store.get_cursor().await.unwrap(), None);

    assert!(matches!(ingestor.tick().await, TickOutcome::Ingested { height: 10, .. }));
    assert_eq!(store.get_cursor().await.unwrap(), Some(10));
}
