//! Chain-level guards in front of the cluster: look-back, client limits, local answers.

use serde_json::json;
use server::router::create_app;
use std::sync::Arc;
use venn_core::{
    config::ChainConfig,
    head::{AtomicHeadStore, HeadStore, SharedHeadStore},
};

use crate::{
    harness::{rpc, rpc_from, runtime, single_chain},
    mock_rpc::RpcMockBuilder,
};

const UNREACHABLE: &str = "http://127.0.0.1:9";

async fn heads_at(head: u64) -> SharedHeadStore {
    let store = Arc::new(AtomicHeadStore::new());
    store.put(&ChainConfig::new("ethereum", 1, 12.0), head).await.unwrap();
    store
}

#[tokio::test]
async fn test_look_back_rejects_old_blocks() {
    let yaml = single_chain(&[("primary", UNREACHABLE.to_string(), 0)], "max_block_look_back: 100");
    let app = create_app(runtime(&yaml, Some(heads_at(1000).await)));

    let (_, body) = rpc(&app, "ethereum", "eth_getBalance", json!(["0xabc", "0x1"])).await;
    let message = body["error"]["message"].as_str().unwrap_or_default();
    assert!(message.contains("too old"), "{body}");
}

#[tokio::test]
async fn test_look_back_passes_recent_blocks() {
    let mut upstream = RpcMockBuilder::new().await;
    upstream.mock_healthy(1, 1000).await;
    upstream.mock_method("eth_getBalance", &json!("0x10")).await;

    let yaml = single_chain(&[("primary", upstream.url(), 0)], "max_block_look_back: 100");
    let app = create_app(runtime(&yaml, Some(heads_at(1000).await)));

    let (_, body) = rpc(&app, "ethereum", "eth_getBalance", json!(["0xabc", "0x3e7"])).await;
    assert_eq!(body["result"], "0x10", "{body}");
}

#[tokio::test]
async fn test_chain_identity_is_answered_locally() {
    let yaml = single_chain(&[("primary", UNREACHABLE.to_string(), 0)], "");
    let app = create_app(runtime(&yaml, Some(heads_at(0x1234).await)));

    let (_, body) = rpc(&app, "ethereum", "eth_chainId", json!([])).await;
    assert_eq!(body["result"], "0x1");
    let (_, body) = rpc(&app, "ethereum", "net_version", json!([])).await;
    assert_eq!(body["result"], "1");
    let (_, body) = rpc(&app, "ethereum", "eth_blockNumber", json!([])).await;
    assert_eq!(body["result"], "0x1234");
}

#[tokio::test]
async fn test_client_rate_limit_per_forwarded_address() {
    let yaml = format!(
        "ratelimit:\n  total: 1\n  window: 1m\nsecurity:\n  trusted_ip_headers: \
         [x-forwarded-for]\n{}",
        single_chain(&[("primary", UNREACHABLE.to_string(), 0)], "")
    );
    let app = create_app(runtime(&yaml, None));

    let first = Some("10.1.1.1");
    let (_, body) = rpc_from(&app, "ethereum", "eth_chainId", json!([]), first).await;
    assert_eq!(body["result"], "0x1");

    let (_, body) = rpc_from(&app, "ethereum", "eth_chainId", json!([]), first).await;
    assert_eq!(body["error"]["code"], 429, "{body}");
    assert_eq!(body["error"]["data"]["Key"], "10.1.1.1");

    let (_, body) = rpc_from(&app, "ethereum", "eth_chainId", json!([]), Some("10.1.1.2")).await;
    assert_eq!(body["result"], "0x1", "each client has its own budget");
}
