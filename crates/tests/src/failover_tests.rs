//! Priority failover through the full pipeline.

use serde_json::{json, Value};
use server::router::create_app;

use crate::{
    harness::{rpc, runtime, single_chain},
    mock_rpc::RpcMockBuilder,
};

#[tokio::test]
async fn test_failing_primary_falls_over_to_secondary() {
    let mut primary = RpcMockBuilder::new().await;
    primary.mock_server_error().await;
    let mut secondary = RpcMockBuilder::new().await;
    secondary.mock_healthy(1, 100).await;
    secondary.mock_method("eth_gasPrice", &json!("0x3b9aca00")).await;

    let yaml = single_chain(
        &[("primary", primary.url(), 0), ("secondary", secondary.url(), 1)],
        "",
    );
    let app = create_app(runtime(&yaml, None));

    let (_, body) = rpc(&app, "ethereum", "eth_gasPrice", json!([])).await;
    assert_eq!(body["result"], "0x3b9aca00", "{body}");
}

#[tokio::test]
async fn test_user_errors_are_not_retried() {
    let mut primary = RpcMockBuilder::new().await;
    primary.mock_healthy(1, 100).await;
    primary.mock_rpc_error("eth_call", 3, "execution reverted").await;
    let mut secondary = RpcMockBuilder::new().await;
    secondary.mock_healthy(1, 100).await;
    let never = secondary.expect_call("eth_call", Value::Null, &json!("0x"), 0).await;

    let yaml = single_chain(
        &[("primary", primary.url(), 0), ("secondary", secondary.url(), 1)],
        "",
    );
    let app = create_app(runtime(&yaml, None));

    let (_, body) = rpc(&app, "ethereum", "eth_call", json!([{ "to": "0x00" }, "0x10"])).await;
    assert_eq!(body["error"]["message"], "execution reverted", "{body}");
    never.assert_async().await;
}

#[tokio::test]
async fn test_all_remotes_down_is_an_error() {
    let mut only = RpcMockBuilder::new().await;
    only.mock_server_error().await;

    let yaml = single_chain(&[("only", only.url(), 0)], "");
    let app = create_app(runtime(&yaml, None));

    let (_, body) = rpc(&app, "ethereum", "eth_gasPrice", json!([])).await;
    assert!(body["error"].is_object(), "{body}");
    assert!(body.get("result").is_none() || body["result"].is_null());
}
