//! Head-driven subscriptions, in process and over a live WebSocket.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use server::router::create_app;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use venn_core::{
    config::ChainConfig,
    handler::{FnHandler, Handler, Notification, Notifier, RequestCtx},
    head::{AtomicHeadStore, HeadStore},
    subscription::Subcenter,
    types::{to_payload, RpcRequest},
    utils::parse_hex,
};

use crate::{
    harness::{runtime, single_chain},
    mock_rpc::{block, hash, RpcMockBuilder},
};

async fn next_notification(rx: &mut mpsc::Receiver<Notification>) -> Value {
    let notification = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("notification in time")
        .expect("channel open");
    serde_json::from_str(notification.result.get()).unwrap()
}

#[tokio::test]
async fn test_new_heads_in_order_without_gaps() {
    let chain = Arc::new(ChainConfig::new("ethereum", 1, 12.0));
    let heads = Arc::new(AtomicHeadStore::new());
    heads.put(&chain, 20).await.unwrap();
    let upstream = FnHandler::shared(|_, req: RpcRequest| async move {
        let number = req.params[0].as_str().and_then(parse_hex).unwrap_or_default();
        to_payload(&block(number, 0x10, 0x0f))
    });
    let center = Subcenter::new(heads.clone(), upstream);

    let (notifier, mut rx) = Notifier::channel(16);
    let ctx = RequestCtx::new(Arc::clone(&chain)).with_notifier(notifier.clone());
    let id = center.serve(&ctx, RpcRequest::new("eth_subscribe", json!(["newHeads"]))).await;
    let id: String = serde_json::from_str(id.unwrap().get()).unwrap();

    // a jump of three heads is delivered block by block
    heads.put(&chain, 23).await.unwrap();
    for expected in ["0x15", "0x16", "0x17"] {
        let head = next_notification(&mut rx).await;
        assert_eq!(head["number"], expected);
        assert!(head.get("transactions").is_none());
    }

    assert!(notifier.unsubscribe(&id));
    heads.put(&chain, 24).await.unwrap();
    let late = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(!matches!(late, Ok(Some(_))), "no delivery after unsubscribe");
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn next_text(ws: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .expect("frame");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send(ws: &mut Socket, id: u64, method: &str, params: Value) {
    let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
    ws.send(Message::Text(body.to_string())).await.unwrap();
}

#[tokio::test]
async fn test_websocket_session_subscribes_and_unsubscribes() {
    let mut upstream = RpcMockBuilder::new().await;
    upstream.mock_healthy(1, 5).await;
    upstream
        .expect_call("eth_getBlockByNumber", json!(["0x5", true]), &block(5, 0x05, 0x04), 1)
        .await;

    let heads = Arc::new(AtomicHeadStore::new());
    let yaml = single_chain(&[("primary", upstream.url(), 0)], "");
    let runtime = runtime(&yaml, Some(heads.clone()));
    let app = create_app(Arc::clone(&runtime));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await
    });

    let (mut ws, _) = connect_async(format!("ws://{addr}/ethereum")).await.unwrap();

    send(&mut ws, 1, "eth_chainId", json!([])).await;
    assert_eq!(next_text(&mut ws).await["result"], "0x1");

    send(&mut ws, 2, "eth_subscribe", json!(["newHeads"])).await;
    let reply = next_text(&mut ws).await;
    let id = reply["result"].as_str().expect("subscription id").to_string();

    heads.put(&ChainConfig::new("ethereum", 1, 12.0), 5).await.unwrap();
    let notification = next_text(&mut ws).await;
    assert_eq!(notification["method"], "eth_subscription");
    assert_eq!(notification["params"]["subscription"], id.as_str());
    assert_eq!(notification["params"]["result"]["hash"], hash(0x05));

    send(&mut ws, 3, "eth_unsubscribe", json!([id])).await;
    assert_eq!(next_text(&mut ws).await["result"], true);
    send(&mut ws, 4, "eth_unsubscribe", json!([id])).await;
    assert_eq!(next_text(&mut ws).await["result"], false);

    ws.close(None).await.unwrap();
    runtime.shutdown().await;
}
