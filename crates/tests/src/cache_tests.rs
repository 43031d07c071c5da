//! Block cache hits and reorg purges.

use parking_lot::Mutex;
use serde_json::{json, Value};
use server::router::create_app;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use venn_core::{
    cache::{Cacher, CompoundStore, Deduper, LruStore, OriginStore, SharedBlockStore},
    config::ChainConfig,
    handler::{FnHandler, Handler, RequestCtx},
    types::{to_payload, RpcRequest},
};

use crate::{
    harness::{rpc, runtime, single_chain},
    mock_rpc::{block, hash, RpcMockBuilder},
};

#[tokio::test]
async fn test_second_block_read_is_served_from_cache() {
    let mut upstream = RpcMockBuilder::new().await;
    upstream.mock_healthy(1, 200).await;
    let fetch = upstream
        .expect_call("eth_getBlockByNumber", json!(["0x64", true]), &block(100, 0x64, 0x63), 1)
        .await;

    let yaml = single_chain(&[("primary", upstream.url(), 0)], "");
    let app = create_app(runtime(&yaml, None));

    for _ in 0..2 {
        let (_, body) = rpc(&app, "ethereum", "eth_getBlockByNumber", json!(["0x64", false])).await;
        assert_eq!(body["result"]["number"], "0x64", "{body}");
        assert_eq!(body["result"]["hash"], hash(0x64));
    }
    fetch.assert_async().await;
}

/// Upstream that serves one of two branches above block 10.
struct Forked {
    cacher: Cacher,
    reorged: Arc<AtomicBool>,
    fetched: Arc<Mutex<Vec<Value>>>,
}

fn forked() -> Forked {
    let reorged = Arc::new(AtomicBool::new(false));
    let fetched: Arc<Mutex<Vec<Value>>> = Arc::default();
    let (flag, log) = (Arc::clone(&reorged), Arc::clone(&fetched));
    let upstream = FnHandler::shared(move |_, req: RpcRequest| {
        let reorged = flag.load(Ordering::SeqCst);
        log.lock().push(req.params.clone());
        async move {
            let number = req.params[0].as_str().unwrap_or_default().to_string();
            let result = match (number.as_str(), reorged) {
                ("0xa", false) => block(10, 0x0a, 0x09),
                ("0xa", true) => block(10, 0xba, 0x09),
                ("0xb", true) => block(11, 0xbb, 0xba),
                _ => Value::Null,
            };
            to_payload(&result)
        }
    });
    let store = CompoundStore::new(vec![
        ("lru", Arc::new(LruStore::new(64).unwrap()) as SharedBlockStore),
        ("origin", Arc::new(OriginStore::new(upstream.clone())) as SharedBlockStore),
    ]);
    let store: SharedBlockStore = Arc::new(Deduper::new(Arc::new(store)));
    Forked { cacher: Cacher::new(store, upstream), reorged, fetched }
}

async fn block_hash(cacher: &Cacher, number: &str) -> Value {
    let ctx = RequestCtx::new(Arc::new(ChainConfig::new("ethereum", 1, 12.0)));
    let req = RpcRequest::new("eth_getBlockByNumber", json!([number, false]));
    let payload = cacher.serve(&ctx, req).await.unwrap();
    let block: Value = serde_json::from_str(payload.get()).unwrap();
    block["hash"].clone()
}

#[tokio::test]
async fn test_reorg_purges_stale_branch() {
    let f = forked();
    assert_eq!(block_hash(&f.cacher, "0xa").await, json!(hash(0x0a)));
    assert_eq!(block_hash(&f.cacher, "0xa").await, json!(hash(0x0a)));
    assert_eq!(f.fetched.lock().len(), 1);

    // block 11 of the new branch does not build on the cached block 10
    f.reorged.store(true, Ordering::SeqCst);
    assert_eq!(block_hash(&f.cacher, "0xb").await, json!(hash(0xbb)));

    assert_eq!(block_hash(&f.cacher, "0xa").await, json!(hash(0xba)));
    assert_eq!(f.fetched.lock().len(), 3, "block 10 was refetched after the purge");
}
