//! Mock EVM upstreams built on mockito.

use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Zero-padded 32-byte hash made of one repeated byte.
#[must_use]
pub fn hash(byte: u8) -> String {
    format!("0x{}", format!("{byte:02x}").repeat(32))
}

/// Header-shaped block with the given hash bytes.
#[must_use]
pub fn block(number: u64, hash_byte: u8, parent_byte: u8) -> Value {
    json!({
        "number": format!("0x{number:x}"),
        "hash": hash(hash_byte),
        "parentHash": hash(parent_byte),
        "timestamp": format!("0x{:x}", unix_now()),
        "transactions": [hash(0xa1)],
    })
}

#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

fn envelope(result: &Value) -> String {
    json!({ "jsonrpc": "2.0", "id": 1, "result": result }).to_string()
}

/// A mockito server answering EVM JSON-RPC calls.
pub struct RpcMockBuilder {
    server: ServerGuard,
    mocks: Vec<Mock>,
}

impl RpcMockBuilder {
    pub async fn new() -> Self {
        Self { server: Server::new_async().await, mocks: Vec::new() }
    }

    #[must_use]
    pub fn url(&self) -> String {
        self.server.url()
    }

    /// Answers the health probe and head polls: a fresh `latest` block at `head`, with or
    /// without transaction details, and `eth_chainId`.
    pub async fn mock_healthy(&mut self, chain_id: u64, head: u64) -> &mut Self {
        let latest = block(head, 0xee, 0xed);
        for details in [false, true] {
            let mock = self
                .server
                .mock("POST", "/")
                .match_body(Matcher::PartialJson(
                    json!({ "method": "eth_getBlockByNumber", "params": ["latest", details] }),
                ))
                .with_header("content-type", "application/json")
                .with_body(envelope(&latest))
                .create_async()
                .await;
            self.mocks.push(mock);
        }
        self.mock_method("eth_chainId", &json!(format!("0x{chain_id:x}"))).await
    }

    /// Answers every call to `method` with `result`.
    pub async fn mock_method(&mut self, method: &str, result: &Value) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({ "method": method })))
            .with_header("content-type", "application/json")
            .with_body(envelope(result))
            .create_async()
            .await;
        self.mocks.push(mock);
        self
    }

    /// Answers `method`, restricted to `params` unless they are null, expecting `hits` calls.
    pub async fn expect_call(
        &mut self,
        method: &str,
        params: Value,
        result: &Value,
        hits: usize,
    ) -> Mock {
        let matcher = if params.is_null() {
            json!({ "method": method })
        } else {
            json!({ "method": method, "params": params })
        };
        self.server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(matcher))
            .with_header("content-type", "application/json")
            .with_body(envelope(result))
            .expect(hits)
            .create_async()
            .await
    }

    /// Answers `method` with a JSON-RPC error object.
    pub async fn mock_rpc_error(&mut self, method: &str, code: i32, message: &str) -> &mut Self {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": code, "message": message }
        });
        let mock = self
            .server
            .mock("POST", "/")
            .match_body(Matcher::PartialJson(json!({ "method": method })))
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;
        self.mocks.push(mock);
        self
    }

    /// Fails every request with http 500.
    pub async fn mock_server_error(&mut self) -> &mut Self {
        let mock = self
            .server
            .mock("POST", "/")
            .with_status(500)
            .with_body("Internal Server Error")
            .create_async()
            .await;
        self.mocks.push(mock);
        self
    }
}
