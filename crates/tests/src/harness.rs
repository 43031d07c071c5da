//! Helpers for driving a whole runtime through the HTTP router.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use venn_core::{
    config::AppConfig,
    head::SharedHeadStore,
    runtime::{VennRuntime, VennRuntimeBuilder},
};

/// Parses `yaml` and builds a runtime, optionally over a prepared head store.
///
/// # Panics
///
/// Panics on invalid configuration.
#[must_use]
pub fn runtime(yaml: &str, heads: Option<SharedHeadStore>) -> Arc<VennRuntime> {
    let config = AppConfig::from_yaml_str(yaml).expect("valid config");
    let mut builder = VennRuntimeBuilder::new().with_config(config);
    if let Some(heads) = heads {
        builder = builder.with_head_store(heads);
    }
    Arc::new(builder.build().expect("runtime builds"))
}

/// Config for one EVM chain `ethereum` (id 1) with the given remotes block and extra chain keys.
#[must_use]
pub fn single_chain(remotes: &[(&str, String, i64)], chain_extra: &str) -> String {
    let mut yaml = String::from(
        "metrics:\n  disabled: true\nchains:\n  - name: ethereum\n    id: 1\n    \
         block_time_seconds: 12\n",
    );
    for line in chain_extra.lines().filter(|l| !l.trim().is_empty()) {
        yaml.push_str("    ");
        yaml.push_str(line.trim());
        yaml.push('\n');
    }
    yaml.push_str("    remotes:\n");
    for (name, url, priority) in remotes {
        yaml.push_str(&format!(
            "      - name: {name}\n        url: {url}\n        priority: {priority}\n"
        ));
    }
    yaml
}

/// Sends one JSON-RPC call over HTTP and returns the decoded response body.
///
/// # Panics
///
/// Panics if the router fails or the body is not JSON.
pub async fn rpc(app: &Router, chain: &str, method: &str, params: Value) -> (StatusCode, Value) {
    rpc_from(app, chain, method, params, None).await
}

/// Like [`rpc`], with an `X-Forwarded-For` client address.
///
/// # Panics
///
/// Panics if the router fails or the body is not JSON.
pub async fn rpc_from(
    app: &Router,
    chain: &str,
    method: &str,
    params: Value,
    forwarded_for: Option<&str>,
) -> (StatusCode, Value) {
    let body = json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params });
    let mut req = Request::post(format!("/{chain}")).header("content-type", "application/json");
    if let Some(ip) = forwarded_for {
        req = req.header("x-forwarded-for", ip);
    }
    let req = req.body(Body::from(body.to_string())).expect("request");
    let res = app.clone().oneshot(req).await.expect("router answers");
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.expect("body");
    (status, serde_json::from_slice(&bytes).expect("json body"))
}
