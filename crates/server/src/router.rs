use axum::{
    body::Bytes,
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures::future::join_all;
use serde_json::Value;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};
use venn_core::{
    errors::{INVALID_REQUEST, PARSE_ERROR},
    handler::{Notifier, RequestCtx},
    runtime::{ChainPipeline, VennRuntime},
    types::{JsonRpcRequest, JsonRpcResponse},
};

use crate::{client_ip::client_ip, ws};

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    runtime: Arc<VennRuntime>,
}

impl AppState {
    #[must_use]
    pub fn new(runtime: Arc<VennRuntime>) -> Self {
        Self { runtime }
    }

    fn peer(&self, headers: &HeaderMap, connect: Option<SocketAddr>) -> Option<IpAddr> {
        client_ip(headers, connect, &self.runtime.config().security.trusted_ip_headers)
    }
}

/// `/health` plus one `/{chain}` route per name or alias: POST for JSON-RPC, GET to upgrade
/// to a WebSocket session.
pub fn create_app(runtime: Arc<VennRuntime>) -> Router {
    let cors = cors_layer(&runtime.config().security.allowed_origins);
    Router::new()
        .route("/health", get(handle_health))
        .route("/:chain", get(handle_ws).post(handle_rpc))
        .with_state(AppState::new(runtime))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(allowed: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed.is_empty() || allowed.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allowed.iter().filter_map(|o| o.parse().ok()).collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

pub async fn handle_health() -> &'static str {
    "OK"
}

/// Prometheus scrape endpoint, served on its own listener.
pub fn create_metrics_app() -> Router {
    Router::new().route("/metrics", get(handle_metrics))
}

pub async fn handle_metrics() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        venn_core::metrics::render(),
    )
        .into_response()
}

fn unknown_chain(name: &str) -> Response {
    (StatusCode::NOT_FOUND, format!("chain not found: {name}")).into_response()
}

fn resolve(state: &AppState, name: &str) -> Option<Arc<ChainPipeline>> {
    state.runtime.chains().resolve(name).cloned()
}

/// Single or batch JSON-RPC over HTTP.
pub async fn handle_rpc(
    State(state): State<AppState>,
    Path(chain): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(pipeline) = resolve(&state, &chain) else {
        return unknown_chain(&chain);
    };
    let peer = state.peer(&headers, connect.map(|c| c.0));
    metrics::counter!("venn_http_requests_total", "chain" => pipeline.chain().name.clone())
        .increment(1);

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            let message = format!("Parse error: {e}");
            let response = JsonRpcResponse::error(PARSE_ERROR, message, Arc::new(Value::Null));
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    match dispatch(&pipeline, payload, peer, None).await {
        Dispatched::Single(response) => Json(response).into_response(),
        Dispatched::Batch(responses) => Json(responses).into_response(),
    }
}

/// Upgrades to a WebSocket session bound to the chain.
pub async fn handle_ws(
    State(state): State<AppState>,
    Path(chain): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    upgrade: Option<WebSocketUpgrade>,
) -> Response {
    let Some(pipeline) = resolve(&state, &chain) else {
        return unknown_chain(&chain);
    };
    let Some(upgrade) = upgrade else {
        return (StatusCode::BAD_REQUEST, "expected a websocket upgrade").into_response();
    };
    let peer = state.peer(&headers, connect.map(|c| c.0));
    let shutdown = state.runtime.root_token().clone();
    upgrade
        .max_message_size(MAX_BODY_BYTES)
        .on_upgrade(move |socket| ws::serve_socket(socket, pipeline, peer, shutdown))
}

pub(crate) enum Dispatched {
    Single(JsonRpcResponse),
    Batch(Vec<JsonRpcResponse>),
}

/// Runs a decoded body through the chain. Batch items run concurrently and answer in order.
pub(crate) async fn dispatch(
    pipeline: &ChainPipeline,
    payload: Value,
    peer: Option<IpAddr>,
    notifier: Option<&Notifier>,
) -> Dispatched {
    match payload {
        Value::Array(items) if items.is_empty() => Dispatched::Single(JsonRpcResponse::error(
            INVALID_REQUEST,
            "empty batch".to_string(),
            Arc::new(Value::Null),
        )),
        Value::Array(items) => Dispatched::Batch(
            join_all(items.into_iter().map(|item| call(pipeline, item, peer, notifier))).await,
        ),
        item => Dispatched::Single(call(pipeline, item, peer, notifier).await),
    }
}

async fn call(
    pipeline: &ChainPipeline,
    item: Value,
    peer: Option<IpAddr>,
    notifier: Option<&Notifier>,
) -> JsonRpcResponse {
    let request: JsonRpcRequest = match serde_json::from_value(item) {
        Ok(request) => request,
        Err(e) => {
            return JsonRpcResponse::error(
                INVALID_REQUEST,
                format!("Invalid request: {e}"),
                Arc::new(Value::Null),
            )
        }
    };
    let (id, req) = request.into_rpc();

    let mut ctx = RequestCtx::new(Arc::clone(pipeline.chain())).with_peer(peer);
    if let Some(notifier) = notifier {
        if req.is_unsubscribe() {
            return JsonRpcResponse::from_outcome(ws::unsubscribe(notifier, &req), id);
        }
        ctx = ctx.with_notifier(notifier.clone());
    }

    let outcome = pipeline.handler().serve(&ctx, req).await;
    JsonRpcResponse::from_outcome(outcome, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;
    use venn_core::config::AppConfig;

    const CONFIG: &str = r"
metrics:
  disabled: true
chains:
  - name: ethereum
    id: 1
    aliases: [mainnet]
    block_time_seconds: 12
    remotes:
      - name: primary
        url: http://127.0.0.1:9
";

    fn app() -> Router {
        let config = AppConfig::from_yaml_str(CONFIG).unwrap();
        let runtime = VennRuntime::builder().with_config(config).build().unwrap();
        create_app(Arc::new(runtime))
    }

    async fn post(app: Router, uri: &str, body: &str) -> (StatusCode, Value) {
        let req = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let res = app.oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_health() {
        let res = app().oneshot(Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(res.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_chain_is_404() {
        let (status, _) = post(app(), "/polygon", r#"{"jsonrpc":"2.0","id":1,"method":"x"}"#).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_alias_serves_local_methods() {
        let body = r#"{"jsonrpc":"2.0","id":7,"method":"eth_chainId","params":[]}"#;
        let (status, json) = post(app(), "/mainnet", body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["result"], "0x1");
        assert_eq!(json["id"], 7);
    }

    #[tokio::test]
    async fn test_batch_keeps_order() {
        let body = r#"[
            {"jsonrpc":"2.0","id":1,"method":"net_version","params":[]},
            {"jsonrpc":"2.0","id":2,"method":"eth_chainId","params":[]},
            {"bogus":true}
        ]"#;
        let (_, json) = post(app(), "/ethereum", body).await;
        let items = json.as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0]["result"], "1");
        assert_eq!(items[1]["result"], "0x1");
        assert_eq!(items[2]["error"]["code"], INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_parse_error() {
        let (status, json) = post(app(), "/ethereum", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["code"], PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_subscribe_over_http_rejected() {
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"eth_subscribe","params":["newHeads"]}"#;
        let (_, json) = post(app(), "/ethereum", body).await;
        assert!(json["error"].is_object());
    }
}
