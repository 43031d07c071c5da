//! Head-driven `eth_subscribe` for `newHeads` and `logs`.
//!
//! Subscriptions are served from the head store instead of upstream sockets: every head event
//! fetches the blocks (or logs) between the last delivered head and the new one through the
//! chain pipeline, so they benefit from the cache and from failover. Other subscription kinds
//! are relayed upstream.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ChainConfig,
    errors::RpcError,
    handler::{Handler, RequestCtx, SharedHandler, Subscription},
    head::{HeadWatch, SharedHeadStore},
    types::{is_null, to_payload, Payload, RpcRequest},
    utils::{array_items, remove_member, to_hex},
};

enum Feed {
    NewHeads,
    Logs(Map<String, Value>),
}

/// Serves `newHeads` and `logs` subscriptions for one chain pipeline.
pub struct Subcenter {
    heads: SharedHeadStore,
    next: SharedHandler,
}

impl Subcenter {
    #[must_use]
    pub fn new(heads: SharedHeadStore, next: SharedHandler) -> Self {
        Self { heads, next }
    }

    /// Logs every head change of `chain` until `shutdown`.
    pub async fn track(&self, chain: Arc<ChainConfig>, shutdown: CancellationToken) {
        let mut watch = self.heads.on(&chain);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                head = watch.next() => match head {
                    Some(number) => tracing::info!(chain = %chain.name, number, "HEAD"),
                    None => return,
                },
            }
        }
    }

    fn feed(params: &[Value]) -> Result<Option<Feed>, RpcError> {
        let Some(kind) = params.first() else {
            return Err(RpcError::InvalidParams("expected at least one param".to_string()));
        };
        let kind = kind
            .as_str()
            .ok_or_else(|| RpcError::InvalidParams("subscription name must be a string".into()))?;
        match kind {
            "newHeads" => Ok(Some(Feed::NewHeads)),
            "logs" => match &params[1..] {
                [Value::Object(filter)] => {
                    let mut kept = Map::new();
                    for key in ["address", "topics"] {
                        if let Some(v) = filter.get(key).filter(|v| !v.is_null()) {
                            kept.insert(key.to_string(), v.clone());
                        }
                    }
                    Ok(Some(Feed::Logs(kept)))
                }
                [] => Ok(Some(Feed::Logs(Map::new()))),
                [_] => Err(RpcError::InvalidParams("expected filter object".to_string())),
                _ => Err(RpcError::InvalidParams("expected 1 parameter".to_string())),
            },
            _ => Ok(None),
        }
    }

    async fn subscribe(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        let notifier = ctx.notifier.as_ref().ok_or(RpcError::NotificationsUnsupported)?;
        let Some(feed) = Self::feed(req.positional()?)? else {
            return self.next.serve(ctx, req).await;
        };

        // watch before reading so no head between the two is lost
        let watch = self.heads.on(&ctx.chain);
        let current = self.heads.get(&ctx.chain).await?;

        let sub = notifier.subscribe(&req.method);
        let id = to_payload(sub.id())?;
        let stream = Stream {
            ctx: RequestCtx::background(Arc::clone(&ctx.chain), sub.token()),
            next: Arc::clone(&self.next),
            sub,
            watch,
            current,
        };
        match feed {
            Feed::NewHeads => tokio::spawn(stream.new_heads()),
            Feed::Logs(filter) => tokio::spawn(stream.logs(filter)),
        };
        Ok(id)
    }
}

/// One live subscription's delivery loop.
struct Stream {
    ctx: RequestCtx,
    next: SharedHandler,
    sub: Subscription,
    watch: HeadWatch,
    current: u64,
}

impl Stream {
    /// Next head to deliver up to, or `None` once the subscription or the store is gone.
    async fn advance(&mut self) -> Option<(u64, u64)> {
        loop {
            let head = tokio::select! {
                () = self.sub.cancelled() => return None,
                head = self.watch.next() => head?,
            };
            if head <= self.current {
                continue;
            }
            // nothing delivered yet: start at the new head rather than at genesis
            let from = if self.current == 0 { head } else { self.current + 1 };
            self.current = head;
            return Some((from, head));
        }
    }

    async fn new_heads(mut self) {
        let chain = Arc::clone(&self.ctx.chain);
        while let Some((from, to)) = self.advance().await {
            for n in from..=to {
                let req = RpcRequest::new("eth_getBlockByNumber", json!([to_hex(n), false]));
                let block = match self.next.serve(&self.ctx, req).await {
                    Ok(block) if !is_null(&block) => block,
                    Ok(_) => {
                        tracing::warn!(chain = %chain.name, number = n, "block not found");
                        continue;
                    }
                    Err(e) => {
                        tracing::error!(
                            chain = %chain.name, number = n, error = %e, "failed to get block"
                        );
                        continue;
                    }
                };
                let header = match remove_member(&block, "transactions") {
                    Ok(header) => header,
                    Err(e) => {
                        tracing::error!(
                            chain = %chain.name, error = %e, "failed to remove transactions"
                        );
                        continue;
                    }
                };
                if let Err(e) = self.sub.notify(header).await {
                    tracing::debug!(subscription = %self.sub.id(), error = %e, "failed to notify");
                    break;
                }
            }
        }
        tracing::debug!(subscription = %self.sub.id(), "newHeads subscription closed");
    }

    async fn logs(mut self, filter: Map<String, Value>) {
        let chain = Arc::clone(&self.ctx.chain);
        while let Some((from, to)) = self.advance().await {
            let mut query = filter.clone();
            query.insert("fromBlock".to_string(), json!(to_hex(from)));
            query.insert("toBlock".to_string(), json!(to_hex(to)));

            let req = RpcRequest::new("eth_getLogs", json!([query]));
            let logs = match self.next.serve(&self.ctx, req).await {
                Ok(logs) => logs,
                Err(e) => {
                    tracing::error!(
                        chain = %chain.name, from, to, error = %e, "failed to get logs"
                    );
                    continue;
                }
            };
            if is_null(&logs) {
                continue;
            }
            let items = match array_items(&logs) {
                Ok(items) => items,
                Err(e) => {
                    tracing::error!(chain = %chain.name, error = %e, "failed to decode logs");
                    continue;
                }
            };
            for log in items {
                if let Err(e) = self.sub.notify(log.to_owned()).await {
                    tracing::debug!(subscription = %self.sub.id(), error = %e, "failed to notify");
                    break;
                }
            }
        }
        tracing::debug!(subscription = %self.sub.id(), "logs subscription closed");
    }
}

#[async_trait]
impl Handler for Subcenter {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        if req.method == "eth_subscribe" {
            return self.subscribe(ctx, req).await;
        }
        self.next.serve(ctx, req).await
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.next.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handler::{FnHandler, Notifier},
        head::{AtomicHeadStore, HeadStore},
    };
    use parking_lot::Mutex;
    use std::time::Duration;

    fn chain() -> Arc<ChainConfig> {
        Arc::new(ChainConfig::new("test", 1, 1.0))
    }

    type Calls = Arc<Mutex<Vec<Value>>>;

    fn upstream(calls: Calls) -> SharedHandler {
        FnHandler::shared(move |_, req: RpcRequest| {
            calls.lock().push(json!([req.method, req.params]));
            async move {
                let result = match req.method.as_str() {
                    "eth_getBlockByNumber" => json!({
                        "number": req.params[0],
                        "transactions": ["0x01"],
                        "hash": "0xaa"
                    }),
                    "eth_getLogs" => json!([{ "logIndex": "0x0" }, { "logIndex": "0x1" }]),
                    _ => json!("upstream"),
                };
                to_payload(&result)
            }
        })
    }

    async fn recv(rx: &mut tokio::sync::mpsc::Receiver<crate::handler::Notification>) -> Value {
        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        serde_json::from_str(msg.result.get()).unwrap()
    }

    #[tokio::test]
    async fn test_new_heads_fills_gaps_without_transactions() {
        let heads = Arc::new(AtomicHeadStore::new());
        let chain = chain();
        heads.put(&chain, 10).await.unwrap();
        let calls = Calls::default();
        let center = Subcenter::new(heads.clone(), upstream(calls.clone()));

        let (notifier, mut rx) = Notifier::channel(16);
        let ctx = RequestCtx::new(Arc::clone(&chain)).with_notifier(notifier.clone());
        let id = center
            .serve(&ctx, RpcRequest::new("eth_subscribe", json!(["newHeads"])))
            .await
            .unwrap();
        assert!(id.get().starts_with("\"0x"));

        heads.put(&chain, 12).await.unwrap();
        let first = recv(&mut rx).await;
        let second = recv(&mut rx).await;
        assert_eq!(first["number"], json!("0xb"));
        assert_eq!(second["number"], json!("0xc"));
        assert!(first.get("transactions").is_none());
        assert_eq!(first["hash"], json!("0xaa"));

        notifier.close();
    }

    #[tokio::test]
    async fn test_logs_subscription_queries_range() {
        let heads = Arc::new(AtomicHeadStore::new());
        let chain = chain();
        heads.put(&chain, 5).await.unwrap();
        let calls = Calls::default();
        let center = Subcenter::new(heads.clone(), upstream(calls.clone()));

        let (notifier, mut rx) = Notifier::channel(16);
        let ctx = RequestCtx::new(Arc::clone(&chain)).with_notifier(notifier.clone());
        let filter = json!(["logs", { "address": "0x01", "fromBlock": "0x0" }]);
        center.serve(&ctx, RpcRequest::new("eth_subscribe", filter)).await.unwrap();

        heads.put(&chain, 7).await.unwrap();
        assert_eq!(recv(&mut rx).await["logIndex"], json!("0x0"));
        assert_eq!(recv(&mut rx).await["logIndex"], json!("0x1"));

        let calls = calls.lock().clone();
        assert_eq!(
            calls[0],
            json!(["eth_getLogs", [{ "address": "0x01", "fromBlock": "0x6", "toBlock": "0x7" }]])
        );
        notifier.close();
    }

    #[tokio::test]
    async fn test_subscribe_validation() {
        let heads = Arc::new(AtomicHeadStore::new());
        let center = Subcenter::new(heads, upstream(Calls::default()));
        let plain = RequestCtx::new(chain());
        let res = center.serve(&plain, RpcRequest::new("eth_subscribe", json!(["newHeads"]))).await;
        assert!(matches!(res, Err(RpcError::NotificationsUnsupported)));

        let (notifier, _rx) = Notifier::channel(1);
        let ctx = plain.with_notifier(notifier);
        let res = center.serve(&ctx, RpcRequest::new("eth_subscribe", json!([]))).await;
        assert!(matches!(res, Err(RpcError::InvalidParams(_))));
        let extra = RpcRequest::new("eth_subscribe", json!(["logs", {}, 1]));
        let res = center.serve(&ctx, extra).await;
        assert!(matches!(res, Err(RpcError::InvalidParams(m)) if m == "expected 1 parameter"));

        let relayed = center
            .serve(&ctx, RpcRequest::new("eth_subscribe", json!(["newPendingTransactions"])))
            .await
            .unwrap();
        assert_eq!(relayed.get(), r#""upstream""#);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let heads = Arc::new(AtomicHeadStore::new());
        let chain = chain();
        heads.put(&chain, 1).await.unwrap();
        let calls = Calls::default();
        let center = Subcenter::new(heads.clone(), upstream(calls.clone()));
        let (notifier, mut rx) = Notifier::channel(16);
        let ctx = RequestCtx::new(Arc::clone(&chain)).with_notifier(notifier.clone());
        let id = center
            .serve(&ctx, RpcRequest::new("eth_subscribe", json!(["newHeads"])))
            .await
            .unwrap();
        let id: String = serde_json::from_str(id.get()).unwrap();

        assert!(notifier.unsubscribe(&id));
        tokio::time::sleep(Duration::from_millis(20)).await;
        heads.put(&chain, 2).await.unwrap();
        let nothing = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(!matches!(nothing, Ok(Some(_))));
        assert!(calls.lock().is_empty());
    }
}
