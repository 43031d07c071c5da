use async_trait::async_trait;
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use super::{
    http_client::{HttpClient, HttpClientConfig},
    websocket::{websocket_url, SocketPool, UpstreamSubscription},
};
use crate::{
    config::RemoteConfig,
    errors::RpcError,
    handler::{Handler, RequestCtx, Subscription},
    types::{to_payload, Payload, RpcRequest},
};

/// Pause between attempts to re-establish a dropped upstream subscription.
const RESUBSCRIBE_PAUSE: Duration = Duration::from_secs(1);

enum Unary {
    Http(HttpClient),
    Socket,
}

/// The innermost stage of every remote: speaks JSON-RPC to one upstream URL.
///
/// Unary calls go over HTTP for `http(s)` remotes and over the socket pool for `ws(s)`
/// remotes. `*_subscribe` always goes over the socket pool.
pub struct ConnectionProxy {
    remote: String,
    unary: Unary,
    sockets: Arc<SocketPool>,
    closed: CancellationToken,
}

impl ConnectionProxy {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built from the remote's headers.
    pub fn new(remote: &RemoteConfig) -> Result<Self, RpcError> {
        let unary = if remote.url.starts_with("ws") {
            Unary::Socket
        } else {
            Unary::Http(HttpClient::new(&remote.url, &remote.headers, HttpClientConfig::default())?)
        };
        let sockets = SocketPool::new(
            websocket_url(&remote.url),
            remote.headers.clone(),
            SocketPool::DEFAULT_SIZE,
        );
        Ok(Self {
            remote: remote.name.clone(),
            unary,
            sockets: Arc::new(sockets),
            closed: CancellationToken::new(),
        })
    }

    async fn unary(&self, req: &RpcRequest) -> Result<Payload, RpcError> {
        match &self.unary {
            Unary::Http(client) => client.request(&req.method, &req.params).await,
            Unary::Socket => {
                self.sockets.get().await?.request(&req.method, req.params.clone()).await
            }
        }
    }

    async fn open(
        sockets: &SocketPool,
        namespace: &str,
        params: &Value,
    ) -> Result<UpstreamSubscription, RpcError> {
        sockets.get().await?.subscribe(namespace, params.clone()).await
    }

    async fn subscribe(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        let notifier = ctx.notifier.as_ref().ok_or(RpcError::NotificationsUnsupported)?;
        let namespace = req.method.trim_end_matches("_subscribe").to_string();

        let upstream = ctx.run(Self::open(&self.sockets, &namespace, &req.params)).await?;
        let local = notifier.subscribe(&req.method);
        let id = to_payload(local.id())?;

        tokio::spawn(bridge(
            Arc::clone(&self.sockets),
            self.closed.clone(),
            self.remote.clone(),
            namespace,
            req.params,
            upstream,
            local,
        ));
        Ok(id)
    }
}

/// Relays upstream notifications to the client subscription, resubscribing after upstream
/// failures until the client goes away.
async fn bridge(
    sockets: Arc<SocketPool>,
    closed: CancellationToken,
    remote: String,
    namespace: String,
    params: Value,
    first: UpstreamSubscription,
    local: Subscription,
) {
    let mut upstream = Some(first);
    loop {
        let mut current = match upstream.take() {
            Some(sub) => sub,
            None => {
                tokio::select! {
                    () = local.cancelled() => return,
                    () = closed.cancelled() => return,
                    () = tokio::time::sleep(RESUBSCRIBE_PAUSE) => {}
                }
                match ConnectionProxy::open(&sockets, &namespace, &params).await {
                    Ok(sub) => sub,
                    Err(e) => {
                        tracing::debug!(remote = %remote, error = %e, "resubscribe failed");
                        continue;
                    }
                }
            }
        };

        loop {
            let next = tokio::select! {
                () = local.cancelled() => None,
                () = closed.cancelled() => None,
                next = current.next() => Some(next),
            };
            match next {
                None => {
                    current.unsubscribe().await;
                    return;
                }
                Some(Some(result)) => {
                    if local.notify(result).await.is_err() {
                        current.unsubscribe().await;
                        return;
                    }
                }
                Some(None) => {
                    tracing::debug!(
                        remote = %remote,
                        subscription = %local.id(),
                        "upstream subscription dropped, retrying"
                    );
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl Handler for ConnectionProxy {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        if self.closed.is_cancelled() {
            return Err(RpcError::Closed);
        }
        if req.is_subscribe() {
            return self.subscribe(ctx, req).await;
        }
        ctx.run(self.unary(&req)).await
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.closed.cancel();
        self.sockets.close().await;
        Ok(())
    }
}
