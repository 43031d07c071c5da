//! Multiplexed JSON-RPC over WebSocket and the small connection pool used for subscriptions.
//!
//! A [`WsClient`] owns one socket. A writer task drains an outbound queue and a reader task
//! routes responses to pending calls by id and notifications to subscriptions by
//! subscription id. Subscription channels are registered by the reader itself when the
//! subscribe response arrives, so no notification that follows the response is lost.

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{value::RawValue, Value};
use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::{HeaderName, HeaderValue},
    Message,
};
use tokio_util::sync::CancellationToken;

use crate::{
    errors::RpcError,
    types::{JsonRpcRequest, JsonRpcResponse, Payload},
};

/// Buffered notifications per upstream subscription before new ones are dropped.
const SUBSCRIPTION_BUFFER: usize = 256;

enum Pending {
    Call(oneshot::Sender<Result<Payload, RpcError>>),
    Subscribe {
        reply: oneshot::Sender<Result<String, RpcError>>,
        sink: mpsc::Sender<Payload>,
    },
}

#[derive(Deserialize)]
struct Probe<'a> {
    #[serde(default, borrow)]
    method: Option<Cow<'a, str>>,
}

#[derive(Deserialize)]
struct IncomingNotification<'a> {
    #[serde(borrow)]
    params: NotificationParams<'a>,
}

#[derive(Deserialize)]
struct NotificationParams<'a> {
    #[serde(borrow)]
    subscription: Cow<'a, str>,
    #[serde(borrow)]
    result: &'a RawValue,
}

pub struct WsClient {
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<DashMap<u64, Pending>>,
    subscriptions: Arc<DashMap<String, mpsc::Sender<Payload>>>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl WsClient {
    /// Dials `url` and starts the reader and writer tasks.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Transport`] when the handshake fails or times out.
    pub async fn connect(
        url: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Arc<Self>, RpcError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| RpcError::Transport(format!("invalid websocket url: {e}")))?;
        for (key, value) in headers {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| RpcError::Internal(format!("invalid header name {key}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| RpcError::Internal(format!("invalid header value for {key}: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| RpcError::Transport("websocket handshake timed out".to_string()))?
            .map_err(|e| RpcError::Transport(format!("websocket connection failed: {e}")))?;

        let (mut write, mut read) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let client = Arc::new(Self {
            outbound,
            pending: Arc::new(DashMap::new()),
            subscriptions: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        });

        let closed = client.closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = closed.cancelled() => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                    msg = outbound_rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = write.send(msg).await {
                            tracing::debug!(error = %e, "websocket write failed");
                            closed.cancel();
                            break;
                        }
                    }
                }
            }
        });

        let closed = client.closed.clone();
        let pending = Arc::clone(&client.pending);
        let subscriptions = Arc::clone(&client.subscriptions);
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    () = closed.cancelled() => break,
                    msg = read.next() => msg,
                };
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(text.as_str(), &pending, &subscriptions);
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        if let Ok(text) = std::str::from_utf8(&bytes) {
                            dispatch(text, &pending, &subscriptions);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "websocket read failed");
                        break;
                    }
                }
            }
            closed.cancel();
            let ids: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
            for id in ids {
                if let Some((_, waiter)) = pending.remove(&id) {
                    match waiter {
                        Pending::Call(tx) => {
                            let _ = tx.send(Err(RpcError::Closed));
                        }
                        Pending::Subscribe { reply, .. } => {
                            let _ = reply.send(Err(RpcError::Closed));
                        }
                    }
                }
            }
            subscriptions.clear();
        });

        Ok(client)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    fn send(&self, id: u64, method: &str, params: Value) -> Result<(), RpcError> {
        let params = if params.is_null() { None } else { Some(params) };
        let text = serde_json::to_string(&JsonRpcRequest::new(method, params, Value::from(id)))
            .map_err(|e| RpcError::Internal(format!("failed to encode request: {e}")))?;
        self.outbound.send(Message::Text(text.into())).map_err(|_| RpcError::Closed)
    }

    /// Issues one call and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns the remote's error object, or [`RpcError::Closed`] if the socket drops.
    pub async fn request(&self, method: &str, params: Value) -> Result<Payload, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Pending::Call(tx));
        if let Err(e) = self.send(id, method, params) {
            self.pending.remove(&id);
            return Err(e);
        }
        let result = rx.await.unwrap_or(Err(RpcError::Closed));
        self.pending.remove(&id);
        result
    }

    /// Opens `{namespace}_subscribe(params)` and returns the stream of results.
    ///
    /// # Errors
    ///
    /// Returns the remote's error object, or [`RpcError::Closed`] if the socket drops.
    pub async fn subscribe(
        self: &Arc<Self>,
        namespace: &str,
        params: Value,
    ) -> Result<UpstreamSubscription, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, reply_rx) = oneshot::channel();
        let (sink, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.pending.insert(id, Pending::Subscribe { reply, sink });
        if let Err(e) = self.send(id, &format!("{namespace}_subscribe"), params) {
            self.pending.remove(&id);
            return Err(e);
        }
        let sub_id = reply_rx.await.unwrap_or(Err(RpcError::Closed))?;
        Ok(UpstreamSubscription {
            id: sub_id,
            namespace: namespace.to_string(),
            rx,
            client: Arc::clone(self),
        })
    }

    /// Resolves when the socket is gone.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

fn dispatch(
    text: &str,
    pending: &DashMap<u64, Pending>,
    subscriptions: &DashMap<String, mpsc::Sender<Payload>>,
) {
    let Ok(probe) = serde_json::from_str::<Probe<'_>>(text) else {
        tracing::debug!("ignoring non-object websocket frame");
        return;
    };

    if probe.method.is_some() {
        let Ok(note) = serde_json::from_str::<IncomingNotification<'_>>(text) else {
            return;
        };
        let sink = subscriptions.get(note.params.subscription.as_ref()).map(|s| s.value().clone());
        if let Some(sink) = sink {
            if sink.try_send(note.params.result.to_owned()).is_err() {
                tracing::warn!(
                    subscription = %note.params.subscription,
                    "subscription consumer lagging, dropping notification"
                );
            }
        }
        return;
    }

    let Ok(response) = serde_json::from_str::<JsonRpcResponse>(text) else {
        return;
    };
    let Some(id) = response.id.as_u64() else {
        return;
    };
    let Some((_, waiter)) = pending.remove(&id) else {
        return;
    };
    match waiter {
        Pending::Call(tx) => {
            let _ = tx.send(response.into_outcome());
        }
        Pending::Subscribe { reply, sink } => {
            let outcome = response.into_outcome().and_then(|payload| {
                serde_json::from_str::<String>(payload.get())
                    .map_err(|_| RpcError::Transport("subscription id is not a string".into()))
            });
            if let Ok(sub_id) = &outcome {
                subscriptions.insert(sub_id.clone(), sink);
            }
            let _ = reply.send(outcome);
        }
    }
}

/// An open subscription on an upstream socket.
pub struct UpstreamSubscription {
    id: String,
    namespace: String,
    rx: mpsc::Receiver<Payload>,
    client: Arc<WsClient>,
}

impl UpstreamSubscription {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next notification; `None` once the socket is gone.
    pub async fn next(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    /// Sends `{namespace}_unsubscribe` best-effort and drops the channel.
    pub async fn unsubscribe(self) {
        self.client.subscriptions.remove(&self.id);
        if self.client.is_closed() {
            return;
        }
        let method = format!("{}_unsubscribe", self.namespace);
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            self.client.request(&method, Value::Array(vec![Value::String(self.id.clone())])),
        )
        .await;
        if !matches!(res, Ok(Ok(_))) {
            tracing::debug!(subscription = %self.id, "upstream unsubscribe did not complete");
        }
    }
}

/// Round-robin pool of sockets, redialed lazily when a slot's socket has closed.
pub struct SocketPool {
    url: String,
    headers: HashMap<String, String>,
    dial_timeout: Duration,
    slots: Mutex<PoolSlots>,
}

struct PoolSlots {
    conns: Vec<Option<Arc<WsClient>>>,
    next: usize,
}

impl SocketPool {
    pub const DEFAULT_SIZE: usize = 8;

    #[must_use]
    pub fn new(url: String, headers: HashMap<String, String>, size: usize) -> Self {
        Self {
            url,
            headers,
            dial_timeout: Duration::from_secs(15),
            slots: Mutex::new(PoolSlots { conns: vec![None; size.max(1)], next: 0 }),
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Dispenses the next socket, dialing it if the slot is empty or closed.
    ///
    /// # Errors
    ///
    /// Returns the dial error.
    pub async fn get(&self) -> Result<Arc<WsClient>, RpcError> {
        let mut slots = self.slots.lock().await;
        if slots.next >= slots.conns.len() {
            slots.next = 0;
        }
        let idx = slots.next;
        slots.next += 1;

        if let Some(conn) = &slots.conns[idx] {
            if !conn.is_closed() {
                return Ok(Arc::clone(conn));
            }
        }
        let conn = WsClient::connect(&self.url, &self.headers, self.dial_timeout).await?;
        slots.conns[idx] = Some(Arc::clone(&conn));
        Ok(conn)
    }

    pub async fn close(&self) {
        let mut slots = self.slots.lock().await;
        for conn in slots.conns.iter_mut().filter_map(Option::take) {
            conn.close();
        }
    }
}

/// Derives the socket URL for an http(s) remote by swapping the scheme prefix.
#[must_use]
pub fn websocket_url(url: &str) -> String {
    if url.starts_with("ws") {
        return url.to_string();
    }
    url.replacen("http", "ws", 1)
}
