//! WebSocket sessions.
//!
//! One writer task owns the sink and interleaves responses with subscription notifications.
//! Each inbound frame is handled on its own task so a slow call never blocks the reader.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::{net::IpAddr, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use venn_core::{
    errors::{RpcError, PARSE_ERROR},
    handler::{Notification, Notifier},
    runtime::ChainPipeline,
    types::{to_payload, JsonRpcResponse, Payload, RpcRequest, SubscriptionNotification},
};

use crate::router::{dispatch, Dispatched};

/// Queued notifications per connection before subscription streams apply backpressure.
const NOTIFICATION_BUFFER: usize = 256;
const OUTBOUND_BUFFER: usize = 64;

/// Answers `*_unsubscribe` from the connection's own registry.
pub(crate) fn unsubscribe(notifier: &Notifier, req: &RpcRequest) -> Result<Payload, RpcError> {
    let id = req
        .positional()?
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::InvalidParams("expected subscription id".to_string()))?;
    to_payload(&notifier.unsubscribe(id))
}

fn frame(notification: &Notification) -> Option<Message> {
    let message = SubscriptionNotification::new(
        &notification.method,
        &notification.subscription,
        &notification.result,
    );
    match serde_json::to_string(&message) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode notification");
            None
        }
    }
}

async fn respond(
    pipeline: Arc<ChainPipeline>,
    text: String,
    peer: Option<IpAddr>,
    notifier: Notifier,
    out: mpsc::Sender<Message>,
) {
    let encoded = match serde_json::from_str::<Value>(&text) {
        Ok(payload) => match dispatch(&pipeline, payload, peer, Some(&notifier)).await {
            Dispatched::Single(response) => serde_json::to_string(&response),
            Dispatched::Batch(responses) => serde_json::to_string(&responses),
        },
        Err(e) => serde_json::to_string(&JsonRpcResponse::error(
            PARSE_ERROR,
            format!("Parse error: {e}"),
            Arc::new(Value::Null),
        )),
    };
    match encoded {
        Ok(text) => {
            let _ = out.send(Message::Text(text)).await;
        }
        Err(e) => tracing::error!(error = %e, "failed to encode response"),
    }
}

/// Runs one client connection until it closes or `shutdown` fires.
pub async fn serve_socket(
    socket: WebSocket,
    pipeline: Arc<ChainPipeline>,
    peer: Option<IpAddr>,
    shutdown: CancellationToken,
) {
    let chain = pipeline.chain().name.clone();
    let (mut sink, mut stream) = socket.split();
    let (notifier, mut notifications) = Notifier::channel(NOTIFICATION_BUFFER);
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                message = out_rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                Some(notification) = notifications.recv() => match frame(&notification) {
                    Some(message) => message,
                    None => continue,
                },
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    tracing::debug!(chain = %chain, peer = ?peer, "websocket connected");
    metrics::counter!("venn_ws_connections_total", "chain" => chain.clone()).increment(1);

    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => break,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                tokio::spawn(respond(
                    Arc::clone(&pipeline),
                    text,
                    peer,
                    notifier.clone(),
                    out_tx.clone(),
                ));
            }
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => {
                    tokio::spawn(respond(
                        Arc::clone(&pipeline),
                        text,
                        peer,
                        notifier.clone(),
                        out_tx.clone(),
                    ));
                }
                Err(_) => tracing::debug!(chain = %chain, "dropping non-utf8 binary frame"),
            },
            Some(Ok(Message::Ping(data))) => {
                let _ = out_tx.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                tracing::debug!(chain = %chain, error = %e, "websocket read failed");
                break;
            }
        }
    }

    notifier.close();
    drop(out_tx);
    let _ = writer.await;
    tracing::debug!(chain = %chain, peer = ?peer, "websocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use venn_core::types::from_payload;

    #[tokio::test]
    async fn test_unsubscribe_known_and_unknown() {
        let (notifier, _rx) = Notifier::channel(4);
        let sub = notifier.subscribe("eth_subscribe");
        let id = sub.id().to_string();

        let req = RpcRequest::new("eth_unsubscribe", json!([id]));
        let removed: bool = from_payload(&unsubscribe(&notifier, &req).unwrap()).unwrap();
        assert!(removed);
        assert!(sub.is_cancelled());

        let again: bool = from_payload(&unsubscribe(&notifier, &req).unwrap()).unwrap();
        assert!(!again);
    }

    #[test]
    fn test_unsubscribe_requires_id() {
        let (notifier, _rx) = Notifier::channel(4);
        let req = RpcRequest::new("eth_unsubscribe", json!([]));
        assert!(matches!(unsubscribe(&notifier, &req), Err(RpcError::InvalidParams(_))));
    }

    #[test]
    fn test_frame_shape() {
        let notification = Notification {
            method: "eth_subscription".into(),
            subscription: "0xabc".into(),
            result: to_payload(&json!({"number": "0x1"})).unwrap(),
        };
        let Some(Message::Text(text)) = frame(&notification) else {
            panic!("expected a text frame");
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["method"], "eth_subscription");
        assert_eq!(value["params"]["subscription"], "0xabc");
        assert_eq!(value["params"]["result"]["number"], "0x1");
    }
}
