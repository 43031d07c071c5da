use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{errors::RpcError, types::Payload};

/// A server-initiated message bound for one client connection.
#[derive(Debug)]
pub struct Notification {
    /// e.g. `eth_subscription`
    pub method: String,
    pub subscription: String,
    pub result: Payload,
}

/// Delivery side of a client connection that can receive subscription messages.
///
/// Each live subscription holds a cancellation token registered under its id; the connection
/// cancels it on `*_unsubscribe` or when the socket closes.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
    subscriptions: Arc<DashMap<String, CancellationToken>>,
    closed: CancellationToken,
}

impl Notifier {
    /// Creates a notifier and the receiver the transport drains.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let notifier = Self {
            tx,
            subscriptions: Arc::new(DashMap::new()),
            closed: CancellationToken::new(),
        };
        (notifier, rx)
    }

    /// Registers a new subscription for a `{namespace}_subscribe` call.
    #[must_use]
    pub fn subscribe(&self, subscribe_method: &str) -> Subscription {
        let namespace = subscribe_method.split('_').next().unwrap_or("eth");
        let id = format!("0x{:032x}", rand::random::<u128>());
        let token = self.closed.child_token();
        self.subscriptions.insert(id.clone(), token.clone());
        Subscription {
            id,
            method: format!("{namespace}_subscription"),
            token,
            tx: self.tx.clone(),
            subscriptions: Arc::clone(&self.subscriptions),
        }
    }

    /// Cancels the subscription with `id`. Returns false if no such subscription is live.
    pub fn unsubscribe(&self, id: &str) -> bool {
        match self.subscriptions.remove(id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.subscriptions.len()
    }

    /// Cancels every subscription on this connection.
    pub fn close(&self) {
        self.closed.cancel();
        self.subscriptions.clear();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}

/// A live subscription. Dropping it unregisters the id.
pub struct Subscription {
    id: String,
    method: String,
    token: CancellationToken,
    tx: mpsc::Sender<Notification>,
    subscriptions: Arc<DashMap<String, CancellationToken>>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the client unsubscribes or disconnects.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Sends one result to the client.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] if the subscription or its connection is gone.
    pub async fn notify(&self, result: Payload) -> Result<(), RpcError> {
        if self.token.is_cancelled() {
            return Err(RpcError::Closed);
        }
        let notification =
            Notification { method: self.method.clone(), subscription: self.id.clone(), result };
        tokio::select! {
            () = self.token.cancelled() => Err(RpcError::Closed),
            res = self.tx.send(notification) => res.map_err(|_| RpcError::Closed),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.subscriptions.remove(&self.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).field("method", &self.method).finish()
    }
}
