use std::{future::Future, net::IpAddr, sync::Arc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::Notifier;
use crate::{config::ChainConfig, errors::RpcError};

/// Per-request context threaded through every stage.
///
/// Cloning is cheap; a clone shares the cancellation token, so cancelling any copy cancels the
/// request.
#[derive(Clone)]
pub struct RequestCtx {
    pub chain: Arc<ChainConfig>,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
    /// Set on calls the proxy issues to itself (probes, stalker, forger, subscriptions).
    pub internal: bool,
    pub notifier: Option<Notifier>,
    pub peer: Option<IpAddr>,
}

impl RequestCtx {
    #[must_use]
    pub fn new(chain: Arc<ChainConfig>) -> Self {
        Self {
            chain,
            cancel: CancellationToken::new(),
            deadline: None,
            internal: false,
            notifier: None,
            peer: None,
        }
    }

    /// Context for a background task; cancelled together with `parent`.
    #[must_use]
    pub fn background(chain: Arc<ChainConfig>, parent: &CancellationToken) -> Self {
        Self { cancel: parent.child_token(), internal: true, ..Self::new(chain) }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn with_peer(mut self, peer: Option<IpAddr>) -> Self {
        self.peer = peer;
        self
    }

    /// Returns a copy whose token is a child of this one.
    #[must_use]
    pub fn child(&self) -> Self {
        Self { cancel: self.cancel.child_token(), ..self.clone() }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Runs `fut` until it finishes, the request is cancelled, or its deadline passes.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Cancelled`] or [`RpcError::DeadlineExceeded`] when the request ends
    /// first; otherwise whatever `fut` returns.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, RpcError>
    where
        F: Future<Output = Result<T, RpcError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(RpcError::Cancelled);
        }
        match self.deadline {
            Some(deadline) => tokio::select! {
                () = self.cancel.cancelled() => Err(RpcError::Cancelled),
                res = tokio::time::timeout_at(deadline, fut) => {
                    res.unwrap_or(Err(RpcError::DeadlineExceeded))
                }
            },
            None => tokio::select! {
                () = self.cancel.cancelled() => Err(RpcError::Cancelled),
                res = fut => res,
            },
        }
    }

    /// Sleeps for `duration` unless the request ends first.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Cancelled`] if cancelled during the sleep.
    pub async fn sleep(&self, duration: std::time::Duration) -> Result<(), RpcError> {
        tokio::select! {
            () = self.cancel.cancelled() => Err(RpcError::Cancelled),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

impl std::fmt::Debug for RequestCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCtx")
            .field("chain", &self.chain.name)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("deadline", &self.deadline)
            .field("internal", &self.internal)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}
