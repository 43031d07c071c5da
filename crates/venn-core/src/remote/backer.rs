use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use crate::{
    config::RemoteConfig,
    errors::{ErrorClass, RpcError},
    handler::{Handler, RequestCtx, SharedHandler},
    types::{Payload, RpcRequest},
};

#[derive(Debug)]
struct BackoffState {
    /// Traffic is held back until this instant.
    unhappy_until: Option<Instant>,
    error_timeout: Duration,
}

/// Error and rate-limit backoff for one remote.
///
/// Node errors close the remote for the current error timeout, which then doubles up to
/// `error_backoff_max`. Rate-limit errors close it for `rate_limit_backoff`. Successes and user
/// errors halve the error timeout back toward `error_backoff_min`.
pub struct Backer {
    remote: String,
    rate_limit_timeout: Duration,
    error_min: Duration,
    error_max: Duration,
    state: Mutex<BackoffState>,
    next: SharedHandler,
}

impl Backer {
    #[must_use]
    pub fn new(remote: &RemoteConfig, next: SharedHandler) -> Self {
        let error_min = remote.error_backoff_min;
        Self {
            remote: remote.name.clone(),
            rate_limit_timeout: remote.rate_limit_backoff,
            error_min,
            error_max: remote.error_backoff_max.max(error_min),
            state: Mutex::new(BackoffState { unhappy_until: None, error_timeout: error_min }),
            next,
        }
    }

    #[must_use]
    pub fn is_happy(&self) -> bool {
        let mut state = self.state.lock();
        match state.unhappy_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                state.unhappy_until = None;
                true
            }
            None => true,
        }
    }

    fn ok(&self) {
        let mut state = self.state.lock();
        if state.unhappy_until.is_some() {
            return;
        }
        state.error_timeout = (state.error_timeout / 2).max(self.error_min);
    }

    fn limit(&self) {
        let mut state = self.state.lock();
        if state.unhappy_until.is_some() {
            return;
        }
        state.unhappy_until = Some(Instant::now() + self.rate_limit_timeout);
    }

    fn error(&self) {
        let mut state = self.state.lock();
        if state.unhappy_until.is_some() {
            return;
        }
        state.unhappy_until = Some(Instant::now() + state.error_timeout);
        state.error_timeout = (state.error_timeout * 2).min(self.error_max);
    }

    #[cfg(test)]
    fn error_timeout(&self) -> Duration {
        self.state.lock().error_timeout
    }
}

#[async_trait]
impl Handler for Backer {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        if !self.is_happy() {
            return Err(RpcError::BackingOff);
        }
        let result = self.next.serve(ctx, req).await;
        match result.as_ref().map_err(RpcError::class) {
            Err(ErrorClass::RateLimit) => self.limit(),
            Err(ErrorClass::Node) => {
                if let Err(e) = &result {
                    tracing::error!(remote = %self.remote, error = %e, "node error");
                }
                self.error();
            }
            _ => self.ok(),
        }
        result
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.next.close().await
    }
}
