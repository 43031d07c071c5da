//! Per-remote request logging and latency collection.

use async_trait::async_trait;
use std::time::Instant;

use crate::{
    errors::RpcError,
    handler::{Handler, RequestCtx, SharedHandler},
    metrics,
    types::{Payload, RpcRequest},
};

/// Emits a debug event for every request that reaches the remote.
pub struct Logger {
    chain: String,
    remote: String,
    next: SharedHandler,
}

impl Logger {
    #[must_use]
    pub fn new(chain: &str, remote: &str, next: SharedHandler) -> Self {
        Self { chain: chain.to_string(), remote: remote.to_string(), next }
    }
}

#[async_trait]
impl Handler for Logger {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        let method = req.method.clone();
        let result = self.next.serve(ctx, req).await;
        match &result {
            Ok(_) => tracing::debug!(
                chain = %self.chain,
                remote = %self.remote,
                method = %method,
                "handled request"
            ),
            Err(e) => tracing::debug!(
                chain = %self.chain,
                remote = %self.remote,
                method = %method,
                error = %e,
                "handled request"
            ),
        }
        result
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.next.close().await
    }
}

/// Records `venn_remote_request_duration_seconds` for every request to the remote.
pub struct Collector {
    chain: String,
    remote: String,
    next: SharedHandler,
}

impl Collector {
    #[must_use]
    pub fn new(chain: &str, remote: &str, next: SharedHandler) -> Self {
        Self { chain: chain.to_string(), remote: remote.to_string(), next }
    }
}

#[async_trait]
impl Handler for Collector {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        let start = Instant::now();
        let method = req.method.clone();
        let result = self.next.serve(ctx, req).await;
        metrics::record_remote_request(
            &self.chain,
            &self.remote,
            &method,
            result.is_ok(),
            start.elapsed(),
        );
        result
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.next.close().await
    }
}
