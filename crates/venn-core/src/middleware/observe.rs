use async_trait::async_trait;
use std::time::Instant;
use tracing::Instrument;

use crate::{
    errors::RpcError,
    handler::{Handler, RequestCtx, SharedHandler},
    metrics,
    types::{Payload, RpcRequest},
};

/// Outermost per-chain stage: one `rpc` span and request metrics per client call.
pub struct RequestMetrics {
    next: SharedHandler,
}

impl RequestMetrics {
    #[must_use]
    pub fn new(next: SharedHandler) -> Self {
        Self { next }
    }
}

#[async_trait]
impl Handler for RequestMetrics {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        let started = Instant::now();
        let span = tracing::info_span!("rpc", method = %req.method, chain = %ctx.chain.name);
        let method = req.method.clone();
        let result = self.next.serve(ctx, req).instrument(span).await;
        metrics::record_request(&ctx.chain.name, &method, started.elapsed());
        if let Err(e) = &result {
            tracing::debug!(
                chain = %ctx.chain.name,
                method = %method,
                error = %e,
                "request failed"
            );
        }
        result
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.next.close().await
    }
}
