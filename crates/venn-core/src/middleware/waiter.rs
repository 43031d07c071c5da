use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::{
    errors::RpcError,
    handler::{Handler, RequestCtx, SharedHandler},
    types::{Payload, RpcRequest},
};

const CAPACITY: u32 = u32::MAX;

/// Counts in-flight requests so shutdown can drain them.
///
/// Every request holds one permit. [`Waiter::wait`] takes all of them, so it resolves once the
/// last request finishes and every request arriving afterwards parks until the process exits.
pub struct Waiter {
    permits: Semaphore,
}

impl Default for Waiter {
    fn default() -> Self {
        Self { permits: Semaphore::new(CAPACITY as usize) }
    }
}

impl Waiter {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Waits for in-flight requests to finish and closes the gate.
    pub async fn wait(&self) {
        if let Ok(all) = self.permits.acquire_many(CAPACITY).await {
            all.forget();
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        CAPACITY as usize - self.permits.available_permits()
    }

    #[must_use]
    pub fn layer(self: &Arc<Self>, next: SharedHandler) -> SharedHandler {
        Arc::new(Gated { waiter: Arc::clone(self), next })
    }
}

struct Gated {
    waiter: Arc<Waiter>,
    next: SharedHandler,
}

#[async_trait]
impl Handler for Gated {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        let _permit = self.waiter.permits.acquire().await.map_err(|_| RpcError::Closed)?;
        self.next.serve(ctx, req).await
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.next.close().await
    }
}
