//! The handler contract shared by every pipeline stage.
//!
//! A stage owns its `next` handler as a [`SharedHandler`] and wraps it; the per-remote stack,
//! the cluster and the chain-level stages all implement [`Handler`]. Calls carry a
//! [`RequestCtx`] for cancellation, deadlines and subscription delivery.

mod context;
mod notifier;

pub use context::RequestCtx;
pub use notifier::{Notification, Notifier, Subscription};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{future::Future, pin::Pin, sync::Arc};

use crate::{
    errors::RpcError,
    types::{from_payload, Payload, RpcRequest},
};

/// One stage of the request pipeline.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Serves a single request.
    ///
    /// # Errors
    ///
    /// Any [`RpcError`]; its class decides backoff and failover upstream of this stage.
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError>;

    /// Releases background tasks and connections held by this stage and everything it wraps.
    ///
    /// # Errors
    ///
    /// Returns the last close error encountered.
    async fn close(&self) -> Result<(), RpcError> {
        Ok(())
    }
}

pub type SharedHandler = Arc<dyn Handler>;

/// Issues `method(params)` through `handler` and decodes the result.
///
/// # Errors
///
/// Returns the pipeline error, or [`RpcError::Internal`] if the result does not decode into `T`.
pub async fn call<T: DeserializeOwned>(
    handler: &dyn Handler,
    ctx: &RequestCtx,
    method: &str,
    params: Value,
) -> Result<T, RpcError> {
    let payload = handler.serve(ctx, RpcRequest::new(method, params)).await?;
    from_payload(&payload)
}

type ServeFuture = Pin<Box<dyn Future<Output = Result<Payload, RpcError>> + Send>>;

type BoxedServe = Box<dyn Fn(RequestCtx, RpcRequest) -> ServeFuture + Send + Sync>;

/// Adapts an async closure into a [`Handler`]. Used for leaf handlers in tests and for
/// small local responders.
pub struct FnHandler {
    serve: BoxedServe,
}

impl FnHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(RequestCtx, RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, RpcError>> + Send + 'static,
    {
        Self { serve: Box::new(move |ctx, req| Box::pin(f(ctx, req))) }
    }

    /// Wraps the closure as a [`SharedHandler`].
    pub fn shared<F, Fut>(f: F) -> SharedHandler
    where
        F: Fn(RequestCtx, RpcRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, RpcError>> + Send + 'static,
    {
        Arc::new(Self::new(f))
    }
}

#[async_trait]
impl Handler for FnHandler {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        (self.serve)(ctx.clone(), req).await
    }
}
