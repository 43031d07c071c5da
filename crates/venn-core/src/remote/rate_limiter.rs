use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota};
use std::{num::NonZeroU32, time::Duration};

use crate::{
    config::RemoteRateLimit,
    errors::RpcError,
    handler::{Handler, RequestCtx, SharedHandler},
    types::{Payload, RpcRequest},
};

/// Token bucket in front of one remote. Requests over the budget fail with
/// [`RpcError::RateLimited`] without reaching the remote.
pub struct RateLimiter {
    limiter: DefaultDirectRateLimiter,
    next: SharedHandler,
}

impl RateLimiter {
    #[must_use]
    pub fn new(limit: &RemoteRateLimit, next: SharedHandler) -> Self {
        Self { limiter: DefaultDirectRateLimiter::direct(quota(limit)), next }
    }
}

fn quota(limit: &RemoteRateLimit) -> Quota {
    let burst = NonZeroU32::new(limit.burst).unwrap_or(NonZeroU32::MIN);
    let period = if limit.events_per_second > 0.0 {
        Duration::from_secs_f64(1.0 / limit.events_per_second)
    } else {
        Duration::from_secs(1)
    };
    Quota::with_period(period.max(Duration::from_nanos(1)))
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
        .allow_burst(burst)
}

#[async_trait]
impl Handler for RateLimiter {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        if self.limiter.check().is_err() {
            return Err(RpcError::RateLimited);
        }
        self.next.serve(ctx, req).await
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.next.close().await
    }
}
