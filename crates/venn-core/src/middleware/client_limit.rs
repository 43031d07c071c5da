use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::ClientRateLimitConfig,
    errors::RpcError,
    handler::{Handler, RequestCtx, SharedHandler},
    types::{Payload, RpcRequest},
};

/// Token buckets keyed by client IP: `total` requests per `window`.
///
/// The number of tracked clients is capped so spoofed addresses cannot grow the map without
/// bound; new clients past the cap are rejected.
pub struct ClientLimiter {
    buckets: Arc<DashMap<String, TokenBucket>>,
    max_tokens: f64,
    refill_per_sec: f64,
    bucket_ttl: Duration,
    max_buckets: usize,
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

impl ClientLimiter {
    const DEFAULT_MAX_BUCKETS: usize = 100_000;
    const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

    #[must_use]
    pub fn new(config: &ClientRateLimitConfig) -> Self {
        let max_tokens = f64::from(config.total.max(1));
        let window = config.window.as_secs_f64().max(f64::EPSILON);
        Self {
            buckets: Arc::new(DashMap::new()),
            max_tokens,
            refill_per_sec: max_tokens / window,
            bucket_ttl: config.window.max(Self::CLEANUP_INTERVAL),
            max_buckets: Self::DEFAULT_MAX_BUCKETS,
        }
    }

    /// Drops idle buckets every few minutes until `shutdown` fires.
    pub fn start_cleanup_task(&self, shutdown: CancellationToken) {
        let buckets = Arc::clone(&self.buckets);
        let ttl = self.bucket_ttl;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Self::CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    _ = interval.tick() => {}
                }
                let now = Instant::now();
                buckets.retain(|_, bucket| now.duration_since(bucket.last_access) < ttl);
            }
        });
    }

    /// Takes one token for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ClientRateLimited`] with the time until a token is available.
    pub fn check(&self, key: &str) -> Result<(), RpcError> {
        let now = Instant::now();

        if let Some(mut bucket) = self.buckets.get_mut(key) {
            return self.take(&mut bucket, now, key);
        }
        if self.buckets.len() >= self.max_buckets {
            return Err(self.rejection(0.0, key));
        }
        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| TokenBucket {
            tokens: self.max_tokens,
            last_refill: now,
            last_access: now,
        });
        self.take(&mut bucket, now, key)
    }

    fn take(&self, bucket: &mut TokenBucket, now: Instant, key: &str) -> Result<(), RpcError> {
        bucket.last_access = now;
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        let refill = (elapsed * self.refill_per_sec).min(self.max_tokens);
        if refill > 0.0 {
            bucket.tokens = (bucket.tokens + refill).min(self.max_tokens);
            bucket.last_refill = now;
        }
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err(self.rejection(bucket.tokens, key))
        }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn rejection(&self, tokens: f64, key: &str) -> RpcError {
        let wait_ms = ((1.0 - tokens) / self.refill_per_sec * 1000.0).ceil().max(1.0) as u64;
        RpcError::ClientRateLimited { wait_ms, key: key.to_string() }
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Wraps `next` so every external request is charged to its peer address.
    #[must_use]
    pub fn layer(self: &Arc<Self>, next: SharedHandler) -> SharedHandler {
        Arc::new(Limited { limiter: Arc::clone(self), next })
    }
}

struct Limited {
    limiter: Arc<ClientLimiter>,
    next: SharedHandler,
}

#[async_trait]
impl Handler for Limited {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        if let (false, Some(peer)) = (ctx.internal, ctx.peer) {
            self.limiter.check(&peer.to_string())?;
        }
        self.next.serve(ctx, req).await
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.next.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ChainConfig, handler::FnHandler, types::to_payload};
    use serde_json::json;
    use std::net::{IpAddr, Ipv4Addr};

    fn limiter(total: u32, window: Duration) -> ClientLimiter {
        ClientLimiter::new(&ClientRateLimitConfig { total, window })
    }

    #[test]
    fn test_bucket_exhausts_and_reports_wait() {
        let limiter = limiter(2, Duration::from_secs(1));
        assert!(limiter.check("10.0.0.1").is_ok());
        assert!(limiter.check("10.0.0.1").is_ok());
        match limiter.check("10.0.0.1") {
            Err(RpcError::ClientRateLimited { wait_ms, key }) => {
                assert!(wait_ms > 0 && wait_ms <= 500, "{wait_ms}");
                assert_eq!(key, "10.0.0.1");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(limiter.check("10.0.0.2").is_ok());
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[tokio::test]
    async fn test_bucket_refills() {
        let limiter = limiter(1, Duration::from_millis(200));
        assert!(limiter.check("a").is_ok());
        assert!(limiter.check("a").is_err());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(limiter.check("a").is_ok());
    }

    #[tokio::test]
    async fn test_layer_skips_internal_calls() {
        let limiter = Arc::new(limiter(1, Duration::from_secs(60)));
        let handler = limiter.layer(FnHandler::shared(|_, _| async { to_payload("ok") }));
        let chain = Arc::new(ChainConfig::new("eth", 1, 12.0));
        let peer = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let external = RequestCtx::new(Arc::clone(&chain)).with_peer(peer);

        assert!(handler.serve(&external, RpcRequest::new("eth_chainId", json!([]))).await.is_ok());
        let err = handler.serve(&external, RpcRequest::new("eth_chainId", json!([]))).await;
        assert!(matches!(err, Err(RpcError::ClientRateLimited { .. })));

        let internal = RequestCtx::background(chain, &CancellationToken::new()).with_peer(peer);
        assert!(handler.serve(&internal, RpcRequest::new("eth_chainId", json!([]))).await.is_ok());
    }
}
