use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{AppConfig, ChainConfig},
    election::Election,
    head::{RedisHeadStore, SharedHeadStore},
    middleware::{ClientLimiter, Waiter},
};

use super::{builder::VennRuntimeBuilder, Chains, RuntimeError};

/// How long shutdown waits for in-flight requests before closing remotes anyway.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the chain pipelines and the background tasks around them.
///
/// Every background task is bound to the root token; [`VennRuntime::shutdown`] cancels it,
/// drains in-flight requests and closes the remotes.
pub struct VennRuntime {
    config: AppConfig,
    chains: Chains,
    heads: SharedHeadStore,
    redis_heads: Option<Arc<RedisHeadStore>>,
    election: Election,
    waiter: Arc<Waiter>,
    limiter: Option<Arc<ClientLimiter>>,
    root: CancellationToken,
    shutdown_initiated: AtomicBool,
}

impl VennRuntime {
    #[must_use]
    pub fn builder() -> VennRuntimeBuilder {
        VennRuntimeBuilder::new()
    }

    pub(super) fn new(
        config: AppConfig,
        chains: Chains,
        heads: SharedHeadStore,
        redis_heads: Option<Arc<RedisHeadStore>>,
        election: Election,
        waiter: Arc<Waiter>,
        limiter: Option<Arc<ClientLimiter>>,
    ) -> Self {
        Self {
            config,
            chains,
            heads,
            redis_heads,
            election,
            waiter,
            limiter,
            root: CancellationToken::new(),
            shutdown_initiated: AtomicBool::new(false),
        }
    }

    /// Joins the election and spawns the background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Election`] when the election backend is unreachable at start.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        self.election.join(self.root.clone()).await?;

        if let Some(store) = &self.redis_heads {
            let chains: Vec<Arc<ChainConfig>> =
                self.chains.iter().map(|p| Arc::clone(p.chain())).collect();
            store.start(&chains, &self.root);
        }
        if let Some(limiter) = &self.limiter {
            limiter.start_cleanup_task(self.root.clone());
        }

        for pipeline in self.chains.iter() {
            pipeline.cluster().spawn_health_gauges(self.root.clone());

            if let Some(center) = pipeline.subcenter() {
                let center = Arc::clone(center);
                let chain = Arc::clone(pipeline.chain());
                let root = self.root.clone();
                tokio::spawn(async move { center.track(chain, root).await });
            }

            if let Some(stalker) = pipeline.stalker() {
                let stalker = Arc::clone(stalker);
                let election = self.election.clone();
                let root = self.root.clone();
                tokio::spawn(async move {
                    election
                        .run_with_lease(&root, |lease| {
                            let stalker = Arc::clone(&stalker);
                            async move { stalker.run(lease.token()).await }
                        })
                        .await;
                });
            }
        }

        tracing::info!(chains = self.chains.len(), "venn runtime started");
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    #[must_use]
    pub fn chains(&self) -> &Chains {
        &self.chains
    }

    #[must_use]
    pub fn heads(&self) -> &SharedHeadStore {
        &self.heads
    }

    #[must_use]
    pub fn election(&self) -> &Election {
        &self.election
    }

    #[must_use]
    pub fn waiter(&self) -> &Arc<Waiter> {
        &self.waiter
    }

    #[must_use]
    pub fn limiter(&self) -> Option<&Arc<ClientLimiter>> {
        self.limiter.as_ref()
    }

    /// Cancelled when shutdown begins.
    #[must_use]
    pub fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    /// Cancels background work, waits up to [`DRAIN_TIMEOUT`] for in-flight requests, then
    /// closes every chain. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            tracing::warn!("shutdown already initiated, ignoring duplicate call");
            return;
        }

        tracing::info!("initiating venn runtime shutdown");
        self.root.cancel();

        if tokio::time::timeout(DRAIN_TIMEOUT, self.waiter.wait()).await.is_err() {
            tracing::warn!(
                in_flight = self.waiter.in_flight(),
                "timed out waiting for in-flight requests"
            );
        }

        for pipeline in self.chains.iter() {
            if let Err(e) = pipeline.handler().close().await {
                let chain = &pipeline.chain().name;
                tracing::error!(chain = %chain, error = %e, "failed to close chain");
            }
        }
        tracing::info!("venn runtime shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handler::RequestCtx, types::RpcRequest};
    use serde_json::json;

    const CONFIG: &str = r"
metrics:
  disabled: true
chains:
  - name: ethereum
    id: 1
    block_time_seconds: 12
    remotes:
      - name: primary
        url: http://127.0.0.1:9
";

    fn runtime() -> VennRuntime {
        let config = AppConfig::from_yaml_str(CONFIG).unwrap();
        VennRuntime::builder().with_config(config).build().unwrap()
    }

    #[tokio::test]
    async fn test_shutdown_closes_the_gate() {
        let runtime = runtime();
        runtime.start().await.unwrap();
        runtime.shutdown().await;
        assert!(runtime.root_token().is_cancelled());

        let pipeline = runtime.chains().resolve("ethereum").unwrap();
        let ctx = RequestCtx::new(Arc::clone(pipeline.chain()));
        let parked = pipeline.handler().serve(&ctx, RpcRequest::new("eth_chainId", json!([])));
        let res = tokio::time::timeout(Duration::from_millis(50), parked).await;
        assert!(res.is_err(), "requests after shutdown must not be served");

        // idempotent
        runtime.shutdown().await;
    }
}
