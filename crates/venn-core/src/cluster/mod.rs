//! Priority failover across the remotes of one chain.
//!
//! Remotes are grouped into buckets by priority, smallest first. A request walks the buckets
//! in order; inside a bucket the starting remote rotates so load spreads across equals. The
//! first success wins. A user error ends the walk immediately since another remote would
//! answer the same. When every remote failed and the last failure was a stale answer, the
//! stale data is returned instead of the error.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use crate::{
    errors::{ErrorClass, RpcError},
    handler::{Handler, RequestCtx, SharedHandler},
    metrics,
    remote::Remote,
    types::{Payload, RpcRequest},
};

const HEALTH_GAUGE_INTERVAL: Duration = Duration::from_secs(5);

struct Member {
    name: String,
    handler: SharedHandler,
}

struct Bucket {
    priority: i64,
    members: Vec<Arc<Member>>,
    round: AtomicUsize,
}

pub struct Cluster {
    chain: String,
    buckets: ArcSwap<Vec<Arc<Bucket>>>,
    remotes: ArcSwap<Vec<Arc<Remote>>>,
}

impl Cluster {
    #[must_use]
    pub fn new(chain: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            buckets: ArcSwap::from_pointee(Vec::new()),
            remotes: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Adds a handler to the bucket for `priority`, creating the bucket if needed.
    pub fn add(&self, priority: i64, name: impl Into<String>, handler: SharedHandler) {
        let member = Arc::new(Member { name: name.into(), handler });
        self.buckets.rcu(|current| {
            let mut buckets = (**current).clone();
            match buckets.binary_search_by_key(&priority, |b| b.priority) {
                Ok(idx) => {
                    let bucket = &buckets[idx];
                    let mut members = bucket.members.clone();
                    members.push(Arc::clone(&member));
                    buckets[idx] = Arc::new(Bucket {
                        priority,
                        members,
                        round: AtomicUsize::new(bucket.round.load(Ordering::Relaxed)),
                    });
                }
                Err(idx) => buckets.insert(
                    idx,
                    Arc::new(Bucket {
                        priority,
                        members: vec![Arc::clone(&member)],
                        round: AtomicUsize::new(0),
                    }),
                ),
            }
            buckets
        });
    }

    /// Adds an assembled remote and tracks it for the health gauges.
    pub fn add_remote(&self, remote: Arc<Remote>) {
        self.add(remote.priority(), remote.name(), remote.clone());
        self.remotes.rcu(|current| {
            let mut remotes = (**current).clone();
            remotes.push(Arc::clone(&remote));
            remotes
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.load().iter().map(|b| b.members.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn remotes(&self) -> Arc<Vec<Arc<Remote>>> {
        self.remotes.load_full()
    }

    /// Remotes that are currently healthy and not backing off.
    #[must_use]
    pub fn available(&self) -> usize {
        self.remotes.load().iter().filter(|r| r.is_available()).count()
    }

    /// Publishes the healthy-remote count every few seconds until `shutdown` fires.
    pub fn spawn_health_gauges(self: &Arc<Self>, shutdown: CancellationToken) {
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_GAUGE_INTERVAL);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    _ = interval.tick() => {}
                }
                metrics::record_chain_healthy_remotes(&cluster.chain, cluster.available());
            }
        });
    }
}

#[async_trait]
impl Handler for Cluster {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        let buckets = self.buckets.load();
        let mut last = None;

        for bucket in buckets.iter() {
            let size = bucket.members.len();
            if size == 0 {
                continue;
            }
            let start = if size > 1 { bucket.round.fetch_add(1, Ordering::Relaxed) } else { 0 };
            for offset in 0..size {
                let member = &bucket.members[(start + offset) % size];
                match member.handler.serve(ctx, req.clone()).await {
                    Ok(result) => return Ok(result),
                    Err(e) if e.class() == ErrorClass::User => return Err(e),
                    Err(e) => {
                        tracing::trace!(
                            chain = %self.chain,
                            remote = %member.name,
                            method = %req.method,
                            error = %e,
                            "remote failed, trying next"
                        );
                        last = Some(e);
                    }
                }
            }
        }

        match last {
            Some(RpcError::HeadOld { data: Some(data) }) => Ok(data),
            Some(e) => Err(e),
            None => Err(RpcError::Internal(format!("no remotes for chain {}", self.chain))),
        }
    }

    async fn close(&self) -> Result<(), RpcError> {
        let mut last = Ok(());
        for bucket in self.buckets.load().iter() {
            for member in &bucket.members {
                if let Err(e) = member.handler.close().await {
                    tracing::warn!(
                        chain = %self.chain,
                        remote = %member.name,
                        error = %e,
                        "close failed"
                    );
                    last = Err(e);
                }
            }
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ChainConfig,
        handler::FnHandler,
        types::{null_payload, to_payload},
    };
    use parking_lot::Mutex;
    use serde_json::json;

    type Calls = Arc<Mutex<Vec<&'static str>>>;
    type Outcome = fn() -> Result<Payload, RpcError>;

    fn member(
        name: &'static str,
        calls: &Calls,
        outcome: Outcome,
    ) -> SharedHandler {
        let calls = Arc::clone(calls);
        FnHandler::shared(move |_, _| {
            calls.lock().push(name);
            async move { outcome() }
        })
    }

    fn ctx() -> RequestCtx {
        RequestCtx::new(Arc::new(ChainConfig::new("eth", 1, 12.0)))
    }

    fn req() -> RpcRequest {
        RpcRequest::new("eth_blockNumber", json!([]))
    }

    #[tokio::test]
    async fn test_fails_over_by_priority() {
        let calls = Calls::default();
        let cluster = Cluster::new("eth");
        cluster.add(2, "b", member("b", &calls, || to_payload("0x10")));
        cluster.add(1, "a", member("a", &calls, || Err(RpcError::Transport("down".into()))));

        let res = cluster.serve(&ctx(), req()).await.unwrap();
        assert_eq!(res.get(), r#""0x10""#);
        assert_eq!(*calls.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_user_error_stops_failover() {
        let calls = Calls::default();
        let cluster = Cluster::new("eth");
        let invalid: Outcome = || Err(RpcError::json_rpc(-32602, "invalid block"));
        cluster.add(1, "a", member("a", &calls, invalid));
        cluster.add(2, "b", member("b", &calls, || to_payload("0x10")));

        let err = cluster.serve(&ctx(), req()).await.unwrap_err();
        assert_eq!(err.code(), -32602);
        assert_eq!(err.to_string(), "invalid block");
        assert_eq!(*calls.lock(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_returns_last_error_after_n_calls() {
        let calls = Calls::default();
        let cluster = Cluster::new("eth");
        cluster.add(1, "a", member("a", &calls, || Err(RpcError::RateLimited)));
        cluster.add(1, "b", member("b", &calls, || Err(RpcError::RateLimited)));
        cluster.add(3, "c", member("c", &calls, || Err(RpcError::Unhealthy)));

        let err = cluster.serve(&ctx(), req()).await.unwrap_err();
        assert!(matches!(err, RpcError::Unhealthy));
        assert_eq!(calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_head_old_best_effort() {
        let calls = Calls::default();
        let cluster = Cluster::new("eth");
        let stale: Outcome = || Err(RpcError::HeadOld { data: Some(null_payload()) });
        cluster.add(1, "a", member("a", &calls, stale));

        let res = cluster.serve(&ctx(), req()).await.unwrap();
        assert_eq!(res.get(), "null");
    }

    #[tokio::test]
    async fn test_round_robin_within_bucket() {
        let calls = Calls::default();
        let cluster = Cluster::new("eth");
        cluster.add(1, "a", member("a", &calls, || to_payload("a")));
        cluster.add(1, "b", member("b", &calls, || to_payload("b")));

        for _ in 0..4 {
            cluster.serve(&ctx(), req()).await.unwrap();
        }
        let calls = calls.lock();
        assert_eq!(calls.iter().filter(|c| **c == "a").count(), 2);
        assert_eq!(calls.iter().filter(|c| **c == "b").count(), 2);
    }

    #[tokio::test]
    async fn test_empty_cluster_errors() {
        let cluster = Cluster::new("eth");
        assert!(cluster.is_empty());
        assert!(cluster.serve(&ctx(), req()).await.is_err());
    }
}
