//! Leader election and leases for singleton background work.
//!
//! A [`Strategy`] decides whether this instance leads. Work that must run on one instance only
//! (the head stalkers) asks for a [`Lease`]: it is granted once leadership is held and its token
//! is cancelled the moment leadership is lost, after which [`Election::run_with_lease`] waits
//! for the next grant.

mod always;
mod redis;

pub use always::AlwaysLeader;
pub use redis::RedisStrategy;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    config::{ElectionConfig, ElectionStrategyKind},
    errors::{ElectionError, RpcError},
    keyspace::Redis,
    metrics,
};

/// A grant of leadership. Cancelled on loss of leadership or when its parent token is.
#[derive(Debug, Clone)]
pub struct Lease {
    token: CancellationToken,
    lost: Arc<AtomicBool>,
}

impl Lease {
    fn new(parent: &CancellationToken) -> Self {
        Self { token: parent.child_token(), lost: Arc::new(AtomicBool::new(false)) }
    }

    fn revoke(&self) {
        self.lost.store(true, Ordering::Release);
        self.token.cancel();
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Why the lease ended, or `None` while it is still held.
    #[must_use]
    pub fn cause(&self) -> Option<RpcError> {
        if self.lost.load(Ordering::Acquire) {
            Some(RpcError::LostLeadership)
        } else if self.token.is_cancelled() {
            Some(RpcError::Cancelled)
        } else {
            None
        }
    }
}

/// Leadership state plus the leases handed out under it.
#[derive(Debug)]
pub(crate) struct Leadership {
    state: watch::Sender<bool>,
    leases: Mutex<Vec<Lease>>,
}

impl Leadership {
    pub(crate) fn new(leader: bool) -> Self {
        Self { state: watch::Sender::new(leader), leases: Mutex::new(Vec::new()) }
    }

    pub(crate) fn is_leader(&self) -> bool {
        *self.state.borrow()
    }

    /// Updates the state. Losing leadership revokes every outstanding lease.
    pub(crate) fn set(&self, leader: bool) {
        let was = self.state.send_replace(leader);
        if was && !leader {
            for lease in self.leases.lock().drain(..) {
                lease.revoke();
            }
        }
        if was != leader {
            metrics::record_election_leader(leader);
        }
    }

    pub(crate) async fn acquire(&self, parent: &CancellationToken) -> Option<Lease> {
        let mut state = self.state.subscribe();
        loop {
            let open = tokio::select! {
                () = parent.cancelled() => return None,
                res = state.wait_for(|leader| *leader) => res.is_ok(),
            };
            if !open {
                return None;
            }
            if let Some(lease) = self.grant(parent) {
                return Some(lease);
            }
        }
    }

    /// Registers a lease if still leader. Checked under the lock so `set(false)` cannot miss it.
    fn grant(&self, parent: &CancellationToken) -> Option<Lease> {
        let mut leases = self.leases.lock();
        if !self.is_leader() {
            return None;
        }
        leases.retain(|l| !l.token.is_cancelled());
        let lease = Lease::new(parent);
        leases.push(lease.clone());
        Some(lease)
    }
}

#[async_trait]
pub trait Strategy: Send + Sync {
    fn is_leader(&self) -> bool;

    /// Runs the election until `shutdown`. Backend failures are retried, never fatal.
    ///
    /// # Errors
    ///
    /// Returns an error only if the election cannot start at all.
    async fn join(&self, shutdown: CancellationToken) -> Result<(), ElectionError>;

    /// Waits for leadership and grants a lease derived from `parent`. `None` once `parent` is
    /// cancelled.
    async fn acquire_lease(&self, parent: &CancellationToken) -> Option<Lease>;
}

/// The configured strategy plus the lease loop around it.
#[derive(Clone)]
pub struct Election {
    strategy: Arc<dyn Strategy>,
}

impl Election {
    #[must_use]
    pub fn new(strategy: Arc<dyn Strategy>) -> Self {
        Self { strategy }
    }

    /// Picks the strategy from config, defaulting to `redis` when Redis is available.
    ///
    /// # Errors
    ///
    /// Returns [`ElectionError::Store`] when `redis` is requested without a Redis connection.
    pub fn from_config(
        config: &ElectionConfig,
        redis: Option<&Redis>,
    ) -> Result<Self, ElectionError> {
        let kind = config.strategy.unwrap_or_else(|| {
            tracing::warn!("no election strategy specified, autodetecting");
            if redis.is_some() {
                ElectionStrategyKind::Redis
            } else {
                ElectionStrategyKind::AlwaysLeader
            }
        });
        let strategy: Arc<dyn Strategy> = match kind {
            ElectionStrategyKind::Redis => {
                let redis = redis.ok_or_else(|| {
                    crate::errors::StoreError::Build(
                        "redis election strategy requires redis".to_string(),
                    )
                })?;
                Arc::new(RedisStrategy::new(redis.clone()))
            }
            ElectionStrategyKind::AlwaysLeader => Arc::new(AlwaysLeader::new()),
        };
        tracing::info!(strategy = ?kind, "running election");
        Ok(Self { strategy })
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.strategy.is_leader()
    }

    /// Starts the election loop in the background.
    ///
    /// # Errors
    ///
    /// Propagates a failure to start the strategy.
    pub async fn join(&self, shutdown: CancellationToken) -> Result<(), ElectionError> {
        self.strategy.join(shutdown).await
    }

    pub async fn acquire_lease(&self, parent: &CancellationToken) -> Option<Lease> {
        self.strategy.acquire_lease(parent).await
    }

    /// Runs `leader` under each lease until `shutdown`. A lease lost to another instance is
    /// followed by waiting for the next one; any other cancellation ends the loop.
    pub async fn run_with_lease<F, Fut>(&self, shutdown: &CancellationToken, leader: F)
    where
        F: Fn(Lease) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            if !self.strategy.is_leader() {
                tracing::info!("waiting for leadership lease");
            }
            let Some(lease) = self.strategy.acquire_lease(shutdown).await else { return };
            tracing::info!("obtained leadership");
            let token = lease.token().clone();
            leader(lease.clone()).await;
            token.cancelled().await;
            match lease.cause() {
                Some(RpcError::LostLeadership) => continue,
                _ => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lease_revoked_on_loss() {
        let leadership = Leadership::new(true);
        let root = CancellationToken::new();
        let lease = leadership.acquire(&root).await.unwrap();
        assert!(lease.cause().is_none());

        leadership.set(false);
        assert!(lease.token().is_cancelled());
        assert!(matches!(lease.cause(), Some(RpcError::LostLeadership)));
    }

    #[tokio::test]
    async fn test_acquire_waits_for_leadership() {
        let leadership = Arc::new(Leadership::new(false));
        let root = CancellationToken::new();
        let waiting = {
            let leadership = Arc::clone(&leadership);
            let root = root.clone();
            tokio::spawn(async move { leadership.acquire(&root).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        leadership.set(true);
        let lease = tokio::time::timeout(Duration::from_secs(1), waiting).await.unwrap().unwrap();
        assert!(lease.is_some());
    }

    #[tokio::test]
    async fn test_parent_cancel_is_not_loss() {
        let leadership = Leadership::new(true);
        let root = CancellationToken::new();
        let lease = leadership.acquire(&root).await.unwrap();
        root.cancel();
        assert!(matches!(lease.cause(), Some(RpcError::Cancelled)));
        assert!(leadership.acquire(&root).await.is_none());
    }

    #[tokio::test]
    async fn test_run_with_lease_stops_on_shutdown() {
        let election = Election::new(Arc::new(AlwaysLeader::new()));
        let shutdown = CancellationToken::new();
        let runs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let task = {
            let shutdown = shutdown.clone();
            let runs = Arc::clone(&runs);
            tokio::spawn(async move {
                election
                    .run_with_lease(&shutdown, |lease| {
                        let runs = Arc::clone(&runs);
                        async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            lease.token().cancelled().await;
                        }
                    })
                    .await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_redis_strategy_requires_redis() {
        let config = ElectionConfig { strategy: Some(ElectionStrategyKind::Redis) };
        assert!(Election::from_config(&config, None).is_err());
        let auto = Election::from_config(&ElectionConfig::default(), None).unwrap();
        assert!(auto.is_leader());
    }
}
