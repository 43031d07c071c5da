use async_trait::async_trait;
use deadpool_redis::{
    redis::{self, AsyncCommands, Script},
    Connection,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{Leadership, Lease, Strategy};
use crate::{
    errors::ElectionError,
    keyspace::{Keys, Redis},
};

const LOOP_INTERVAL: Duration = Duration::from_secs(1);
const HEALTH_TTL_SECS: u64 = 5;
const LOCK_TTL_MS: u64 = 8_000;

/// Extends the lock only while we still own it.
const EXTEND_LOCK: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

const RELEASE_LOCK: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

/// Multi-instance strategy over Redis.
///
/// Every instance heartbeats a short-lived health key. The leader key names the current leader
/// and can only be claimed while holding the `leader:redsync` lock. An instance that finds the
/// leader's heartbeat missing marks itself an outlaw and deletes the leader key, so the next
/// cycle can claim it.
pub struct RedisStrategy {
    inner: Arc<Inner>,
}

struct Inner {
    redis: Redis,
    keys: Keys,
    id: Uuid,
    leadership: Leadership,
    extend: Script,
    release: Script,
}

impl RedisStrategy {
    #[must_use]
    pub fn new(redis: Redis) -> Self {
        let keys = redis.keys();
        Self {
            inner: Arc::new(Inner {
                redis,
                keys,
                id: Uuid::new_v4(),
                leadership: Leadership::new(false),
                extend: Script::new(EXTEND_LOCK),
                release: Script::new(RELEASE_LOCK),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }
}

fn parse_leader(value: &str) -> Option<Uuid> {
    Uuid::parse_str(value.trim()).ok().filter(|id| !id.is_nil())
}

impl Inner {
    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(LOOP_INTERVAL);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.cycle().await {
                // an unreachable backend means nobody can prove leadership
                self.leadership.set(false);
                tracing::error!(uuid = %self.id, error = %e, "leader election errored");
            }
        }
        self.leadership.set(false);
        if let Err(e) = self.unlock().await {
            tracing::warn!(uuid = %self.id, error = %e, "failed to release leader lock");
        }
        tracing::info!(uuid = %self.id, "election loop shutdown");
    }

    async fn cycle(&self) -> Result<(), ElectionError> {
        let mut conn = self.redis.conn().await?;
        self.broadcast_health(&mut conn).await?;

        let Some(leader) = self.discover_leader(&mut conn).await? else {
            tracing::info!("known leader is nil, trying again");
            self.leadership.set(false);
            return Ok(());
        };

        let is_leader = leader == self.id;
        let was_leader = self.leadership.is_leader();
        self.leadership.set(is_leader);
        if is_leader && !was_leader {
            tracing::info!(uuid = %self.id, "i am the new leader");
        } else if was_leader && !is_leader {
            tracing::debug!(uuid = %self.id, think_leader = %leader, "i lost leadership");
        }

        if is_leader {
            self.extend_lock(&mut conn).await?;
            return self.broadcast_health(&mut conn).await;
        }
        self.mutiny(&mut conn, leader).await
    }

    async fn broadcast_health(&self, conn: &mut Connection) -> Result<(), ElectionError> {
        let key = self.keys.election_health(&self.id.to_string());
        let () = conn.set_ex(key, "OK", HEALTH_TTL_SECS).await?;
        Ok(())
    }

    /// Current leader, claiming the role when none is set. `None` when the key is absent and
    /// the lock is held by someone else.
    async fn discover_leader(&self, conn: &mut Connection) -> Result<Option<Uuid>, ElectionError> {
        let key = self.keys.election_leader();
        loop {
            let value: Option<String> = conn.get(&key).await?;
            let Some(value) = value else {
                return self.attempt_promotion(conn).await;
            };
            match parse_leader(&value) {
                Some(id) => return Ok(Some(id)),
                None => {
                    tracing::warn!(value = %value, "could not parse uuid in leader key, deleting");
                    let () = conn.del(&key).await?;
                }
            }
        }
    }

    async fn attempt_promotion(
        &self,
        conn: &mut Connection,
    ) -> Result<Option<Uuid>, ElectionError> {
        let locked: Option<String> = redis::cmd("SET")
            .arg(self.keys.leader_lock())
            .arg(self.id.to_string())
            .arg("NX")
            .arg("PX")
            .arg(LOCK_TTL_MS)
            .query_async(conn)
            .await?;
        if locked.is_none() {
            return Ok(None);
        }
        let () = conn.set(self.keys.election_leader(), self.id.to_string()).await?;
        Ok(Some(self.id))
    }

    async fn extend_lock(&self, conn: &mut Connection) -> Result<(), ElectionError> {
        let extended: i64 = self
            .extend
            .key(self.keys.leader_lock())
            .arg(self.id.to_string())
            .arg(LOCK_TTL_MS)
            .invoke_async(conn)
            .await?;
        if extended == 0 {
            tracing::warn!(uuid = %self.id, "leader lock not held, could not extend");
        }
        Ok(())
    }

    async fn unlock(&self) -> Result<(), ElectionError> {
        let mut conn = self.redis.conn().await?;
        let _: i64 = self
            .release
            .key(self.keys.leader_lock())
            .arg(self.id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Deposes `leader` when its heartbeat has expired.
    async fn mutiny(&self, conn: &mut Connection, leader: Uuid) -> Result<(), ElectionError> {
        let healthy: bool = conn.exists(self.keys.election_health(&leader.to_string())).await?;
        if healthy {
            return Ok(());
        }
        tracing::info!(uuid = %self.id, overthrowing = %leader, "attempting overthrow");
        let () = conn.sadd(self.keys.election_outlaws(), self.id.to_string()).await?;
        let () = conn.del(self.keys.election_leader()).await?;
        tracing::info!(uuid = %self.id, overthrowing = %leader, "mutiny successful");
        Ok(())
    }
}

#[async_trait]
impl Strategy for RedisStrategy {
    fn is_leader(&self) -> bool {
        self.inner.leadership.is_leader()
    }

    async fn join(&self, shutdown: CancellationToken) -> Result<(), ElectionError> {
        tracing::info!(uuid = %self.inner.id, "attempting to discover leader");
        let mut conn = self.inner.redis.conn().await?;
        let leader = self.inner.discover_leader(&mut conn).await?;
        tracing::info!(known_leader = ?leader, "i think the leader is");
        tokio::spawn(Arc::clone(&self.inner).run(shutdown));
        Ok(())
    }

    async fn acquire_lease(&self, parent: &CancellationToken) -> Option<Lease> {
        self.inner.leadership.acquire(parent).await
    }
}
