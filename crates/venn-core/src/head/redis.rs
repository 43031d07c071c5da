use async_trait::async_trait;
use deadpool_redis::redis::{
    streams::{StreamId, StreamMaxlen, StreamRangeReply, StreamReadOptions, StreamReadReply},
    AsyncCommands,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use super::{HeadCells, HeadStore, HeadWatch};
use crate::{
    config::ChainConfig,
    errors::StoreError,
    keyspace::{Keys, Redis},
};

const RECONNECT_PAUSE: Duration = Duration::from_secs(5);
const READ_BLOCK_MS: usize = 5_000;
const STREAM_MAXLEN: usize = 1_000;

/// Head store shared through a Redis stream per chain.
///
/// Puts append to the stream and raise the local view right away. A follower task per chain
/// seeds from the newest stream entry and then tails the stream, so every instance converges
/// on the leader's head.
pub struct RedisHeadStore {
    redis: Redis,
    keys: Keys,
    cells: Arc<HeadCells>,
}

impl RedisHeadStore {
    #[must_use]
    pub fn new(redis: Redis) -> Self {
        let keys = redis.keys();
        Self { redis, keys, cells: Arc::new(HeadCells::default()) }
    }

    /// Spawns the stream followers. They stop when `shutdown` is cancelled.
    pub fn start(&self, chains: &[Arc<ChainConfig>], shutdown: &CancellationToken) {
        for chain in chains {
            let follower = Follower {
                chain: chain.name.clone(),
                stream: self.keys.head_stream(&chain.name),
                redis: self.redis.clone(),
                cells: Arc::clone(&self.cells),
                shutdown: shutdown.clone(),
            };
            tokio::spawn(follower.run());
        }
    }
}

struct Follower {
    chain: String,
    stream: String,
    redis: Redis,
    cells: Arc<HeadCells>,
    shutdown: CancellationToken,
}

fn head_value(entry: &StreamId) -> Option<u64> {
    entry.get::<String>("value").and_then(|v| v.parse().ok())
}

impl Follower {
    async fn run(self) {
        loop {
            match self.consume().await {
                Ok(()) => return,
                Err(e) => {
                    tracing::error!(chain = %self.chain, error = %e, "head stream consumer failed");
                }
            }
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = tokio::time::sleep(RECONNECT_PAUSE) => {}
            }
        }
    }

    /// Tails the stream until shutdown (`Ok`) or a Redis error.
    async fn consume(&self) -> Result<(), StoreError> {
        let mut conn = self.redis.conn().await?;
        let newest: StreamRangeReply = conn.xrevrange_count(&self.stream, "+", "-", 1).await?;
        let mut cursor = match newest.ids.first() {
            Some(entry) => {
                if let Some(head) = head_value(entry) {
                    self.cells.raise(&self.chain, head);
                }
                entry.id.clone()
            }
            None => "$".to_string(),
        };

        let opts = StreamReadOptions::default().block(READ_BLOCK_MS).count(100);
        loop {
            let keys = [self.stream.as_str()];
            let ids = [cursor.clone()];
            let reply: Option<StreamReadReply> = tokio::select! {
                () = self.shutdown.cancelled() => return Ok(()),
                reply = conn.xread_options(&keys, &ids, &opts) => reply?,
            };
            let Some(reply) = reply else { continue };
            for key in reply.keys {
                for entry in key.ids {
                    match head_value(&entry) {
                        Some(head) => {
                            self.cells.raise(&self.chain, head);
                        }
                        None => {
                            let id = &entry.id;
                            tracing::warn!(chain = %self.chain, id = %id, "malformed head entry");
                        }
                    }
                    cursor = entry.id;
                }
            }
        }
    }
}

#[async_trait]
impl HeadStore for RedisHeadStore {
    async fn get(&self, chain: &ChainConfig) -> Result<u64, StoreError> {
        Ok(self.cells.get(&chain.name))
    }

    async fn put(&self, chain: &ChainConfig, head: u64) -> Result<u64, StoreError> {
        let prev = self.cells.get(&chain.name);
        let mut conn = self.redis.conn().await?;
        let fields = [("chain", chain.name.clone()), ("value", head.to_string())];
        let _: String = conn
            .xadd_maxlen(
                self.keys.head_stream(&chain.name),
                StreamMaxlen::Approx(STREAM_MAXLEN),
                "*",
                &fields,
            )
            .await?;
        self.cells.raise(&chain.name, head);
        Ok(prev)
    }

    fn on(&self, chain: &ChainConfig) -> HeadWatch {
        self.cells.watch(&chain.name)
    }
}
