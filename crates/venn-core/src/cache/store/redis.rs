use async_trait::async_trait;
use deadpool_redis::{
    redis::{self, Script},
    Connection,
};
use serde_json::value::RawValue;
use std::sync::Arc;

use super::{BlockStore, Entries, Entry, EntryKind, Query};
use crate::{
    config::ChainConfig,
    errors::StoreError,
    handler::RequestCtx,
    keyspace::{Keys, Redis},
    types::Hash32,
};

/// Returns 1 when a hash is stored one block below and differs from the incoming parent.
const CHECK_REORG: &str = r"
local stored = redis.call('GET', KEYS[1])
if stored and stored ~= ARGV[1] then
  return 1
end
return 0
";

/// Raises the kind's head marker to `ARGV[1]` and returns the marker after the raise.
const RAISE_HEAD: &str = r"
local n = tonumber(ARGV[1])
local head = tonumber(redis.call('GET', KEYS[1]) or '0')
if n > head then
  head = n
  redis.call('SET', KEYS[1], ARGV[1])
end
return head
";

const MIN_TTL_SECS: u64 = 1;
const MAX_TTL_SECS: u64 = 3600;

const SCAN_COUNT: usize = 500;

/// Shared layer backed by Redis. One store serves every chain; keys are scoped by the
/// request's chain.
pub struct RedisBlockStore {
    redis: Redis,
    keys: Keys,
    check_reorg: Script,
    raise_head: Script,
}

fn seconds_per_block(chain: &ChainConfig) -> u64 {
    // whole seconds, at least one
    chain.block_time_seconds.max(1.0).floor() as u64
}

/// Lifetime of an entry `number` when the kind's head is `head`: one block time per block of
/// depth, counting the entry's own block.
fn entry_ttl(head: u64, number: u64, seconds_per_block: u64) -> u64 {
    head.saturating_sub(number)
        .saturating_add(1)
        .saturating_mul(seconds_per_block)
        .clamp(MIN_TTL_SECS, MAX_TTL_SECS)
}

fn decode(
    value: Option<String>,
    number: Option<String>,
    hash: Option<String>,
) -> Result<Option<Arc<Entry>>, StoreError> {
    let (Some(value), Some(number), Some(hash)) = (value, number, hash) else {
        return Ok(None);
    };
    let number = number
        .parse::<u64>()
        .map_err(|e| StoreError::Malformed(format!("entry number {number:?}: {e}")))?;
    let hash = Hash32::try_from(hash.as_str())
        .map_err(|e| StoreError::Malformed(format!("entry hash {hash:?}: {e}")))?;
    let value =
        RawValue::from_string(value).map_err(|e| StoreError::Malformed(e.to_string()))?;
    Ok(Some(Entry::new(hash, number, None, value)))
}

impl RedisBlockStore {
    #[must_use]
    pub fn new(redis: Redis) -> Self {
        let keys = redis.keys();
        Self {
            redis,
            keys,
            check_reorg: Script::new(CHECK_REORG),
            raise_head: Script::new(RAISE_HEAD),
        }
    }

    async fn by_hash(
        &self,
        conn: &mut Connection,
        chain: &str,
        kind: &str,
        hash: Hash32,
    ) -> Result<Option<Entries>, StoreError> {
        let hash = hash.to_string();
        let (value, number): (Option<String>, Option<String>) = redis::pipe()
            .get(self.keys.entry_by_hash(chain, kind, &hash, "value"))
            .get(self.keys.entry_by_hash(chain, kind, &hash, "number"))
            .query_async(conn)
            .await?;
        Ok(decode(value, number, Some(hash))?.map(|entry| vec![entry]))
    }

    async fn by_range(
        &self,
        conn: &mut Connection,
        chain: &str,
        kind: &str,
        start: u64,
        end: u64,
    ) -> Result<Option<Entries>, StoreError> {
        let mut pipe = redis::pipe();
        for n in start..=end {
            pipe.get(self.keys.entry_by_number(chain, kind, n, "value"))
                .get(self.keys.entry_by_number(chain, kind, n, "hash"));
        }
        let replies: Vec<Option<String>> = pipe.query_async(conn).await?;

        let mut out = Vec::with_capacity(replies.len() / 2);
        let mut replies = replies.into_iter();
        for n in start..=end {
            let value = replies.next().flatten();
            let hash = replies.next().flatten();
            match decode(value, Some(n.to_string()), hash)? {
                Some(entry) => out.push(entry),
                None => return Ok(None),
            }
        }
        Ok(Some(out))
    }

    /// Deletes every by-number key of one kind.
    async fn purge(
        &self,
        conn: &mut Connection,
        chain: &str,
        kind: &str,
    ) -> Result<usize, StoreError> {
        let pattern = format!("{}*", self.keys.entries_by_number_prefix(chain, kind));
        let mut cursor = 0_u64;
        let mut deleted = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(conn)
                .await?;
            if !keys.is_empty() {
                deleted += keys.len();
                let () = redis::cmd("DEL").arg(&keys).query_async(conn).await?;
            }
            if next == 0 {
                return Ok(deleted);
            }
            cursor = next;
        }
    }
}

#[async_trait]
impl BlockStore for RedisBlockStore {
    async fn get(
        &self,
        ctx: &RequestCtx,
        kind: EntryKind,
        query: &Query,
    ) -> Result<Option<Entries>, StoreError> {
        let mut conn = self.redis.conn().await?;
        let chain = ctx.chain.name.as_str();
        match *query {
            Query::Hash(hash) => self.by_hash(&mut conn, chain, kind.as_str(), hash).await,
            Query::Range { start, end } => {
                self.by_range(&mut conn, chain, kind.as_str(), start, end).await
            }
        }
    }

    async fn put(
        &self,
        ctx: &RequestCtx,
        kind: EntryKind,
        entries: &[Arc<Entry>],
    ) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.redis.conn().await?;
        let chain = ctx.chain.name.as_str();
        let kind = kind.as_str();
        let spb = seconds_per_block(&ctx.chain);

        for entry in entries {
            if let (Some(parent), Some(below)) = (entry.parent, entry.number.checked_sub(1)) {
                let mismatch: i64 = self
                    .check_reorg
                    .key(self.keys.entry_by_number(chain, kind, below, "hash"))
                    .arg(parent.to_string())
                    .invoke_async(&mut conn)
                    .await?;
                if mismatch == 1 {
                    let deleted = self.purge(&mut conn, chain, kind).await?;
                    tracing::info!(
                        chain = %chain,
                        kind = %kind,
                        number = entry.number,
                        deleted,
                        "parent hash mismatch, purged redis entries"
                    );
                }
            }

            let head: u64 = self
                .raise_head
                .key(self.keys.entries_head(chain, kind))
                .arg(entry.number)
                .invoke_async(&mut conn)
                .await?;
            let ttl = entry_ttl(head, entry.number, spb);

            let hash = entry.hash.to_string();
            let number = entry.number.to_string();
            let value = entry.value.get();
            let mut pipe = redis::pipe();
            pipe.atomic()
                .set_ex(self.keys.entry_by_number(chain, kind, entry.number, "value"), value, ttl)
                .ignore()
                .set_ex(self.keys.entry_by_number(chain, kind, entry.number, "hash"), &hash, ttl)
                .ignore();
            if !entry.hash.is_zero() {
                pipe.set_ex(self.keys.entry_by_hash(chain, kind, &hash, "value"), value, ttl)
                    .ignore()
                    .set_ex(self.keys.entry_by_hash(chain, kind, &hash, "number"), &number, ttl)
                    .ignore();
            }
            let () = pipe.query_async(&mut conn).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_per_block_floor() {
        assert_eq!(seconds_per_block(&ChainConfig::new("a", 1, 12.0)), 12);
        assert_eq!(seconds_per_block(&ChainConfig::new("b", 2, 0.4)), 1);
        assert_eq!(seconds_per_block(&ChainConfig::new("c", 3, 2.5)), 2);
    }

    #[test]
    fn test_entry_ttl_bounds() {
        assert_eq!(entry_ttl(100, 100, 12), 12, "the head block lives one block time");
        assert_eq!(entry_ttl(100, 90, 12), 132);
        assert_eq!(entry_ttl(1_000_000, 1, 12), MAX_TTL_SECS);
        assert_eq!(entry_ttl(u64::MAX, 0, u64::MAX), MAX_TTL_SECS);
        assert_eq!(entry_ttl(5, 9, 12), 12, "entries above the head count as the head");

        let fast = ChainConfig::new("fast", 7, 0.4);
        assert_eq!(entry_ttl(100, 100, seconds_per_block(&fast)), MIN_TTL_SECS);
        assert_eq!(entry_ttl(100, 100, 0), MIN_TTL_SECS);
    }

    #[test]
    fn test_decode_requires_every_field() {
        let hash = Hash32([1; 32]).to_string();
        assert!(decode(Some("{}".into()), None, Some(hash.clone())).unwrap().is_none());
        assert!(decode(None, Some("1".into()), Some(hash.clone())).unwrap().is_none());

        let entry = decode(Some(r#"{"a":1}"#.into()), Some("42".into()), Some(hash))
            .unwrap()
            .unwrap();
        assert_eq!(entry.number, 42);
        assert_eq!(entry.hash, Hash32([1; 32]));
        assert_eq!(entry.value.get(), r#"{"a":1}"#);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let hash = Hash32([1; 32]).to_string();
        let bad_number = decode(Some("{}".into()), Some("x".into()), Some(hash));
        assert!(matches!(bad_number, Err(StoreError::Malformed(_))));
        let bad_hash = decode(Some("{}".into()), Some("1".into()), Some("0x12".into()));
        assert!(matches!(bad_hash, Err(StoreError::Malformed(_))));
    }

    /// Set `VENN_TEST_REDIS_URI` to run against a live Redis.
    fn live_store() -> Option<RedisBlockStore> {
        let uri = std::env::var("VENN_TEST_REDIS_URI").ok()?;
        let config = crate::config::RedisConfig {
            uri,
            cluster: Vec::new(),
            namespace: format!("test-{}", uuid::Uuid::new_v4()),
        };
        Some(RedisBlockStore::new(Redis::new(&config).unwrap()))
    }

    fn header(number: u64, hash: u8, parent: u8) -> Arc<Entry> {
        let value = RawValue::from_string(format!(r#"{{"number":{number}}}"#)).unwrap();
        Entry::new(Hash32([hash; 32]), number, Some(Hash32([parent; 32])), value)
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn test_live_parent_mismatch_purges_by_number() {
        let Some(store) = live_store() else {
            return;
        };
        let ctx = RequestCtx::new(Arc::new(ChainConfig::new("reorg", 1, 12.0)));

        store.put(&ctx, EntryKind::Header, &[header(100, 0xaa, 0x99)]).await.unwrap();
        let stored = store.get(&ctx, EntryKind::Header, &Query::number(100)).await.unwrap();
        assert_eq!(stored.unwrap()[0].hash, Hash32([0xaa; 32]));

        store.put(&ctx, EntryKind::Header, &[header(101, 0xbb, 0xcc)]).await.unwrap();
        let purged = store.get(&ctx, EntryKind::Header, &Query::number(100)).await.unwrap();
        assert!(purged.is_none());

        let old_hash = Query::Hash(Hash32([0xaa; 32]));
        let kept = store.get(&ctx, EntryKind::Header, &old_hash).await.unwrap();
        assert_eq!(kept.unwrap()[0].number, 100);

        let fresh = store.get(&ctx, EntryKind::Header, &Query::number(101)).await.unwrap();
        assert_eq!(fresh.unwrap()[0].hash, Hash32([0xbb; 32]));
    }
}
