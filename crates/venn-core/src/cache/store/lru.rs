use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::{num::NonZeroUsize, sync::Arc};

use super::{BlockStore, Entries, Entry, EntryKind, Query};
use crate::{errors::StoreError, handler::RequestCtx, types::Hash32};

struct Tier {
    by_hash: LruCache<Hash32, Arc<Entry>>,
    by_number: LruCache<u64, Arc<Entry>>,
}

impl Tier {
    fn new(capacity: NonZeroUsize) -> Self {
        Self { by_hash: LruCache::new(capacity), by_number: LruCache::new(capacity) }
    }

    /// Drops the by-number index. By-hash entries stay valid for their own hash.
    fn purge(&mut self) {
        self.by_number.clear();
    }

    fn range(&mut self, start: u64, end: u64) -> Option<Entries> {
        let mut out = Vec::new();
        for n in start..=end {
            out.push(Arc::clone(self.by_number.get(&n)?));
        }
        Some(out)
    }

    fn insert(&mut self, entry: &Arc<Entry>) -> bool {
        let reorged = match (entry.parent, entry.number.checked_sub(1)) {
            (Some(parent), Some(below)) => {
                self.by_number.peek(&below).is_some_and(|stored| stored.hash != parent)
            }
            _ => false,
        };
        if reorged {
            self.purge();
        }
        if !entry.hash.is_zero() {
            self.by_hash.put(entry.hash, Arc::clone(entry));
        }
        self.by_number.put(entry.number, Arc::clone(entry));
        reorged
    }
}

/// In-process layer of one chain, bounded per kind by entry count.
pub struct LruStore {
    tiers: [Mutex<Tier>; 3],
}

impl LruStore {
    /// # Errors
    ///
    /// Returns [`StoreError::Build`] for a zero capacity.
    pub fn new(capacity: usize) -> Result<Self, StoreError> {
        let capacity = NonZeroUsize::new(capacity)
            .ok_or_else(|| StoreError::Build("lru size must be non-zero".to_string()))?;
        Ok(Self { tiers: EntryKind::ALL.map(|_| Mutex::new(Tier::new(capacity))) })
    }

    fn tier(&self, kind: EntryKind) -> &Mutex<Tier> {
        &self.tiers[kind.index()]
    }

    #[must_use]
    pub fn len(&self, kind: EntryKind) -> usize {
        self.tier(kind).lock().by_number.len()
    }
}

#[async_trait]
impl BlockStore for LruStore {
    async fn get(
        &self,
        _ctx: &RequestCtx,
        kind: EntryKind,
        query: &Query,
    ) -> Result<Option<Entries>, StoreError> {
        let mut tier = self.tier(kind).lock();
        Ok(match *query {
            Query::Hash(hash) => tier.by_hash.get(&hash).map(|entry| vec![Arc::clone(entry)]),
            Query::Range { start, end } => tier.range(start, end),
        })
    }

    async fn put(
        &self,
        ctx: &RequestCtx,
        kind: EntryKind,
        entries: &[Arc<Entry>],
    ) -> Result<(), StoreError> {
        let mut tier = self.tier(kind).lock();
        for entry in entries {
            if tier.insert(entry) {
                tracing::info!(
                    chain = %ctx.chain.name,
                    kind = %kind,
                    number = entry.number,
                    "parent hash mismatch, purged lru entries"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ChainConfig, types::to_payload};

    fn ctx() -> RequestCtx {
        RequestCtx::new(Arc::new(ChainConfig::new("test", 1, 12.0)))
    }

    fn header(number: u64, hash: u8, parent: u8) -> Arc<Entry> {
        Entry::new(
            Hash32([hash; 32]),
            number,
            Some(Hash32([parent; 32])),
            to_payload(&serde_json::json!({ "number": number })).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_get_by_hash_and_range() {
        let store = LruStore::new(16).unwrap();
        let ctx = ctx();
        store.put(&ctx, EntryKind::Header, &[header(10, 1, 0), header(11, 2, 1)]).await.unwrap();

        let by_hash = Query::Hash(Hash32([2; 32]));
        let hit = store.get(&ctx, EntryKind::Header, &by_hash).await.unwrap();
        assert_eq!(hit.unwrap()[0].number, 11);

        let both = Query::Range { start: 10, end: 11 };
        let range = store.get(&ctx, EntryKind::Header, &both).await.unwrap();
        assert_eq!(range.unwrap().len(), 2);

        let holed = Query::Range { start: 10, end: 12 };
        let partial = store.get(&ctx, EntryKind::Header, &holed).await.unwrap();
        assert!(partial.is_none(), "a range with a hole is a miss");

        let other_kind = store.get(&ctx, EntryKind::Logs, &Query::number(10)).await.unwrap();
        assert!(other_kind.is_none());
    }

    #[tokio::test]
    async fn test_parent_mismatch_purges_kind() {
        let store = LruStore::new(16).unwrap();
        let ctx = ctx();
        store.put(&ctx, EntryKind::Header, &[header(10, 1, 0), header(11, 2, 1)]).await.unwrap();
        store.put(&ctx, EntryKind::Logs, &[header(10, 1, 0)]).await.unwrap();

        store.put(&ctx, EntryKind::Header, &[header(11, 9, 7)]).await.unwrap();
        assert_eq!(store.len(EntryKind::Header), 1);
        assert!(store.get(&ctx, EntryKind::Header, &Query::number(10)).await.unwrap().is_none());

        let old_hash = Query::Hash(Hash32([1; 32]));
        let kept = store.get(&ctx, EntryKind::Header, &old_hash).await.unwrap();
        assert_eq!(kept.unwrap()[0].number, 10, "by-hash entries survive the purge");
        assert_eq!(store.len(EntryKind::Logs), 1, "other kinds are untouched");

        let fresh = store.get(&ctx, EntryKind::Header, &Query::number(11)).await.unwrap().unwrap();
        assert_eq!(fresh[0].hash, Hash32([9; 32]));
    }

    #[tokio::test]
    async fn test_zero_hash_only_indexed_by_number() {
        let store = LruStore::new(4).unwrap();
        let ctx = ctx();
        let entry = Entry::new(Hash32::default(), 5, None, crate::types::empty_array_payload());
        store.put(&ctx, EntryKind::Receipts, &[entry]).await.unwrap();
        let zero = Query::Hash(Hash32::default());
        let by_hash = store.get(&ctx, EntryKind::Receipts, &zero).await.unwrap();
        assert!(by_hash.is_none());
        assert!(store.get(&ctx, EntryKind::Receipts, &Query::number(5)).await.unwrap().is_some());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(LruStore::new(0), Err(StoreError::Build(_))));
    }
}
