use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use super::{BlockStore, Entries, Entry, EntryKind, Query, SharedBlockStore};
use crate::{errors::StoreError, handler::RequestCtx};

type Shared = Result<Option<Entries>, Arc<StoreError>>;

/// Single-flight over an inner store: concurrent gets for the same kind and query share one
/// underlying fetch. The in-flight slot is dropped once the fetch settles, so the next get
/// starts fresh. Each caller waits under its own context.
pub struct Deduper {
    inner: SharedBlockStore,
    inflight: DashMap<String, Arc<OnceCell<Shared>>>,
}

impl Deduper {
    #[must_use]
    pub fn new(inner: SharedBlockStore) -> Self {
        Self { inner, inflight: DashMap::new() }
    }

    #[must_use]
    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }
}

#[async_trait]
impl BlockStore for Deduper {
    async fn get(
        &self,
        ctx: &RequestCtx,
        kind: EntryKind,
        query: &Query,
    ) -> Result<Option<Entries>, StoreError> {
        let key = query.key(kind);
        let cell = Arc::clone(self.inflight.entry(key.clone()).or_default().value());

        // The shared fetch never sees a caller's token or deadline. A caller that ends early
        // drops its wait, and another waiter picks the fetch up.
        let detached = RequestCtx {
            cancel: CancellationToken::new(),
            deadline: None,
            notifier: None,
            ..ctx.clone()
        };
        let waited = ctx
            .run(async {
                let shared = cell
                    .get_or_init(|| async {
                        self.inner.get(&detached, kind, query).await.map_err(Arc::new)
                    })
                    .await;
                Ok(shared.clone())
            })
            .await;
        self.inflight
            .remove_if(&key, |_, current| Arc::ptr_eq(current, &cell) && current.initialized());

        waited.map_err(StoreError::Origin)?.map_err(StoreError::Shared)
    }

    async fn put(
        &self,
        ctx: &RequestCtx,
        kind: EntryKind,
        entries: &[Arc<Entry>],
    ) -> Result<(), StoreError> {
        self.inner.put(ctx, kind, entries).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ChainConfig,
        errors::RpcError,
        types::{null_payload, Hash32},
    };
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    struct Slow {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BlockStore for Slow {
        async fn get(
            &self,
            _: &RequestCtx,
            _: EntryKind,
            query: &Query,
        ) -> Result<Option<Entries>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            match *query {
                Query::Hash(_) => Err(StoreError::Origin(RpcError::Timeout)),
                Query::Range { start, .. } => {
                    Ok(Some(vec![Entry::new(Hash32([1; 32]), start, None, null_payload())]))
                }
            }
        }

        async fn put(
            &self,
            _: &RequestCtx,
            _: EntryKind,
            _: &[Arc<Entry>],
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn ctx() -> RequestCtx {
        RequestCtx::new(Arc::new(ChainConfig::new("test", 1, 12.0)))
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_fetch() {
        let slow = Arc::new(Slow { calls: AtomicUsize::new(0) });
        let deduper = Deduper::new(slow.clone());
        let ctx = ctx();

        let query = Query::number(5);
        let (a, b, c) = tokio::join!(
            deduper.get(&ctx, EntryKind::Header, &query),
            deduper.get(&ctx, EntryKind::Header, &query),
            deduper.get(&ctx, EntryKind::Header, &query),
        );
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
        for got in [a, b, c] {
            assert_eq!(got.unwrap().unwrap()[0].number, 5);
        }
        assert_eq!(deduper.inflight(), 0);

        deduper.get(&ctx, EntryKind::Logs, &query).await.unwrap();
        assert_eq!(slow.calls.load(Ordering::SeqCst), 2, "kinds are keyed apart");
        deduper.get(&ctx, EntryKind::Header, &query).await.unwrap();
        assert_eq!(slow.calls.load(Ordering::SeqCst), 3, "settled fetches are not reused");
    }

    /// Inner store that stops as soon as its context is cancelled.
    struct Cancellable {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BlockStore for Cancellable {
        async fn get(
            &self,
            ctx: &RequestCtx,
            _: EntryKind,
            query: &Query,
        ) -> Result<Option<Entries>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let number = match *query {
                Query::Range { start, .. } => start,
                Query::Hash(_) => 0,
            };
            ctx.run(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Some(vec![Entry::new(Hash32([3; 32]), number, None, null_payload())]))
            })
            .await
            .map_err(StoreError::Origin)
        }

        async fn put(
            &self,
            _: &RequestCtx,
            _: EntryKind,
            _: &[Arc<Entry>],
        ) -> Result<(), StoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_fail_others() {
        let inner = Arc::new(Cancellable { calls: AtomicUsize::new(0) });
        let deduper = Deduper::new(inner.clone());
        let first = ctx();
        let second = ctx();
        let query = Query::number(8);

        let cancel = first.cancel.clone();
        let (a, b, ()) = tokio::join!(
            deduper.get(&first, EntryKind::Header, &query),
            deduper.get(&second, EntryKind::Header, &query),
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                cancel.cancel();
            },
        );

        assert!(matches!(a, Err(StoreError::Origin(RpcError::Cancelled))));
        assert_eq!(b.unwrap().unwrap()[0].number, 8);
        assert!(inner.calls.load(Ordering::SeqCst) <= 2);
        assert_eq!(deduper.inflight(), 0);
    }

    #[tokio::test]
    async fn test_shared_error_keeps_origin() {
        let deduper = Deduper::new(Arc::new(Slow { calls: AtomicUsize::new(0) }));
        let query = Query::Hash(Hash32([2; 32]));
        let ctx = ctx();
        let (a, b) = tokio::join!(
            deduper.get(&ctx, EntryKind::Header, &query),
            deduper.get(&ctx, EntryKind::Header, &query),
        );
        for err in [a.unwrap_err(), b.unwrap_err()] {
            assert!(matches!(RpcError::from(err), RpcError::Timeout));
        }
    }
}
