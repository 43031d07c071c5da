use async_trait::async_trait;
use std::sync::Arc;

use super::{BlockStore, Entries, Entry, EntryKind, Query, SharedBlockStore};
use crate::{errors::StoreError, handler::RequestCtx, metrics};

/// Layers tried in order. The first layer that answers wins and every layer before it is
/// back-filled with the answer. A layer error is logged and treated as a miss.
///
/// An answer from any layer but the last counts as a cache hit.
pub struct CompoundStore {
    layers: Vec<(&'static str, SharedBlockStore)>,
}

impl CompoundStore {
    #[must_use]
    pub fn new(layers: Vec<(&'static str, SharedBlockStore)>) -> Self {
        Self { layers }
    }

    async fn backfill(
        &self,
        ctx: &RequestCtx,
        kind: EntryKind,
        upto: usize,
        entries: &[Arc<Entry>],
    ) {
        if entries.is_empty() {
            return;
        }
        for (name, layer) in &self.layers[..upto] {
            if let Err(e) = layer.put(ctx, kind, entries).await {
                tracing::warn!(
                    chain = %ctx.chain.name,
                    layer = *name,
                    kind = %kind,
                    error = %e,
                    "cache backfill failed"
                );
            }
        }
    }
}

#[async_trait]
impl BlockStore for CompoundStore {
    async fn get(
        &self,
        ctx: &RequestCtx,
        kind: EntryKind,
        query: &Query,
    ) -> Result<Option<Entries>, StoreError> {
        if query.is_empty_range() {
            return Ok(Some(Vec::new()));
        }
        let mut last_error = None;
        for (i, (name, layer)) in self.layers.iter().enumerate() {
            match layer.get(ctx, kind, query).await {
                Ok(Some(entries)) => {
                    if i + 1 < self.layers.len() {
                        metrics::record_cache_hit(&ctx.chain.name, kind.as_str());
                    } else {
                        metrics::record_cache_miss(&ctx.chain.name, kind.as_str());
                    }
                    self.backfill(ctx, kind, i, &entries).await;
                    return Ok(Some(entries));
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(
                        chain = %ctx.chain.name,
                        layer = *name,
                        kind = %kind,
                        error = %e,
                        "cache layer failed"
                    );
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        ctx: &RequestCtx,
        kind: EntryKind,
        entries: &[Arc<Entry>],
    ) -> Result<(), StoreError> {
        let mut result = Ok(());
        for (name, layer) in &self.layers {
            if let Err(e) = layer.put(ctx, kind, entries).await {
                tracing::warn!(
                    chain = %ctx.chain.name,
                    layer = *name,
                    error = %e,
                    "cache put failed"
                );
                result = Err(e);
            }
        }
        result
    }
}
