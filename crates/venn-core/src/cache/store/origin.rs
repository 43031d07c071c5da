use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, value::RawValue};
use std::{collections::BTreeMap, sync::Arc};

use super::{BlockStore, Entries, Entry, EntryKind, Query};
use crate::{
    errors::StoreError,
    handler::{RequestCtx, SharedHandler},
    types::{is_null, Hash32, Payload, RpcRequest},
    utils::{array_items, join_array, parse_hex, to_hex},
};

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeaderMeta {
    hash: Option<Hash32>,
    number: Option<String>,
    parent_hash: Option<Hash32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogMeta {
    block_hash: Hash32,
    block_number: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptMeta {
    block_hash: Hash32,
}

fn malformed(what: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Malformed(format!("{what}: {err}"))
}

fn number(hex: &str) -> Result<u64, StoreError> {
    parse_hex(hex).ok_or_else(|| malformed("block number", hex))
}

/// Turns a full block into a header entry. Pending blocks (no hash) yield `None`.
pub(crate) fn header_entry(block: Payload) -> Result<Option<Arc<Entry>>, StoreError> {
    if is_null(&block) {
        return Ok(None);
    }
    let meta: HeaderMeta = serde_json::from_str(block.get()).map_err(|e| malformed("block", e))?;
    let (Some(hash), Some(n)) = (meta.hash, meta.number) else {
        return Ok(None);
    };
    if hash.is_zero() {
        return Ok(None);
    }
    Ok(Some(Entry::new(hash, number(&n)?, meta.parent_hash, block)))
}

/// Last layer of the compound store: fetches through the inner pipeline. Never misses; an
/// absent block is an empty answer. Puts are no-ops.
pub struct OriginStore {
    next: SharedHandler,
}

impl OriginStore {
    #[must_use]
    pub fn new(next: SharedHandler) -> Self {
        Self { next }
    }

    async fn fetch(
        &self,
        ctx: &RequestCtx,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Payload, StoreError> {
        self.next.serve(ctx, RpcRequest::new(method, params)).await.map_err(StoreError::Origin)
    }

    async fn header_by_hash(&self, ctx: &RequestCtx, hash: Hash32) -> Result<Entries, StoreError> {
        let block = self.fetch(ctx, "eth_getBlockByHash", json!([hash, true])).await?;
        Ok(header_entry(block)?.filter(|entry| entry.hash == hash).into_iter().collect())
    }

    async fn headers(&self, ctx: &RequestCtx, start: u64, end: u64) -> Result<Entries, StoreError> {
        let mut out = Vec::new();
        for n in start..=end {
            let block = self.fetch(ctx, "eth_getBlockByNumber", json!([to_hex(n), true])).await?;
            match header_entry(block)? {
                Some(entry) => out.push(entry),
                None => return Ok(Vec::new()),
            }
        }
        Ok(out)
    }

    async fn receipts(
        &self,
        ctx: &RequestCtx,
        start: u64,
        end: u64,
    ) -> Result<Entries, StoreError> {
        let mut out = Vec::new();
        for n in start..=end {
            let receipts = self.fetch(ctx, "eth_getBlockReceipts", json!([to_hex(n)])).await?;
            if is_null(&receipts) {
                return Ok(Vec::new());
            }
            let items = array_items(&receipts).map_err(|e| malformed("receipts", e))?;
            let hash = match items.first() {
                Some(first) => {
                    let meta: ReceiptMeta =
                        serde_json::from_str(first.get()).map_err(|e| malformed("receipt", e))?;
                    meta.block_hash
                }
                None => Hash32::default(),
            };
            out.push(Entry::new(hash, n, None, receipts));
        }
        Ok(out)
    }

    async fn logs_by_hash(&self, ctx: &RequestCtx, hash: Hash32) -> Result<Entries, StoreError> {
        let logs = self.fetch(ctx, "eth_getLogs", json!([{ "blockHash": hash }])).await?;
        if is_null(&logs) {
            return Ok(Vec::new());
        }
        let items = array_items(&logs).map_err(|e| malformed("logs", e))?;
        let Some(first) = items.first() else {
            return Ok(Vec::new());
        };
        let meta: LogMeta = serde_json::from_str(first.get()).map_err(|e| malformed("log", e))?;
        if meta.block_hash != hash {
            return Ok(Vec::new());
        }
        let n = number(&meta.block_number)?;
        Ok(vec![Entry::new(hash, n, None, logs)])
    }

    /// Fetches a log range in one call and splits it into one entry per block that has logs.
    async fn logs(&self, ctx: &RequestCtx, start: u64, end: u64) -> Result<Entries, StoreError> {
        let filter = json!([{ "fromBlock": to_hex(start), "toBlock": to_hex(end) }]);
        let logs = self.fetch(ctx, "eth_getLogs", filter).await?;
        if is_null(&logs) {
            return Ok(Vec::new());
        }
        split_logs(&logs)
    }
}

pub(crate) fn split_logs(logs: &RawValue) -> Result<Entries, StoreError> {
    let mut blocks: BTreeMap<u64, (Hash32, Vec<&RawValue>)> = BTreeMap::new();
    for log in array_items(logs).map_err(|e| malformed("logs", e))? {
        let meta: LogMeta = serde_json::from_str(log.get()).map_err(|e| malformed("log", e))?;
        let n = number(&meta.block_number)?;
        blocks.entry(n).or_insert_with(|| (meta.block_hash, Vec::new())).1.push(log);
    }
    blocks
        .into_iter()
        .map(|(n, (hash, items))| {
            let value = join_array(items).map_err(|e| malformed("logs", e))?;
            Ok(Entry::new(hash, n, None, value))
        })
        .collect()
}

#[async_trait]
impl BlockStore for OriginStore {
    async fn get(
        &self,
        ctx: &RequestCtx,
        kind: EntryKind,
        query: &Query,
    ) -> Result<Option<Entries>, StoreError> {
        let entries = match (kind, *query) {
            (EntryKind::Header, Query::Hash(hash)) => self.header_by_hash(ctx, hash).await?,
            (EntryKind::Header, Query::Range { start, end }) => {
                self.headers(ctx, start, end).await?
            }
            (EntryKind::Receipts, Query::Range { start, end }) => {
                self.receipts(ctx, start, end).await?
            }
            (EntryKind::Receipts, Query::Hash(_)) => {
                return Err(StoreError::Unsupported("receipts by hash"))
            }
            (EntryKind::Logs, Query::Hash(hash)) => self.logs_by_hash(ctx, hash).await?,
            (EntryKind::Logs, Query::Range { start, end }) => self.logs(ctx, start, end).await?,
        };
        Ok(Some(entries))
    }

    async fn put(&self, _: &RequestCtx, _: EntryKind, _: &[Arc<Entry>]) -> Result<(), StoreError> {
        Ok(())
    }
}
