use ahash::AHashSet;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, value::RawValue, Map, Value};

use super::store::{header_entry, Entries, EntryKind, Query, SharedBlockStore};
use crate::{
    errors::RpcError,
    handler::{Handler, RequestCtx, SharedHandler},
    types::{null_payload, Address, Hash32, Payload, RpcRequest},
    utils::{array_items, join_array, reduce_transactions, BlockId, BlockRef},
};

/// Widest `eth_getLogs` range (`to - from`) served through the cache.
pub const MAX_LOG_RANGE: u64 = 10;

fn invalid(msg: &str) -> RpcError {
    RpcError::InvalidParams(msg.to_string())
}

fn single(entries: Option<Entries>) -> Payload {
    match entries.as_deref() {
        Some([entry]) => entry.value.clone(),
        _ => null_payload(),
    }
}

#[derive(Deserialize)]
struct LogView {
    address: Option<Address>,
    #[serde(default)]
    topics: Vec<Hash32>,
}

/// `eth_getLogs` address and topic constraints, applied to logs read from the cache.
///
/// A log matches when its address is in the address set and, for every position `i`, its
/// topic `i` is in set `i`. An empty set matches anything.
#[derive(Debug, Default)]
pub struct LogFilter {
    addresses: AHashSet<Address>,
    topics: Vec<AHashSet<Hash32>>,
}

impl LogFilter {
    /// Compiles the `address` and `topics` members of a filter object.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidParams`] for malformed addresses or topics.
    pub fn compile(filter: &Map<String, Value>) -> Result<Self, RpcError> {
        let mut addresses = AHashSet::new();
        match filter.get("address") {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => {
                let address = Address::try_from(s.as_str()).map_err(|_| invalid("bad address"))?;
                addresses.insert(address);
            }
            Some(Value::Array(items)) => {
                for item in items {
                    let s = item.as_str().ok_or_else(|| invalid("bad address"))?;
                    addresses.insert(Address::try_from(s).map_err(|_| invalid("bad address"))?);
                }
            }
            Some(_) => return Err(invalid("bad address")),
        }

        let mut topics = Vec::new();
        match filter.get("topics") {
            None | Some(Value::Null) => {}
            Some(Value::Array(positions)) => {
                for position in positions {
                    topics.push(topic_set(position)?);
                }
            }
            Some(_) => return Err(invalid("bad topics")),
        }
        Ok(Self { addresses, topics })
    }

    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.addresses.is_empty() && self.topics.iter().all(|set| set.is_empty())
    }

    /// Logs that cannot be decoded only match a wildcard filter.
    #[must_use]
    pub fn matches(&self, log: &RawValue) -> bool {
        if self.is_wildcard() {
            return true;
        }
        let Ok(log) = serde_json::from_str::<LogView>(log.get()) else {
            return false;
        };
        if !self.addresses.is_empty()
            && !log.address.is_some_and(|address| self.addresses.contains(&address))
        {
            return false;
        }
        self.topics.iter().enumerate().all(|(i, set)| {
            set.is_empty() || log.topics.get(i).is_some_and(|topic| set.contains(topic))
        })
    }
}

fn topic_set(position: &Value) -> Result<AHashSet<Hash32>, RpcError> {
    let parse = |s: &str| Hash32::try_from(s).map_err(|_| invalid("bad topic"));
    let mut set = AHashSet::new();
    match position {
        Value::Null => {}
        Value::String(s) => {
            set.insert(parse(s)?);
        }
        Value::Array(alternatives) => {
            for alternative in alternatives {
                match alternative {
                    // a null alternative makes the whole position a wildcard
                    Value::Null => return Ok(AHashSet::new()),
                    Value::String(s) => {
                        set.insert(parse(s)?);
                    }
                    _ => return Err(invalid("bad topic")),
                }
            }
        }
        _ => return Err(invalid("bad topic")),
    }
    Ok(set)
}

/// Serves headers, receipts and small log ranges from the block store.
///
/// Requests it cannot answer from the store (tags other than concrete numbers, wide log
/// ranges, every other method) go to `next` untouched.
pub struct Cacher {
    store: SharedBlockStore,
    next: SharedHandler,
}

impl Cacher {
    /// `store` should end in an origin layer over `next`.
    #[must_use]
    pub fn new(store: SharedBlockStore, next: SharedHandler) -> Self {
        Self { store, next }
    }

    async fn block_by_number(
        &self,
        ctx: &RequestCtx,
        req: RpcRequest,
    ) -> Result<Payload, RpcError> {
        let params = req.positional()?;
        let [selector, details] = params else {
            return Err(invalid("expected 2 parameters"));
        };
        let details = details.as_bool().ok_or_else(|| invalid("expected boolean details flag"))?;
        let selector = BlockRef::from_value(selector)
            .map_err(|e| RpcError::InvalidParams(format!("invalid block parameter: {e}")))?;

        let block = match selector {
            BlockRef::Number(n) => {
                single(self.store.get(ctx, EntryKind::Header, &Query::number(n)).await?)
            }
            BlockRef::Tag(tag) => {
                let fetch = RpcRequest::new(req.method.as_str(), json!([tag.as_str(), true]));
                let block = self.next.serve(ctx, fetch).await?;
                self.remember(ctx, &block).await;
                block
            }
        };
        if details {
            Ok(block)
        } else {
            reduce_transactions(&block)
        }
    }

    /// Best-effort write-back of a block fetched by tag.
    async fn remember(&self, ctx: &RequestCtx, block: &RawValue) {
        match header_entry(block.to_owned()) {
            Ok(Some(entry)) => {
                if let Err(e) = self.store.put(ctx, EntryKind::Header, &[entry]).await {
                    tracing::warn!(chain = %ctx.chain.name, error = %e, "failed to cache block");
                }
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(chain = %ctx.chain.name, error = %e, "block not cacheable"),
        }
    }

    async fn block_by_hash(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        let params = req.positional()?;
        let [hash, details] = params else {
            return Err(invalid("expected 2 parameters"));
        };
        let details = details.as_bool().ok_or_else(|| invalid("expected boolean details flag"))?;
        let hash = hash
            .as_str()
            .and_then(|s| Hash32::try_from(s).ok())
            .ok_or_else(|| invalid("invalid block hash"))?;

        let block = single(self.store.get(ctx, EntryKind::Header, &Query::Hash(hash)).await?);
        if details {
            Ok(block)
        } else {
            reduce_transactions(&block)
        }
    }

    async fn block_receipts(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        let number = match req.positional()? {
            [selector] => BlockId::from_value(selector).ok().and_then(|id| id.number()),
            _ => None,
        };
        match number {
            Some(n) => {
                let entries = self.store.get(ctx, EntryKind::Receipts, &Query::number(n)).await?;
                Ok(single(entries))
            }
            None => self.next.serve(ctx, req).await,
        }
    }

    async fn logs(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        let Some((query, filter)) = log_query(&req)? else {
            return self.next.serve(ctx, req).await;
        };
        let entries = self.store.get(ctx, EntryKind::Logs, &query).await?.unwrap_or_default();

        let mut logs = Vec::new();
        for entry in &entries {
            logs.extend(array_items(&entry.value)?.into_iter().filter(|log| filter.matches(log)));
        }
        join_array(logs)
    }
}

/// The cacheable shape of an `eth_getLogs` call, or `None` to proxy it.
fn log_query(req: &RpcRequest) -> Result<Option<(Query, LogFilter)>, RpcError> {
    let [Value::Object(filter)] = req.positional()? else {
        return Ok(None);
    };
    let Ok(compiled) = LogFilter::compile(filter) else {
        return Ok(None);
    };

    if let Some(hash) = filter.get("blockHash").filter(|v| !v.is_null()) {
        return Ok(hash
            .as_str()
            .and_then(|s| Hash32::try_from(s).ok())
            .map(|hash| (Query::Hash(hash), compiled)));
    }

    let bound = |name: &str| {
        filter.get(name).and_then(|v| BlockRef::from_value(v).ok()).and_then(BlockRef::number)
    };
    Ok(match (bound("fromBlock"), bound("toBlock")) {
        (Some(start), Some(end)) if end >= start && end - start <= MAX_LOG_RANGE => {
            Some((Query::Range { start, end }, compiled))
        }
        _ => None,
    })
}

#[async_trait]
impl Handler for Cacher {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        match req.method.as_str() {
            "eth_getBlockByNumber" => self.block_by_number(ctx, req).await,
            "eth_getBlockByHash" => self.block_by_hash(ctx, req).await,
            "eth_getBlockReceipts" => self.block_receipts(ctx, req).await,
            "eth_getLogs" => self.logs(ctx, req).await,
            _ => self.next.serve(ctx, req).await,
        }
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.next.close().await
    }
}
