use async_trait::async_trait;
use serde_json::Value;

use crate::{
    errors::RpcError,
    handler::{Handler, RequestCtx, SharedHandler},
    head::SharedHeadStore,
    types::{Payload, RpcRequest},
    utils::{BlockId, BlockRef, BlockTag},
};

/// Where a method carries its block selector.
enum Selector {
    Positional(usize),
    LogFrom,
}

fn selector(method: &str) -> Option<Selector> {
    let at = match method {
        "eth_getBlockByNumber"
        | "eth_getTransactionByBlockNumberAndIndex"
        | "eth_getBlockReceipts"
        | "eth_getBlockTransactionCountByNumber"
        | "eth_getUncleCountByBlockNumber"
        | "debug_getRawHeader"
        | "debug_getRawBlock" => 0,
        "eth_getTransactionCount"
        | "eth_getBalance"
        | "eth_getCode"
        | "eth_call"
        | "eth_estimateGas"
        | "eth_createAccessList" => 1,
        "eth_getStorageAt" => 2,
        "eth_getLogs" => return Some(Selector::LogFrom),
        _ => return None,
    };
    Some(Selector::Positional(at))
}

/// Rejects requests for blocks older than `head - max_look_back`.
///
/// `earliest` always counts as too old. Hash selectors, other tags and omitted selectors pass.
/// Nothing is rejected until a head is known.
pub struct LookBack {
    max_look_back: u64,
    store: SharedHeadStore,
    next: SharedHandler,
}

impl LookBack {
    #[must_use]
    pub fn new(max_look_back: u64, store: SharedHeadStore, next: SharedHandler) -> Self {
        Self { max_look_back, store, next }
    }

    fn referenced(req: &RpcRequest, selector: &Selector) -> Result<Option<BlockId>, RpcError> {
        let params = req.positional()?;
        let value = match selector {
            Selector::Positional(at) => params.get(*at),
            Selector::LogFrom => {
                params.first().and_then(Value::as_object).and_then(|f| f.get("fromBlock"))
            }
        };
        value
            .filter(|v| !v.is_null())
            .map(BlockId::from_value)
            .transpose()
            .map_err(|e| RpcError::InvalidParams(format!("invalid block parameter: {e}")))
    }

    async fn check(&self, ctx: &RequestCtx, block: BlockId) -> Result<(), RpcError> {
        let number = match block {
            BlockId::Ref(BlockRef::Number(n)) => n,
            BlockId::Ref(BlockRef::Tag(BlockTag::Earliest)) => 0,
            _ => return Ok(()),
        };
        let head = self.store.get(&ctx.chain).await?;
        if head == 0 {
            return Ok(());
        }
        if number < head.saturating_sub(self.max_look_back) {
            return Err(RpcError::BlockTooOld(number));
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for LookBack {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        if let Some(selector) = selector(&req.method) {
            if let Some(block) = Self::referenced(&req, &selector)? {
                self.check(ctx, block).await?;
            }
        }
        self.next.serve(ctx, req).await
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.next.close().await
    }
}
