use async_trait::async_trait;
use serde_json::Value;
use std::ops::RangeInclusive;

use super::SharedHeadStore;
use crate::{
    errors::RpcError,
    handler::{Handler, RequestCtx, SharedHandler},
    types::{to_payload, Payload, RpcRequest},
    utils::{to_hex, BlockRef},
};

/// Pins `latest` block selectors to the stored head and answers identity and head queries
/// locally.
///
/// Other tags (`earliest`, `pending`, `safe`, `finalized`, `latestExecuted`) pass through
/// untouched. Until a head is known every request passes through unchanged.
pub struct HeadReplacer {
    store: SharedHeadStore,
    next: SharedHandler,
}

/// Parses a selector and reports whether it means `latest`.
fn selects_latest(value: Option<&Value>) -> Result<bool, RpcError> {
    match value {
        None => Ok(true),
        Some(v) => BlockRef::from_value(v)
            .map(BlockRef::is_latest)
            .map_err(|e| RpcError::InvalidParams(format!("invalid block parameter: {e}"))),
    }
}

impl HeadReplacer {
    #[must_use]
    pub fn new(store: SharedHeadStore, next: SharedHandler) -> Self {
        Self { store, next }
    }

    async fn head(&self, ctx: &RequestCtx) -> Result<u64, RpcError> {
        Ok(self.store.get(&ctx.chain).await?)
    }

    /// Replaces the positional block selector at `index` when it is `latest`.
    async fn pin_positional(
        &self,
        ctx: &RequestCtx,
        req: &mut RpcRequest,
        index: usize,
        arity: RangeInclusive<usize>,
        expected: &str,
    ) -> Result<(), RpcError> {
        let params = req.positional()?;
        if !arity.contains(&params.len()) {
            return Err(RpcError::InvalidParams(format!("expected {expected}")));
        }
        if !selects_latest(params.get(index))? {
            return Ok(());
        }
        let head = self.head(ctx).await?;
        if head == 0 {
            return Ok(());
        }
        req.positional_mut()?[index] = Value::String(to_hex(head));
        Ok(())
    }

    async fn pin_log_range(&self, ctx: &RequestCtx, req: &mut RpcRequest) -> Result<(), RpcError> {
        let params = req.positional()?;
        if params.len() != 1 {
            return Err(RpcError::InvalidParams("expected 1 parameter".to_string()));
        }
        let Some(filter) = params[0].as_object() else {
            return Err(RpcError::InvalidParams("expected filter object".to_string()));
        };
        if filter.get("blockHash").is_some_and(|h| !h.is_null()) {
            return Ok(());
        }
        let from_latest = selects_latest(filter.get("fromBlock"))?;
        let to_latest = selects_latest(filter.get("toBlock"))?;
        if !from_latest && !to_latest {
            return Ok(());
        }
        let head = self.head(ctx).await?;
        if head == 0 {
            return Ok(());
        }
        if let Some(filter) = req.positional_mut()?[0].as_object_mut() {
            if from_latest {
                filter.insert("fromBlock".to_string(), Value::String(to_hex(head)));
            }
            if to_latest {
                filter.insert("toBlock".to_string(), Value::String(to_hex(head)));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Handler for HeadReplacer {
    async fn serve(&self, ctx: &RequestCtx, mut req: RpcRequest) -> Result<Payload, RpcError> {
        match req.method.as_str() {
            "eth_chainId" => return to_payload(&to_hex(ctx.chain.id)),
            "net_version" => return to_payload(&ctx.chain.id.to_string()),
            "eth_blockNumber" => {
                let head = self.head(ctx).await?;
                if head != 0 {
                    return to_payload(&to_hex(head));
                }
            }
            "eth_getBlockByNumber" => {
                self.pin_positional(ctx, &mut req, 0, 2..=2, "2 parameters").await?;
            }
            "eth_getBlockReceipts" => {
                self.pin_positional(ctx, &mut req, 0, 1..=1, "1 parameter").await?;
            }
            "eth_call" => {
                self.pin_positional(ctx, &mut req, 1, 2..=3, "2-3 parameters").await?;
            }
            "eth_getLogs" => self.pin_log_range(ctx, &mut req).await?,
            _ => {}
        }
        self.next.serve(ctx, req).await
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.next.close().await
    }
}
