use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, value::RawValue};

use crate::{
    errors::RpcError,
    handler::{Handler, RequestCtx, SharedHandler},
    types::{is_null, Hash32, Payload, RpcRequest},
    utils::{array_items, members, BlockRef},
};

#[derive(Deserialize)]
struct FullBlock<'a> {
    #[serde(borrow)]
    transactions: Vec<&'a RawValue>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogTx {
    transaction_hash: Hash32,
}

fn malformed(what: &str, err: impl std::fmt::Display) -> RpcError {
    RpcError::Internal(format!("cannot forge receipts, malformed {what}: {err}"))
}

/// Receipt member name for a transaction member, or `None` to drop it.
fn receipt_member(key: &str) -> Option<&str> {
    match key {
        "hash" => Some("transactionHash"),
        "blockHash" | "transactionIndex" | "to" | "from" | "type" | "blockNumber" => Some(key),
        _ => None,
    }
}

/// Writes one receipt: the copied transaction members in their original order, then `logs`.
fn write_receipt(
    out: &mut String,
    tx: &RawValue,
    logs: &[&RawValue],
    owners: &[Hash32],
) -> Result<(), RpcError> {
    let mut hash = None;
    out.push('{');
    for (key, value) in members(tx)? {
        let Some(name) = receipt_member(&key) else { continue };
        if key == "hash" {
            hash = Some(
                serde_json::from_str::<Hash32>(value.get())
                    .map_err(|e| malformed("transaction", e))?,
            );
        }
        out.push_str(&serde_json::to_string(name).map_err(|e| malformed("transaction", e))?);
        out.push(':');
        out.push_str(value.get());
        out.push(',');
    }
    let hash = hash.ok_or_else(|| malformed("transaction", "missing hash"))?;

    out.push_str("\"logs\":[");
    let mut first = true;
    for (log, owner) in logs.iter().zip(owners) {
        if *owner != hash {
            continue;
        }
        if !first {
            out.push(',');
        }
        first = false;
        out.push_str(log.get());
    }
    out.push_str("]}");
    Ok(())
}

/// Joins a full block and its logs into per-transaction receipts.
fn forge(block: &RawValue, logs: &RawValue) -> Result<Payload, RpcError> {
    let FullBlock { transactions } =
        serde_json::from_str(block.get()).map_err(|e| malformed("block", e))?;
    let logs = if is_null(logs) { Vec::new() } else { array_items(logs)? };
    let owners = logs
        .iter()
        .map(|log| {
            serde_json::from_str::<LogTx>(log.get())
                .map(|l| l.transaction_hash)
                .map_err(|e| malformed("log", e))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = String::with_capacity(block.get().len() / 2 + logs.len() * 512);
    out.push('[');
    for (i, tx) in transactions.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_receipt(&mut out, tx, &logs, &owners)?;
    }
    out.push(']');
    RawValue::from_string(out).map_err(|e| malformed("receipts", e))
}

/// Synthesizes `eth_getBlockReceipts` from `eth_getLogs` and the full block, for chains whose
/// nodes lack the method. Only active when the chain sets `forge_block_receipts`.
pub struct Forger {
    next: SharedHandler,
}

impl Forger {
    #[must_use]
    pub fn new(next: SharedHandler) -> Self {
        Self { next }
    }

    async fn receipts(&self, ctx: &RequestCtx, req: &RpcRequest) -> Result<Payload, RpcError> {
        let [selector] = req.positional()? else {
            return Err(RpcError::InvalidParams("expected 1 parameter".to_string()));
        };
        let selector = BlockRef::from_value(selector)
            .map_err(|e| RpcError::InvalidParams(format!("invalid block parameter: {e}")))?
            .to_value();

        let logs = RpcRequest::new(
            "eth_getLogs",
            json!([{ "fromBlock": selector, "toBlock": selector }]),
        );
        let block = RpcRequest::new("eth_getBlockByNumber", json!([selector, true]));
        let (logs, block) =
            tokio::try_join!(self.next.serve(ctx, logs), self.next.serve(ctx, block))?;

        if is_null(&block) {
            return Ok(block);
        }
        forge(&block, &logs)
    }
}

#[async_trait]
impl Handler for Forger {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        if req.method == "eth_getBlockReceipts" && ctx.chain.forge_block_receipts {
            return self.receipts(ctx, &req).await;
        }
        self.next.serve(ctx, req).await
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.next.close().await
    }
}
