use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{
    errors::RpcError,
    handler::{Handler, RequestCtx, SharedHandler},
    types::{is_null, null_payload, to_payload, Payload, RpcRequest},
    utils::{parse_hex, to_hex},
};

/// Deadline for a `latest` block query before the remote is considered stale.
const TOO_SLOW: Duration = Duration::from_secs(15);

#[derive(Deserialize)]
struct HeaderFields {
    number: String,
    timestamp: String,
}

#[derive(Debug, Default)]
struct RecordedHead {
    number: u64,
    /// Unix seconds of the recorded block.
    timestamp: u64,
}

/// Checks that a remote's view of the chain keeps moving forward and stays fresh.
///
/// The recorded head only ever increases. `latest` answers below it fail with
/// [`RpcError::HeadJumpedBackwards`]; answers older than `old` fail with
/// [`RpcError::HeadOld`] carrying the data so the cluster can still use it as a last resort.
pub struct Validator {
    old: Duration,
    head: Mutex<RecordedHead>,
    next: SharedHandler,
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

fn head_old(data: Payload) -> RpcError {
    RpcError::HeadOld { data: Some(data) }
}

impl Validator {
    #[must_use]
    pub fn new(old: Duration, next: SharedHandler) -> Self {
        Self { old, head: Mutex::new(RecordedHead::default()), next }
    }

    #[must_use]
    pub fn recorded_head(&self) -> u64 {
        self.head.lock().number
    }

    fn update_head(&self, number: u64, timestamp: u64) -> Result<(), RpcError> {
        let mut head = self.head.lock();
        if number < head.number {
            return Err(RpcError::HeadJumpedBackwards { recorded: head.number, observed: number });
        }
        if number > head.number {
            head.number = number;
            head.timestamp = timestamp;
        } else if timestamp < head.timestamp {
            head.timestamp = timestamp;
        }
        let age = unix_now().saturating_sub(head.timestamp);
        if Duration::from_secs(age) > self.old {
            return Err(RpcError::HeadOld { data: None });
        }
        Ok(())
    }

    /// Returns the number of a `latest` block after running it through the head checks.
    fn observe(&self, block: &Payload) -> Result<u64, RpcError> {
        if is_null(block) {
            return Err(RpcError::HeadOld { data: None });
        }
        let fields: HeaderFields = serde_json::from_str(block.get())
            .map_err(|e| RpcError::Internal(format!("expected block: {e}")))?;
        let number = parse_hex(&fields.number)
            .ok_or_else(|| RpcError::Internal(format!("invalid block number {}", fields.number)))?;
        let timestamp = parse_hex(&fields.timestamp).ok_or_else(|| {
            RpcError::Internal(format!("invalid block timestamp {}", fields.timestamp))
        })?;
        self.update_head(number, timestamp)?;
        Ok(number)
    }

    async fn latest_block(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        let too_slow = tokio::time::Instant::now() + TOO_SLOW;
        let caller_first = ctx.deadline.is_some_and(|d| d < too_slow);
        let ctx = ctx.clone().with_deadline(too_slow);

        let block = match ctx.run(self.next.serve(&ctx, req)).await {
            Ok(block) => block,
            Err(RpcError::DeadlineExceeded) if !caller_first => {
                return Err(RpcError::HeadOld { data: None });
            }
            Err(e) => return Err(e),
        };
        match self.observe(&block) {
            Ok(_) => Ok(block),
            Err(RpcError::HeadOld { .. }) => Err(head_old(block)),
            Err(e) => Err(e),
        }
    }
}

fn queries_latest(req: &RpcRequest) -> bool {
    req.params.get(0).and_then(Value::as_str) == Some("latest")
}

#[async_trait]
impl Handler for Validator {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        match req.method.as_str() {
            "eth_getBlockByNumber" => {
                if queries_latest(&req) {
                    return self.latest_block(ctx, req).await;
                }
                let block = self.next.serve(ctx, req).await?;
                if is_null(&block) {
                    return Err(head_old(block));
                }
                Ok(block)
            }
            "eth_blockNumber" => {
                let latest = RpcRequest::new("eth_getBlockByNumber", json!(["latest", false]));
                let block = match self.latest_block(ctx, latest).await {
                    Ok(block) => block,
                    Err(RpcError::HeadOld { data: Some(block) }) => {
                        let number = self.number_of(&block);
                        return Err(head_old(to_payload(&to_hex(number))?));
                    }
                    Err(e) => return Err(e),
                };
                to_payload(&to_hex(self.number_of(&block)))
            }
            "eth_getBlockByHash" | "eth_getLogs" | "eth_getBlockReceipts" => {
                let result = self.next.serve(ctx, req).await?;
                if is_null(&result) {
                    return Err(head_old(null_payload()));
                }
                Ok(result)
            }
            _ => self.next.serve(ctx, req).await,
        }
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.next.close().await
    }
}

impl Validator {
    fn number_of(&self, block: &Payload) -> u64 {
        serde_json::from_str::<HeaderFields>(block.get())
            .ok()
            .and_then(|f| parse_hex(&f.number))
            .unwrap_or_else(|| self.recorded_head())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ChainConfig, handler::FnHandler};
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    fn ctx() -> RequestCtx {
        RequestCtx::new(Arc::new(ChainConfig::new("test", 1, 12.0)))
    }

    fn remote(number: Arc<AtomicU64>, age_secs: u64) -> SharedHandler {
        FnHandler::shared(move |_, req| {
            let n = number.load(Ordering::SeqCst);
            async move {
                match req.method.as_str() {
                    "eth_getBlockByNumber" => to_payload(&json!({
                        "number": to_hex(n),
                        "timestamp": to_hex(unix_now() - age_secs),
                        "hash": "0xaa",
                    })),
                    _ => to_payload(&Value::Null),
                }
            }
        })
    }

    #[tokio::test]
    async fn test_block_number_goes_through_latest_block() {
        let number = Arc::new(AtomicU64::new(0x10));
        let validator = Validator::new(Duration::from_secs(60), remote(number, 0));
        let res = validator.serve(&ctx(), RpcRequest::new("eth_blockNumber", json!([]))).await;
        assert_eq!(res.unwrap().get(), r#""0x10""#);
        assert_eq!(validator.recorded_head(), 16);
    }

    #[tokio::test]
    async fn test_head_never_moves_backwards() {
        let number = Arc::new(AtomicU64::new(100));
        let validator = Validator::new(Duration::from_secs(60), remote(Arc::clone(&number), 0));
        let latest = || RpcRequest::new("eth_getBlockByNumber", json!(["latest", false]));

        validator.serve(&ctx(), latest()).await.unwrap();
        number.store(99, Ordering::SeqCst);
        let err = validator.serve(&ctx(), latest()).await.unwrap_err();
        assert!(matches!(err, RpcError::HeadJumpedBackwards { recorded: 100, observed: 99 }));
        assert_eq!(validator.recorded_head(), 100);

        number.store(101, Ordering::SeqCst);
        validator.serve(&ctx(), latest()).await.unwrap();
        assert_eq!(validator.recorded_head(), 101);
    }

    #[tokio::test]
    async fn test_stale_latest_is_head_old_with_data() {
        let number = Arc::new(AtomicU64::new(5));
        let validator = Validator::new(Duration::from_secs(60), remote(number, 600));
        let err = validator
            .serve(&ctx(), RpcRequest::new("eth_getBlockByNumber", json!(["latest", false])))
            .await
            .unwrap_err();
        match err {
            RpcError::HeadOld { data: Some(block) } => assert!(block.get().contains("0xaa")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_null_results_signal_head_old() {
        let validator =
            Validator::new(Duration::from_secs(60), remote(Arc::new(AtomicU64::new(1)), 0));
        for method in ["eth_getLogs", "eth_getBlockByHash", "eth_getBlockReceipts"] {
            let err =
                validator.serve(&ctx(), RpcRequest::new(method, json!([]))).await.unwrap_err();
            assert!(err.is_head_old(), "{method}");
        }
        let passthrough = validator.serve(&ctx(), RpcRequest::new("eth_getCode", json!([]))).await;
        assert_eq!(passthrough.unwrap().get(), "null");
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_latest_maps_to_head_old() {
        let slow = FnHandler::shared(|_, _| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            to_payload("late")
        });
        let validator = Validator::new(Duration::from_secs(60), slow);
        let err = validator
            .serve(&ctx(), RpcRequest::new("eth_getBlockByNumber", json!(["latest", true])))
            .await
            .unwrap_err();
        assert!(err.is_head_old());
    }
}
