use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio_util::sync::CancellationToken;

use super::{DelayTracker, SharedHeadStore};
use crate::{
    config::ChainConfig,
    errors::RpcError,
    handler::{RequestCtx, SharedHandler},
    metrics,
    types::{from_payload, is_null, RpcRequest},
    utils::parse_hex,
};

const MIN_WAIT: Duration = Duration::from_millis(500);

/// Mean delays under this are noise and do not stretch the wait.
const DELAY_SLACK: Duration = Duration::from_millis(250);

#[derive(Deserialize)]
struct BlockStamp {
    number: String,
    timestamp: String,
}

/// Polls the newest block of one chain and publishes it to the head store.
///
/// Only the elected leader stalks; followers learn heads through the store. The poll interval
/// tracks the chain's block time, waking shortly after the next block is expected and
/// stretching by the observed propagation delay.
pub struct Stalker {
    chain: Arc<ChainConfig>,
    store: SharedHeadStore,
    remote: SharedHandler,
    delays: Mutex<DelayTracker>,
}

impl Stalker {
    /// `remote` should reach the cluster without going through head replacement.
    #[must_use]
    pub fn new(chain: Arc<ChainConfig>, store: SharedHeadStore, remote: SharedHandler) -> Self {
        let delays = DelayTracker::new(DelayTracker::DEFAULT_CAPACITY, chain.block_time());
        Self { chain, store, remote, delays: Mutex::new(delays) }
    }

    /// Polls until `lease` is cancelled.
    pub async fn run(&self, lease: &CancellationToken) {
        let ctx = RequestCtx::background(Arc::clone(&self.chain), lease);
        tracing::info!(chain = %self.chain.name, "stalker started");
        loop {
            let wait = match self.tick(&ctx).await {
                Ok(wait) => wait,
                Err(_) if ctx.is_done() => break,
                Err(e) => {
                    tracing::error!(
                        chain = %self.chain.name,
                        error = %e,
                        "failed to get block head"
                    );
                    self.chain.block_time()
                }
            };
            if ctx.sleep(wait).await.is_err() {
                break;
            }
        }
        tracing::info!(chain = %self.chain.name, "stalker stopped");
    }

    /// One poll. Returns how long to wait before the next one.
    ///
    /// # Errors
    ///
    /// Returns the fetch, decode or store error; the caller waits one block time.
    pub async fn tick(&self, ctx: &RequestCtx) -> Result<Duration, RpcError> {
        let block_time = self.chain.block_time();
        let req = RpcRequest::new("eth_getBlockByNumber", json!(["latest", false]));
        let block = self.remote.serve(ctx, req).await?;
        let now = SystemTime::now();

        // some remote is behind; try again next block
        if is_null(&block) {
            return Ok(block_time);
        }

        let stamp: BlockStamp = from_payload(&block)?;
        let (Some(number), Some(timestamp)) =
            (parse_hex(&stamp.number), parse_hex(&stamp.timestamp))
        else {
            return Err(RpcError::Internal("malformed block header".to_string()));
        };
        let next_time = UNIX_EPOCH + Duration::from_secs(timestamp) + block_time;
        let until_next = next_time.duration_since(now).ok();

        let prev = self.store.put(&self.chain, number).await?;

        if number > prev {
            let mean = {
                let mut delays = self.delays.lock();
                if let Some(delay) = until_next.filter(|d| !d.is_zero()) {
                    delays.add(delay);
                }
                delays.mean()
            };
            let mut wait =
                until_next.unwrap_or_default().min(block_time).max(MIN_WAIT).max(block_time / 2);
            if mean > DELAY_SLACK {
                wait += mean * 9 / 10;
            }
            metrics::record_stalker_head(&self.chain.name, number);
            metrics::record_stalker_delay(&self.chain.name, mean);
            tracing::debug!(
                chain = %self.chain.name,
                got = number,
                prev,
                next_wait_ms = wait.as_millis(),
                mean_delay_ms = mean.as_millis(),
                "received new block"
            );
            return Ok(wait);
        }

        if let Some(until) = until_next.filter(|d| !d.is_zero()) {
            tracing::info!(
                chain = %self.chain.name,
                until_ms = until.as_millis(),
                "requested the block too early"
            );
            return Ok(until.max(MIN_WAIT).min(block_time));
        }

        let wait = MIN_WAIT.max(block_time / 4);
        tracing::debug!(
            chain = %self.chain.name,
            got = number,
            prev,
            next_wait_ms = wait.as_millis(),
            "received stale block"
        );
        Ok(wait)
    }
}
