//! Chain head tracking.
//!
//! A [`HeadStore`] holds the newest known block number per chain. Heads only move forward
//! and every change is broadcast to watchers. Watchers see the latest value only: a slow
//! watcher misses intermediate heads and is expected to fill gaps by range itself.
//!
//! - [`AtomicHeadStore`]: process-local
//! - [`RedisHeadStore`]: shared through a Redis stream so followers see the leader's head
//! - [`HeadReplacer`]: rewrites `latest` block selectors to the stored head
//! - [`Stalker`]: leader-only poller that publishes heads

mod atomic;
mod delay;
mod redis;
mod replacer;
mod stalker;

pub use atomic::AtomicHeadStore;
pub use delay::DelayTracker;
pub use redis::RedisHeadStore;
pub use replacer::HeadReplacer;
pub use stalker::Stalker;

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::{config::ChainConfig, errors::StoreError};

#[async_trait]
pub trait HeadStore: Send + Sync {
    /// Current head, 0 when nothing has been stored yet.
    async fn get(&self, chain: &ChainConfig) -> Result<u64, StoreError>;

    /// Publishes a head and returns the previous one. Lower heads are ignored.
    async fn put(&self, chain: &ChainConfig, head: u64) -> Result<u64, StoreError>;

    /// Watches head changes for a chain.
    fn on(&self, chain: &ChainConfig) -> HeadWatch;
}

pub type SharedHeadStore = Arc<dyn HeadStore>;

/// Receiver side of a head watch.
pub struct HeadWatch {
    rx: watch::Receiver<u64>,
}

impl HeadWatch {
    /// Waits for the next head. Returns `None` once the store is gone.
    pub async fn next(&mut self) -> Option<u64> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    /// The latest head without waiting.
    #[must_use]
    pub fn current(&self) -> u64 {
        *self.rx.borrow()
    }
}

/// Per-chain monotonic cells with change fan-out, shared by the store implementations.
#[derive(Default)]
pub(crate) struct HeadCells {
    cells: DashMap<String, watch::Sender<u64>>,
}

impl HeadCells {
    fn cell(&self, chain: &str) -> watch::Sender<u64> {
        self.cells.entry(chain.to_string()).or_insert_with(|| watch::channel(0).0).clone()
    }

    pub(crate) fn get(&self, chain: &str) -> u64 {
        self.cells.get(chain).map_or(0, |cell| *cell.borrow())
    }

    /// Raises the head if `head` is newer; returns the previous value.
    pub(crate) fn raise(&self, chain: &str, head: u64) -> u64 {
        let cell = self.cell(chain);
        let mut prev = 0;
        cell.send_if_modified(|cur| {
            prev = *cur;
            if head > *cur {
                *cur = head;
                true
            } else {
                false
            }
        });
        prev
    }

    pub(crate) fn watch(&self, chain: &str) -> HeadWatch {
        HeadWatch { rx: self.cell(chain).subscribe() }
    }
}
