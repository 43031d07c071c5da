//! Block, log and receipt cache in front of the cluster.
//!
//! ```text
//!            Cacher (eth_getBlockByNumber / ByHash / Receipts / Logs)
//!                │
//!            Deduper (one in-flight fetch per (kind, query))
//!                │
//!            CompoundStore ── back-fills earlier layers on a later hit
//!          ┌─────┼──────────────┐
//!       LruStore  RedisBlockStore  OriginStore ── inner pipeline
//! ```
//!
//! Entries are indexed both by block hash and by block number. A put whose parent hash does
//! not match the stored hash one block below purges every by-number entry of that kind, so a
//! reorg never serves the old branch by number.

mod cacher;
pub mod store;

pub use cacher::{Cacher, LogFilter};
pub use store::{
    BlockStore, CompoundStore, Deduper, Entries, Entry, EntryKind, LruStore, OriginStore, Query,
    RedisBlockStore, SharedBlockStore,
};
