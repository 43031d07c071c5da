//! Block store contract and its layers.

mod compound;
mod dedupe;
mod lru;
mod origin;
mod redis;

pub use compound::CompoundStore;
pub use dedupe::Deduper;
pub use lru::LruStore;
pub(crate) use origin::header_entry;
pub use origin::OriginStore;
pub use redis::RedisBlockStore;

use async_trait::async_trait;
use std::{fmt, sync::Arc};

use crate::{
    errors::StoreError,
    handler::RequestCtx,
    types::{Hash32, Payload},
};

/// The cache namespace dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Header,
    Logs,
    Receipts,
}

impl EntryKind {
    pub const ALL: [Self; 3] = [Self::Header, Self::Logs, Self::Receipts];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Logs => "logs",
            Self::Receipts => "receipts",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Header => 0,
            Self::Logs => 1,
            Self::Receipts => 2,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cached value for one block.
///
/// `hash` is zero when the value does not reveal its block hash (e.g. an empty receipt list);
/// such entries are only indexed by number.
#[derive(Debug)]
pub struct Entry {
    pub hash: Hash32,
    pub number: u64,
    /// Set for headers; drives reorg detection on put.
    pub parent: Option<Hash32>,
    pub value: Payload,
}

impl Entry {
    #[must_use]
    pub fn new(hash: Hash32, number: u64, parent: Option<Hash32>, value: Payload) -> Arc<Self> {
        Arc::new(Self { hash, number, parent, value })
    }
}

/// What to look up: a single block by hash, or a contiguous inclusive range of numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Hash(Hash32),
    Range { start: u64, end: u64 },
}

impl Query {
    #[must_use]
    pub fn number(n: u64) -> Self {
        Self::Range { start: n, end: n }
    }

    /// A range whose end precedes its start matches nothing.
    #[must_use]
    pub fn is_empty_range(&self) -> bool {
        matches!(self, Self::Range { start, end } if end < start)
    }

    /// Single-flight key, unique per kind and query.
    #[must_use]
    pub fn key(&self, kind: EntryKind) -> String {
        match self {
            Self::Hash(hash) => format!("{kind}.{hash}"),
            Self::Range { start, end } => format!("{kind}.{start}.{end}"),
        }
    }
}

pub type Entries = Vec<Arc<Entry>>;

/// A layer of the block cache.
///
/// `get` returns `Ok(None)` on a miss. A hit may be empty: the origin answers "nothing there"
/// with an empty list, and that is an answer, not a miss.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// # Errors
    ///
    /// Backend failures. Callers treat them like a miss and try the next layer.
    async fn get(
        &self,
        ctx: &RequestCtx,
        kind: EntryKind,
        query: &Query,
    ) -> Result<Option<Entries>, StoreError>;

    /// # Errors
    ///
    /// Backend failures while writing.
    async fn put(&self, ctx: &RequestCtx, kind: EntryKind, entries: &[Arc<Entry>])
        -> Result<(), StoreError>;
}

pub type SharedBlockStore = Arc<dyn BlockStore>;
