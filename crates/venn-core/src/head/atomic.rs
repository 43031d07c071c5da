use async_trait::async_trait;

use super::{HeadCells, HeadStore, HeadWatch};
use crate::{config::ChainConfig, errors::StoreError};

/// In-process head store.
#[derive(Default)]
pub struct AtomicHeadStore {
    cells: HeadCells,
}

impl AtomicHeadStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HeadStore for AtomicHeadStore {
    async fn get(&self, chain: &ChainConfig) -> Result<u64, StoreError> {
        Ok(self.cells.get(&chain.name))
    }

    async fn put(&self, chain: &ChainConfig, head: u64) -> Result<u64, StoreError> {
        Ok(self.cells.raise(&chain.name, head))
    }

    fn on(&self, chain: &ChainConfig) -> HeadWatch {
        self.cells.watch(&chain.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_put_is_monotonic() {
        let store = AtomicHeadStore::new();
        let chain = ChainConfig::new("eth", 1, 12.0);
        assert_eq!(store.get(&chain).await.unwrap(), 0);
        assert_eq!(store.put(&chain, 10).await.unwrap(), 0);
        assert_eq!(store.put(&chain, 5).await.unwrap(), 10);
        assert_eq!(store.get(&chain).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn test_watchers_see_latest() {
        let store = AtomicHeadStore::new();
        let chain = ChainConfig::new("eth", 1, 12.0);
        let other = ChainConfig::new("base", 8453, 2.0);
        let mut watch = store.on(&chain);

        store.put(&chain, 1).await.unwrap();
        store.put(&chain, 2).await.unwrap();
        store.put(&chain, 3).await.unwrap();
        store.put(&other, 99).await.unwrap();
        assert_eq!(watch.next().await, Some(3));

        let pending = tokio::time::timeout(Duration::from_millis(20), watch.next()).await;
        assert!(pending.is_err(), "stale put must not notify");
        store.put(&chain, 2).await.unwrap();
        let pending = tokio::time::timeout(Duration::from_millis(20), watch.next()).await;
        assert!(pending.is_err());
    }
}
