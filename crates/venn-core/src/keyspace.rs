//! Redis connection pool and the key layout shared by every Redis-backed store.
//!
//! ```text
//! venn:{ns}:{chain}:head:stream
//! venn:{ns}:{chain}:entries:by_hash:{kind}:{hash}:{value|number}
//! venn:{ns}:{chain}:entries:by_number:{kind}:{n}:{value|hash}
//! venn:{ns}:{chain}:entries:{kind}:head
//! venn:{ns}:election:leader
//! venn:{ns}:election:health:{uuid}
//! venn:{ns}:election:outlaws
//! venn:{ns}:leader:redsync
//! ```

use deadpool_redis::{Config, Connection, Pool, Runtime};

use crate::{config::RedisConfig, errors::StoreError};

#[derive(Clone)]
pub struct Redis {
    pool: Pool,
    namespace: String,
}

impl Redis {
    /// Builds the pool. Connections are established lazily.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Build`] when no URI is configured or the URI is invalid.
    pub fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let uri = config
            .connection_uri()
            .ok_or_else(|| StoreError::Build("redis uri or cluster is required".to_string()))?;
        let pool = Config::from_url(uri)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Build(e.to_string()))?;
        Ok(Self { pool, namespace: config.namespace.clone() })
    }

    /// Checks out a pooled connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Pool`] if no connection can be made.
    pub async fn conn(&self) -> Result<Connection, StoreError> {
        Ok(self.pool.get().await?)
    }

    #[must_use]
    pub fn keys(&self) -> Keys {
        Keys { namespace: self.namespace.clone() }
    }
}

/// Key builder for one namespace.
#[derive(Debug, Clone)]
pub struct Keys {
    namespace: String,
}

impl Keys {
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into() }
    }

    #[must_use]
    pub fn head_stream(&self, chain: &str) -> String {
        format!("venn:{}:{chain}:head:stream", self.namespace)
    }

    #[must_use]
    pub fn entry_by_hash(&self, chain: &str, kind: &str, hash: &str, field: &str) -> String {
        format!("venn:{}:{chain}:entries:by_hash:{kind}:{hash}:{field}", self.namespace)
    }

    #[must_use]
    pub fn entry_by_number(&self, chain: &str, kind: &str, number: u64, field: &str) -> String {
        format!("venn:{}:{chain}:entries:by_number:{kind}:{number}:{field}", self.namespace)
    }

    /// Prefix matching every by-number key of a kind, for reorg purges.
    #[must_use]
    pub fn entries_by_number_prefix(&self, chain: &str, kind: &str) -> String {
        format!("venn:{}:{chain}:entries:by_number:{kind}:", self.namespace)
    }

    #[must_use]
    pub fn entries_head(&self, chain: &str, kind: &str) -> String {
        format!("venn:{}:{chain}:entries:{kind}:head", self.namespace)
    }

    #[must_use]
    pub fn election_leader(&self) -> String {
        format!("venn:{}:election:leader", self.namespace)
    }

    #[must_use]
    pub fn election_health(&self, id: &str) -> String {
        format!("venn:{}:election:health:{id}", self.namespace)
    }

    #[must_use]
    pub fn election_outlaws(&self) -> String {
        format!("venn:{}:election:outlaws", self.namespace)
    }

    #[must_use]
    pub fn leader_lock(&self) -> String {
        format!("venn:{}:leader:redsync", self.namespace)
    }
}
