use std::sync::Arc;

use crate::{
    cache::{RedisBlockStore, SharedBlockStore},
    config::AppConfig,
    election::Election,
    head::{AtomicHeadStore, RedisHeadStore, SharedHeadStore},
    keyspace::Redis,
    middleware::{ClientLimiter, Waiter},
};

use super::{lifecycle::VennRuntime, ChainPipeline, Chains, RuntimeError};

/// Builder for a [`VennRuntime`].
///
/// ```no_run
/// # use venn_core::{config::AppConfig, runtime::VennRuntimeBuilder};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = AppConfig::load()?;
/// let runtime = VennRuntimeBuilder::new().with_config(config).build()?;
/// runtime.start().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct VennRuntimeBuilder {
    config: Option<AppConfig>,
    heads: Option<SharedHeadStore>,
    election: Option<Election>,
}

impl VennRuntimeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Uses `heads` instead of the store derived from config.
    #[must_use]
    pub fn with_head_store(mut self, heads: SharedHeadStore) -> Self {
        self.heads = Some(heads);
        self
    }

    /// Uses `election` instead of the configured strategy.
    #[must_use]
    pub fn with_election(mut self, election: Election) -> Self {
        self.election = Some(election);
        self
    }

    /// Builds every chain pipeline. Background work starts with [`VennRuntime::start`].
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError`] when config is missing or invalid, no chain is configured,
    /// Redis cannot be set up, or a remote cannot be built.
    pub fn build(self) -> Result<VennRuntime, RuntimeError> {
        let config = self
            .config
            .ok_or_else(|| RuntimeError::ConfigValidation("no configuration provided".into()))?;
        config.validate().map_err(RuntimeError::ConfigValidation)?;
        if config.chains.is_empty() {
            return Err(RuntimeError::NoChains);
        }

        let redis = config.redis.as_ref().map(Redis::new).transpose()?;

        let mut redis_heads = None;
        let heads: SharedHeadStore = match (self.heads, &redis) {
            (Some(heads), _) => heads,
            (None, Some(redis)) => {
                let store = Arc::new(RedisHeadStore::new(redis.clone()));
                redis_heads = Some(Arc::clone(&store));
                store
            }
            (None, None) => Arc::new(AtomicHeadStore::new()),
        };
        let shared: Option<SharedBlockStore> = redis
            .as_ref()
            .map(|redis| Arc::new(RedisBlockStore::new(redis.clone())) as SharedBlockStore);

        let election = match self.election {
            Some(election) => election,
            None => Election::from_config(&config.election, redis.as_ref())?,
        };

        let waiter = Waiter::new();
        let limiter = config.ratelimit.as_ref().map(|c| Arc::new(ClientLimiter::new(c)));

        let mut chains = Chains::default();
        for chain in &config.chains {
            let mut pipeline = ChainPipeline::build(
                Arc::new(chain.clone()),
                &heads,
                shared.as_ref(),
                config.cache.lru_size,
            )?;
            if let Some(limiter) = &limiter {
                pipeline.wrap(|next| limiter.layer(next));
            }
            pipeline.wrap(|next| waiter.layer(next));
            chains.insert(pipeline)?;
        }

        tracing::info!(
            chains = chains.len(),
            redis = redis.is_some(),
            client_ratelimit = limiter.is_some(),
            "venn runtime initialized"
        );
        Ok(VennRuntime::new(config, chains, heads, redis_heads, election, waiter, limiter))
    }
}
