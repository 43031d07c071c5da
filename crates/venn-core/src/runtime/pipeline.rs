use std::{collections::HashMap, sync::Arc};

use crate::{
    cache::{Cacher, CompoundStore, Deduper, LruStore, OriginStore, SharedBlockStore},
    cluster::Cluster,
    config::{ChainConfig, Protocol},
    handler::SharedHandler,
    head::{HeadReplacer, SharedHeadStore, Stalker},
    middleware::{Forger, LookBack, RequestMetrics},
    remote::Remote,
    subscription::Subcenter,
};

use super::RuntimeError;

/// Everything needed to serve one chain.
///
/// ```text
///   RequestMetrics ─ Subcenter ─ Forger ─ HeadReplacer ─ Cacher ─ LookBack ─ Cluster
///                    └──────────── evm only ───────────────┘
/// ```
///
/// The stalker polls through `Cacher ─ Cluster`, skipping head replacement so `latest`
/// reaches the remotes.
pub struct ChainPipeline {
    chain: Arc<ChainConfig>,
    cluster: Arc<Cluster>,
    handler: SharedHandler,
    stalker: Option<Arc<Stalker>>,
    subcenter: Option<Arc<Subcenter>>,
}

impl ChainPipeline {
    /// Assembles the remotes and the chain stages. `shared` is the cross-instance block store
    /// layered between the in-process LRU and the origin, when Redis is configured.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::Remote`] when a remote cannot be built and
    /// [`RuntimeError::Store`] for an invalid cache size.
    pub fn build(
        chain: Arc<ChainConfig>,
        heads: &SharedHeadStore,
        shared: Option<&SharedBlockStore>,
        lru_size: usize,
    ) -> Result<Self, RuntimeError> {
        let cluster = Arc::new(Cluster::new(chain.name.clone()));
        for config in &chain.remotes {
            let remote = Remote::build(&chain, config, heads).map_err(|source| {
                RuntimeError::Remote {
                    chain: chain.name.clone(),
                    remote: config.name.clone(),
                    source,
                }
            })?;
            cluster.add_remote(Arc::new(remote));
        }

        let mut handler: SharedHandler = cluster.clone();
        if chain.max_block_look_back > 0 {
            handler =
                Arc::new(LookBack::new(chain.max_block_look_back, Arc::clone(heads), handler));
        }

        let mut stalker = None;
        let mut subcenter = None;
        if chain.protocol == Protocol::Evm {
            let mut layers: Vec<(&'static str, SharedBlockStore)> =
                vec![("lru", Arc::new(LruStore::new(lru_size)?))];
            if let Some(shared) = shared {
                layers.push(("redis", Arc::clone(shared)));
            }
            layers.push(("origin", Arc::new(OriginStore::new(handler.clone()))));
            let compound: SharedBlockStore = Arc::new(CompoundStore::new(layers));
            let store: SharedBlockStore = Arc::new(Deduper::new(compound));

            let cacher: SharedHandler = Arc::new(Cacher::new(store, handler));
            if chain.stalk_enabled() {
                stalker = Some(Arc::new(Stalker::new(
                    Arc::clone(&chain),
                    Arc::clone(heads),
                    cacher.clone(),
                )));
            }

            handler = Arc::new(HeadReplacer::new(Arc::clone(heads), cacher));
            handler = Arc::new(Forger::new(handler));
            let center = Arc::new(Subcenter::new(Arc::clone(heads), handler));
            handler = center.clone();
            subcenter = Some(center);
        }

        handler = Arc::new(RequestMetrics::new(handler));

        tracing::info!(
            chain = %chain.name,
            protocol = %chain.protocol,
            remotes = cluster.len(),
            stalk = stalker.is_some(),
            "chain pipeline assembled"
        );
        Ok(Self { chain, cluster, handler, stalker, subcenter })
    }

    #[must_use]
    pub fn chain(&self) -> &Arc<ChainConfig> {
        &self.chain
    }

    #[must_use]
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// The chain's entry point.
    #[must_use]
    pub fn handler(&self) -> &SharedHandler {
        &self.handler
    }

    #[must_use]
    pub fn stalker(&self) -> Option<&Arc<Stalker>> {
        self.stalker.as_ref()
    }

    #[must_use]
    pub fn subcenter(&self) -> Option<&Arc<Subcenter>> {
        self.subcenter.as_ref()
    }

    /// Wraps the entry point with server-wide stages.
    pub(crate) fn wrap(&mut self, layer: impl FnOnce(SharedHandler) -> SharedHandler) {
        self.handler = layer(Arc::clone(&self.handler));
    }
}

/// Chain pipelines addressable by name or alias.
#[derive(Default)]
pub struct Chains {
    all: Vec<Arc<ChainPipeline>>,
    by_name: HashMap<String, Arc<ChainPipeline>>,
}

impl Chains {
    /// Registers a pipeline under its name and aliases.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ConfigValidation`] when a name or alias is already taken.
    pub fn insert(&mut self, pipeline: ChainPipeline) -> Result<(), RuntimeError> {
        let pipeline = Arc::new(pipeline);
        let chain = pipeline.chain();
        for name in std::iter::once(&chain.name).chain(chain.aliases.iter()) {
            if self.by_name.insert(name.clone(), Arc::clone(&pipeline)).is_some() {
                return Err(RuntimeError::ConfigValidation(format!(
                    "duplicate chain name or alias: {name}"
                )));
            }
        }
        self.all.push(pipeline);
        Ok(())
    }

    /// Looks a chain up by name first, then by alias.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<&Arc<ChainPipeline>> {
        self.by_name.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ChainPipeline>> {
        self.all.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.all.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}
