//! Assembly and lifecycle of everything the server runs.
//!
//! [`VennRuntimeBuilder`] turns an [`AppConfig`](crate::config::AppConfig) into chain
//! pipelines, stores and an election. [`VennRuntime::start`] launches the background work
//! (election loop, head followers, stalkers under a lease, health gauges) and
//! [`VennRuntime::shutdown`] drains and closes it.

mod builder;
mod lifecycle;
mod pipeline;

pub use builder::VennRuntimeBuilder;
pub use lifecycle::{VennRuntime, DRAIN_TIMEOUT};
pub use pipeline::{ChainPipeline, Chains};

use thiserror::Error;

use crate::errors::{ElectionError, RpcError, StoreError};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("no chains configured")]
    NoChains,

    #[error("chain {chain}: remote {remote}: {source}")]
    Remote {
        chain: String,
        remote: String,
        #[source]
        source: RpcError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Election(#[from] ElectionError),
}
