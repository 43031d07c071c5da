//! One upstream endpoint and the middleware stack in front of it.
//!
//! [`Remote::build`] assembles, outer to inner:
//!
//! ```text
//!   LookBack (when the remote sets its own look-back limit)
//!     └─ Filter ─ RateLimiter ─ Doctor ─ Validator ─ Backer
//!          └─ Logger ─ Collector ─ InputData (optional) ─ ConnectionProxy
//! ```
//!
//! Every stage implements [`Handler`]; the [`crate::cluster::Cluster`] only sees the
//! outermost one.

pub mod backer;
pub mod doctor;
pub mod filter;
pub mod http_client;
pub mod input_data;
pub mod observe;
pub mod probes;
pub mod proxy;
pub mod rate_limiter;
pub mod validator;
pub mod websocket;

pub use backer::Backer;
pub use doctor::{Doctor, HealthStatus};
pub use filter::Filter;
pub use input_data::InputData;
pub use observe::{Collector, Logger};
pub use probes::{probe_for, HealthProbe};
pub use proxy::ConnectionProxy;
pub use rate_limiter::RateLimiter;
pub use validator::Validator;

use async_trait::async_trait;
use std::sync::Arc;

use crate::{
    config::{ChainConfig, RemoteConfig},
    errors::RpcError,
    handler::{Handler, RequestCtx, SharedHandler},
    head::SharedHeadStore,
    middleware::LookBack,
    types::{Payload, RpcRequest},
};

/// A fully assembled upstream endpoint.
pub struct Remote {
    name: String,
    priority: i64,
    doctor: Arc<Doctor>,
    backer: Arc<Backer>,
    handler: SharedHandler,
}

impl Remote {
    /// Builds the stack for `config`. Starts the health-check loop, so it must run inside a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when the transport cannot be constructed (bad headers, TLS setup).
    pub fn build(
        chain: &Arc<ChainConfig>,
        config: &RemoteConfig,
        heads: &SharedHeadStore,
    ) -> Result<Self, RpcError> {
        let mut handler: SharedHandler = Arc::new(ConnectionProxy::new(config)?);
        if config.send_data_and_input {
            handler = Arc::new(InputData::new(handler));
        }
        handler = Arc::new(Collector::new(&chain.name, &config.name, handler));
        handler = Arc::new(Logger::new(&chain.name, &config.name, handler));

        let backer = Arc::new(Backer::new(config, handler));
        handler = Arc::new(Validator::new(chain.head_old_after(), backer.clone()));

        let doctor = Arc::new(Doctor::new(Arc::clone(chain), config, probe_for(chain), handler));
        handler = doctor.clone();

        let limit = config.rate_limit.clone().unwrap_or_default();
        handler = Arc::new(RateLimiter::new(&limit, handler));
        handler = Arc::new(Filter::new(config.methods.clone(), handler));

        // the chain-wide limit is enforced in front of the cluster; only a remote's own,
        // tighter limit needs a guard here
        let look_back =
            if config.max_block_look_back > 0 { config.effective_look_back(chain) } else { 0 };
        if look_back > 0 {
            handler = Arc::new(LookBack::new(look_back, Arc::clone(heads), handler));
        }

        tracing::debug!(
            chain = %chain.name,
            remote = %config.name,
            priority = config.priority,
            look_back,
            "remote assembled"
        );
        Ok(Self { name: config.name.clone(), priority: config.priority, doctor, backer, handler })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn priority(&self) -> i64 {
        self.priority
    }

    #[must_use]
    pub fn health(&self) -> HealthStatus {
        self.doctor.status()
    }

    /// Healthy according to the doctor and not backing off.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.health() == HealthStatus::Healthy && self.backer.is_happy()
    }
}

#[async_trait]
impl Handler for Remote {
    async fn serve(&self, ctx: &RequestCtx, req: RpcRequest) -> Result<Payload, RpcError> {
        self.handler.serve(ctx, req).await
    }

    async fn close(&self) -> Result<(), RpcError> {
        self.handler.close().await
    }
}
