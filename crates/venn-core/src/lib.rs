//! # Venn Core
//!
//! Per-chain JSON-RPC pipeline behind the venn reverse proxy.
//!
//! - **[`cluster`]**: priority failover with round-robin inside a priority
//! - **[`remote`]**: one upstream with its filter, rate limit, health doctor, validator and
//!   backoff stages
//! - **[`head`]**: head store, `latest` replacement and the leader-only stalker
//! - **[`cache`]**: block, log and receipt cache with reorg purges
//! - **[`subscription`]**: `newHeads` and `logs` subscriptions driven by the head store
//! - **[`election`]**: leader election and leases for singleton work
//! - **[`runtime`]**: assembly of all of the above from [`config::AppConfig`]
//!
//! ## Request flow
//!
//! ```text
//! Client ──► Waiter ──► ClientLimiter ──► RequestMetrics
//!                                              │
//!                 Subcenter ◄──────────────────┘
//!                     │
//!                 Forger ──► HeadReplacer ──► Cacher ──► LookBack ──► Cluster
//!                                                                        │
//!                                     Remote (Filter ─ … ─ ConnectionProxy)◄┘
//! ```

pub mod cache;
pub mod cluster;
pub mod config;
pub mod election;
pub mod errors;
pub mod handler;
pub mod head;
pub mod keyspace;
pub mod metrics;
pub mod middleware;
pub mod remote;
pub mod runtime;
pub mod subscription;
pub mod types;
pub mod utils;
