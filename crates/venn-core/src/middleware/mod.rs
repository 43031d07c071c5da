//! Chain-level request middleware.
//!
//! Per-remote stages live in [`crate::remote`]; the stages here wrap a whole chain or the whole
//! server:
//!
//! ```text
//!   client ──► Waiter ──► ClientLimiter ──► RequestMetrics ──► chain pipeline
//!                                                               │
//!                                           ... Cacher ──► LookBack ──► Cluster
//! ```
//!
//! - [`Waiter`]: counts in-flight requests so shutdown can drain them
//! - [`ClientLimiter`]: token bucket per client IP, rejects with code 429 and the wait in ms
//! - [`RequestMetrics`]: `rpc` span plus request count and latency
//! - [`Forger`]: builds `eth_getBlockReceipts` from logs and the full block on chains that
//!   set `forge_block_receipts`
//! - [`LookBack`]: rejects blocks older than `head - max_block_look_back`; also mounted per
//!   remote when a remote sets its own limit

pub mod client_limit;
pub mod forger;
pub mod look_back;
pub mod observe;
pub mod waiter;

pub use client_limit::ClientLimiter;
pub use forger::Forger;
pub use look_back::LookBack;
pub use observe::RequestMetrics;
pub use waiter::Waiter;
