//! Integration tests for the venn pipeline.
//!
//! Upstreams are mockito servers (see [`mock_rpc`]); whole runtimes are driven through the
//! HTTP router with the helpers in [`harness`].
//!
//! - `failover_tests`: priority failover and user-error short circuit
//! - `cache_tests`: block cache hits and reorg purges
//! - `pipeline_tests`: look-back, client rate limits, locally answered methods
//! - `subscription_tests`: `newHeads` delivery in process and over a live WebSocket
//! - `election_tests`: stalking under an election lease
//!
//! ```bash
//! cargo test --package tests
//! ```

pub mod harness;
pub mod mock_rpc;

#[cfg(test)]
mod cache_tests;

#[cfg(test)]
mod election_tests;

#[cfg(test)]
mod failover_tests;

#[cfg(test)]
mod pipeline_tests;

#[cfg(test)]
mod subscription_tests;
