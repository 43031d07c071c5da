//! Protocol-specific health probes, selected by the chain's protocol tag.
//!
//! Each probe reports the head it observed. The EVM probe also verifies the chain id and is
//! the only one whose verdict gates traffic; the others are informational.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::{
    config::{ChainConfig, Protocol},
    errors::RpcError,
    handler::{call, Handler, RequestCtx},
    utils::parse_hex,
};

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Checks liveness and identity; returns the observed head.
    async fn check(&self, ctx: &RequestCtx, remote: &dyn Handler) -> Result<u64, RpcError>;

    /// Whether a failed check should stop traffic to the remote.
    fn gates_traffic(&self) -> bool {
        false
    }
}

/// Picks the probe registered for the chain's protocol.
#[must_use]
pub fn probe_for(chain: &Arc<ChainConfig>) -> Box<dyn HealthProbe> {
    match chain.protocol {
        Protocol::Evm => Box::new(EvmProbe { chain_id: chain.id }),
        Protocol::Solana => Box::new(SolanaProbe { chain: Arc::clone(chain) }),
        Protocol::Near => Box::new(NearProbe { chain: Arc::clone(chain) }),
        Protocol::Sui => Box::new(SuiProbe { chain: Arc::clone(chain) }),
    }
}

fn quantity(value: &str) -> Result<u64, RpcError> {
    parse_hex(value).ok_or_else(|| RpcError::Internal(format!("invalid quantity {value}")))
}

pub struct EvmProbe {
    chain_id: u64,
}

#[async_trait]
impl HealthProbe for EvmProbe {
    async fn check(&self, ctx: &RequestCtx, remote: &dyn Handler) -> Result<u64, RpcError> {
        let head: String = call(remote, ctx, "eth_blockNumber", json!([])).await?;
        let head = quantity(&head)?;
        let id: String = call(remote, ctx, "eth_chainId", json!([])).await?;
        let id = quantity(&id)?;
        if id != self.chain_id {
            return Err(RpcError::Internal(format!(
                "chain ID mismatch: expected {}, got {id}",
                self.chain_id
            )));
        }
        Ok(head)
    }

    fn gates_traffic(&self) -> bool {
        true
    }
}

pub struct SolanaProbe {
    chain: Arc<ChainConfig>,
}

#[async_trait]
impl HealthProbe for SolanaProbe {
    async fn check(&self, ctx: &RequestCtx, remote: &dyn Handler) -> Result<u64, RpcError> {
        let settings = self.chain.solana.as_ref();
        let method = match settings.and_then(|s| s.head_method.as_deref()) {
            Some("getSlot") => "getSlot",
            _ => "getBlockHeight",
        };
        let head: u64 = call(remote, ctx, method, json!([])).await?;
        // informational only
        let _ = call::<Value>(remote, ctx, "getHealth", json!([])).await;

        if let Some(expected) = settings.and_then(|s| s.genesis_hash.as_deref()) {
            if let Ok(genesis) = call::<String>(remote, ctx, "getGenesisHash", json!([])).await {
                if !genesis.starts_with(expected) {
                    return Err(RpcError::Internal(format!(
                        "genesis mismatch: expected {expected} got {genesis}"
                    )));
                }
            }
        }
        Ok(head)
    }
}

#[derive(Deserialize)]
struct NearBlock {
    header: NearHeader,
}

#[derive(Deserialize)]
struct NearHeader {
    height: u64,
}

#[derive(Deserialize)]
struct NearStatus {
    #[serde(default)]
    genesis_hash: String,
}

pub struct NearProbe {
    chain: Arc<ChainConfig>,
}

#[async_trait]
impl HealthProbe for NearProbe {
    async fn check(&self, ctx: &RequestCtx, remote: &dyn Handler) -> Result<u64, RpcError> {
        let settings = self.chain.near.as_ref();
        let finality = settings.and_then(|s| s.finality.as_deref()).unwrap_or("final");
        let block: NearBlock =
            call(remote, ctx, "block", json!({ "finality": finality })).await?;

        if let Some(expected) = settings.and_then(|s| s.genesis_hash.as_deref()) {
            if let Ok(status) = call::<NearStatus>(remote, ctx, "status", json!([])).await {
                if !status.genesis_hash.is_empty() && status.genesis_hash != expected {
                    return Err(RpcError::Internal(format!(
                        "genesis mismatch: expected {expected} got {}",
                        status.genesis_hash
                    )));
                }
            }
        }
        Ok(block.header.height)
    }
}

pub struct SuiProbe {
    chain: Arc<ChainConfig>,
}

#[async_trait]
impl HealthProbe for SuiProbe {
    async fn check(&self, ctx: &RequestCtx, remote: &dyn Handler) -> Result<u64, RpcError> {
        let settings = self.chain.sui.as_ref();
        let method = settings
            .and_then(|s| s.head_method.as_deref())
            .unwrap_or("sui_getLatestCheckpointSequenceNumber");
        let latest: String = call(remote, ctx, method, json!([])).await?;
        let head = latest
            .trim()
            .parse::<u64>()
            .map_err(|e| RpcError::Internal(format!("invalid checkpoint {latest}: {e}")))?;

        if let Some(expected) = settings.and_then(|s| s.chain_identifier.as_deref()) {
            if let Ok(id) = call::<String>(remote, ctx, "sui_getChainIdentifier", json!([])).await {
                if id != expected {
                    return Err(RpcError::Internal(format!(
                        "chain identifier mismatch: expected {expected} got {id}"
                    )));
                }
            }
        }
        Ok(head)
    }
}
