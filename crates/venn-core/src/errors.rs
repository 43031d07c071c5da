//! Error taxonomy for the request pipeline.
//!
//! Every stage returns [`RpcError`]. The [`ErrorClass`] of an error decides what happens next:
//!
//! | Class | Backer | Cluster |
//! |-------|--------|---------|
//! | [`ErrorClass::User`] | treated as success | returned to the client, no failover |
//! | [`ErrorClass::RateLimit`] | rate-limit backoff | fail over |
//! | [`ErrorClass::Node`] | exponential error backoff | fail over |
//! | [`ErrorClass::HeadOld`] | treated as success | fail over, best-effort data when exhausted |
//! | [`ErrorClass::Unknown`] | treated as success | fail over |
//!
//! Codes follow EIP-1474.

use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

use crate::types::{JsonRpcError, Payload};

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const SERVER_ERROR: i32 = -32000;
pub const RESOURCE_NOT_FOUND: i32 = -32001;
pub const RESOURCE_UNAVAILABLE: i32 = -32002;
pub const LIMIT_EXCEEDED: i32 = -32005;
/// Code used when the client itself is throttled.
pub const CLIENT_RATE_LIMITED: i32 = 429;

/// How a failure should influence backoff and failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input or a cancelled request; the remote did nothing wrong.
    User,
    /// Upstream throttled us (http 429, -32005, "limit"/"rate" in the message).
    RateLimit,
    /// Transport failures and http errors other than 429/400/413.
    Node,
    /// Remote answered with data older than the known head.
    HeadOld,
    /// Anything else; fail over but do not penalize.
    Unknown,
}

#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// JSON-RPC error object, either relayed from a remote or produced locally with a code.
    #[error("{message}")]
    JsonRpc { code: i32, message: String, data: Option<Value> },

    #[error("http status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("remote is rate limited")]
    RateLimited,

    #[error("remote is unhealthy")]
    Unhealthy,

    #[error("remote is unhealthy (backoff active)")]
    BackingOff,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("head jumped backwards")]
    HeadJumpedBackwards { recorded: u64, observed: u64 },

    /// The remote's answer is stale; `data` is what it returned, kept for best-effort replies.
    #[error("head old")]
    HeadOld { data: Option<Payload> },

    #[error("block number, {0}, is too old")]
    BlockTooOld(u64),

    #[error("{0}")]
    InvalidParams(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    MethodNotFound(String),

    #[error("notifications not supported")]
    NotificationsUnsupported,

    #[error("chain not found: {0}")]
    ChainNotFound(String),

    #[error("rate limit hit")]
    ClientRateLimited { wait_ms: u64, key: String },

    #[error("leadership lost")]
    LostLeadership,

    #[error("handler is closed")]
    Closed,

    #[error("{0}")]
    Internal(String),
}

impl RpcError {
    /// Builds a relayed error object.
    #[must_use]
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc { code, message: message.into(), data: None }
    }

    /// The code that goes on the wire for this error.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::MethodNotAllowed | Self::InvalidRequest(_) | Self::ChainNotFound(_) => {
                INVALID_REQUEST
            }
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::MethodNotFound(_) | Self::NotificationsUnsupported => METHOD_NOT_FOUND,
            Self::BlockTooOld(_) => SERVER_ERROR,
            Self::ClientRateLimited { .. } => CLIENT_RATE_LIMITED,
            Self::Http { .. }
            | Self::Transport(_)
            | Self::Timeout
            | Self::Cancelled
            | Self::DeadlineExceeded
            | Self::RateLimited
            | Self::Unhealthy
            | Self::BackingOff
            | Self::HeadJumpedBackwards { .. }
            | Self::HeadOld { .. }
            | Self::LostLeadership
            | Self::Closed
            | Self::Internal(_) => INTERNAL_ERROR,
        }
    }

    /// Errors caused by the caller: bad params, unknown methods, cancellation.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        match self {
            Self::Cancelled | Self::DeadlineExceeded | Self::NotificationsUnsupported => true,
            Self::InvalidParams(_)
            | Self::InvalidRequest(_)
            | Self::MethodNotFound(_)
            | Self::ChainNotFound(_)
            | Self::ClientRateLimited { .. } => true,
            Self::JsonRpc { code, message, .. } => match *code {
                METHOD_NOT_FOUND
                | INTERNAL_ERROR
                | RESOURCE_NOT_FOUND
                | RESOURCE_UNAVAILABLE
                | LIMIT_EXCEEDED => false,
                SERVER_ERROR => !contains_ignore_case(message, "not found"),
                _ => true,
            },
            _ => false,
        }
    }

    /// Throttling signals: http 429, -32005, or "limit"/"rate" anywhere in the message.
    #[must_use]
    pub fn is_rate_error(&self) -> bool {
        match self {
            Self::JsonRpc { code: LIMIT_EXCEEDED, .. } | Self::Http { status: 429, .. } => {
                return true;
            }
            _ => {}
        }
        let message = self.to_string();
        contains_ignore_case(&message, "limit") || contains_ignore_case(&message, "rate")
    }

    /// Failures attributable to the remote node or the path to it.
    #[must_use]
    pub fn is_node_error(&self) -> bool {
        match self {
            Self::Http { status, .. } => !matches!(status, 429 | 400 | 413),
            Self::Transport(_) | Self::Timeout | Self::Closed => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_head_old(&self) -> bool {
        matches!(self, Self::HeadOld { .. })
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        if self.is_head_old() {
            ErrorClass::HeadOld
        } else if self.is_user_error() {
            ErrorClass::User
        } else if self.is_rate_error() {
            ErrorClass::RateLimit
        } else if self.is_node_error() {
            ErrorClass::Node
        } else {
            ErrorClass::Unknown
        }
    }

    /// Renders the client-facing error object.
    #[must_use]
    pub fn to_json_rpc_error(&self) -> JsonRpcError {
        match self {
            Self::JsonRpc { code, message, data } => {
                JsonRpcError { code: *code, message: message.clone(), data: data.clone() }
            }
            Self::ClientRateLimited { wait_ms, key } => JsonRpcError {
                code: CLIENT_RATE_LIMITED,
                message: self.to_string(),
                data: Some(json!({ "Wait": wait_ms, "Key": key })),
            },
            other => JsonRpcError { code: other.code(), message: other.to_string(), data: None },
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidParams(err.to_string())
    }
}

/// Failures of the Redis-backed and in-process stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    #[error("redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    #[error("failed to build redis pool: {0}")]
    Build(String),

    #[error("malformed entry: {0}")]
    Malformed(String),

    #[error("origin fetch failed: {0}")]
    Origin(RpcError),

    #[error("{0} is not supported by this store")]
    Unsupported(&'static str),

    /// A single-flight result handed to every waiter.
    #[error(transparent)]
    Shared(Arc<StoreError>),
}

impl From<StoreError> for RpcError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Origin(inner) => inner,
            StoreError::Shared(shared) => match shared.as_ref() {
                StoreError::Origin(inner) => inner.clone(),
                other => Self::Internal(other.to_string()),
            },
            other => Self::Internal(other.to_string()),
        }
    }
}

/// Failures of the leader election backend.
#[derive(Debug, Error)]
pub enum ElectionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("election stopped")]
    Stopped,
}

impl From<deadpool_redis::redis::RedisError> for ElectionError {
    fn from(err: deadpool_redis::redis::RedisError) -> Self {
        Self::Store(StoreError::Redis(err))
    }
}

impl From<deadpool_redis::PoolError> for ElectionError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        Self::Store(StoreError::Pool(err))
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_ascii_lowercase().contains(&needle.to_ascii_lowercase())
}
