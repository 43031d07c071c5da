//! Core type definitions for JSON-RPC framing and chain primitives.
//!
//! # Type Categories
//!
//! ## JSON-RPC Protocol Types
//! - [`JsonRpcRequest`], [`JsonRpcResponse`], [`JsonRpcError`]: wire framing shared by the
//!   client-facing server and the upstream connection proxy
//! - [`RpcRequest`]: the method + params pair that flows through the pipeline
//! - [`Payload`]: an opaque, already-serialized result passed between stages untouched
//!
//! ## Chain Primitives
//! - [`Hash32`], [`Address`]: fixed-size hex values parsed only where semantics need them
//!
//! # Performance Notes
//!
//! Results travel as [`RawValue`] so a block returned by a remote is never decoded into a
//! `serde_json::Value` tree unless a stage needs to look inside it.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{value::RawValue, Value};
use std::{borrow::Cow, fmt, sync::Arc};

use crate::errors::RpcError;

/// JSON-RPC protocol version constant to avoid repeated allocations.
pub const JSONRPC_VERSION: &str = "2.0";

/// Pre-allocated `Cow` for JSON-RPC version - zero allocation for static usage.
pub const JSONRPC_VERSION_COW: Cow<'static, str> = Cow::Borrowed(JSONRPC_VERSION);

/// Opaque serialized JSON result.
pub type Payload = Box<RawValue>;

/// Returns a payload holding JSON `null`.
#[must_use]
pub fn null_payload() -> Payload {
    raw_from_static("null")
}

/// Returns a payload holding an empty JSON array.
#[must_use]
pub fn empty_array_payload() -> Payload {
    raw_from_static("[]")
}

fn raw_from_static(s: &'static str) -> Payload {
    // the default raw value is `null`
    RawValue::from_string(s.to_string()).unwrap_or_default()
}

/// Serializes any value into a [`Payload`].
///
/// # Errors
///
/// Returns [`RpcError::Internal`] if the value cannot be serialized.
pub fn to_payload<T: Serialize + ?Sized>(value: &T) -> Result<Payload, RpcError> {
    serde_json::value::to_raw_value(value)
        .map_err(|e| RpcError::Internal(format!("failed to encode result: {e}")))
}

/// Reports whether a payload is the JSON literal `null`.
#[must_use]
pub fn is_null(payload: &RawValue) -> bool {
    payload.get().trim() == "null"
}

/// Decodes a payload into a concrete type.
///
/// # Errors
///
/// Returns [`RpcError::Internal`] when the payload does not match `T`.
pub fn from_payload<'a, T: Deserialize<'a>>(payload: &'a RawValue) -> Result<T, RpcError> {
    serde_json::from_str(payload.get())
        .map_err(|e| RpcError::Internal(format!("failed to decode result: {e}")))
}

/// A single call flowing through the pipeline.
///
/// Params are kept as a [`Value`] because several stages (head replacement, data/input
/// mirroring, look-back checks) rewrite or inspect them.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    #[must_use]
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self { method: method.into(), params }
    }

    /// Returns the positional parameters, treating a missing params member as empty.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidParams`] when params is an object or scalar.
    pub fn positional(&self) -> Result<&[Value], RpcError> {
        match &self.params {
            Value::Array(items) => Ok(items),
            Value::Null => Ok(&[]),
            _ => Err(RpcError::InvalidParams("expected positional parameters".to_string())),
        }
    }

    /// Mutable counterpart of [`RpcRequest::positional`].
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::InvalidParams`] when params is an object or scalar.
    pub fn positional_mut(&mut self) -> Result<&mut Vec<Value>, RpcError> {
        if self.params.is_null() {
            self.params = Value::Array(Vec::new());
        }
        match &mut self.params {
            Value::Array(items) => Ok(items),
            _ => Err(RpcError::InvalidParams("expected positional parameters".to_string())),
        }
    }

    /// Returns true for `*_subscribe` style methods.
    #[must_use]
    pub fn is_subscribe(&self) -> bool {
        self.method.ends_with("_subscribe")
    }

    /// Returns true for `*_unsubscribe` style methods.
    #[must_use]
    pub fn is_unsubscribe(&self) -> bool {
        self.method.ends_with("_unsubscribe")
    }
}

/// JSON-RPC 2.0 request structure.
///
/// - `jsonrpc`: Uses `Cow<'static, str>` to avoid allocation when constructing with the static
///   version string "2.0".
/// - `id`: Uses `Arc<serde_json::Value>` to enable cheap cloning into responses.
///
/// # Example
///
/// ```
/// use venn_core::types::JsonRpcRequest;
/// use serde_json::json;
///
/// let request = JsonRpcRequest::new("eth_blockNumber", None, json!(1));
///
/// assert_eq!(request.method, "eth_blockNumber");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default = "null_id")]
    pub id: Arc<Value>,
}

fn null_id() -> Arc<Value> {
    Arc::new(Value::Null)
}

impl JsonRpcRequest {
    /// Creates a new JSON-RPC request with zero allocation for the version string.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Value) -> Self {
        Self { jsonrpc: JSONRPC_VERSION_COW, method: method.into(), params, id: Arc::new(id) }
    }

    /// Splits the framing off, leaving the pipeline request.
    #[must_use]
    pub fn into_rpc(self) -> (Arc<Value>, RpcRequest) {
        (self.id, RpcRequest::new(self.method, self.params.unwrap_or(Value::Null)))
    }
}

/// JSON-RPC 2.0 response structure.
///
/// A response contains either a `result` (success) or an `error` (failure), but never both.
/// A `null` result is preserved as `Some(null)` so that "no such block" survives a round trip
/// through the upstream codec.
///
/// # Example
///
/// ```
/// use venn_core::types::{to_payload, JsonRpcResponse};
/// use serde_json::json;
/// use std::sync::Arc;
///
/// let response = JsonRpcResponse::success(to_payload("0x1234").unwrap(), Arc::new(json!(1)));
/// assert!(response.result.is_some());
/// assert!(response.error.is_none());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(default = "null_id")]
    pub id: Arc<Value>,
}

fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Payload>, D::Error>
where
    D: Deserializer<'de>,
{
    Payload::deserialize(deserializer).map(Some)
}

impl JsonRpcResponse {
    /// Creates a successful JSON-RPC response.
    #[must_use]
    pub fn success(result: Payload, id: Arc<Value>) -> Self {
        Self { jsonrpc: JSONRPC_VERSION_COW, result: Some(result), error: None, id }
    }

    /// Creates an error JSON-RPC response.
    #[must_use]
    pub fn error(code: i32, message: String, id: Arc<Value>) -> Self {
        Self::failure(JsonRpcError { code, message, data: None }, id)
    }

    /// Creates an error response from a prepared error object.
    #[must_use]
    pub fn failure(error: JsonRpcError, id: Arc<Value>) -> Self {
        Self { jsonrpc: JSONRPC_VERSION_COW, result: None, error: Some(error), id }
    }

    /// Builds the response for a pipeline outcome.
    #[must_use]
    pub fn from_outcome(outcome: Result<Payload, RpcError>, id: Arc<Value>) -> Self {
        match outcome {
            Ok(result) => Self::success(result, id),
            Err(err) => Self::failure(err.to_json_rpc_error(), id),
        }
    }

    /// Converts the response back into a pipeline outcome.
    ///
    /// # Errors
    ///
    /// Returns the carried error object as [`RpcError::JsonRpc`].
    pub fn into_outcome(self) -> Result<Payload, RpcError> {
        if let Some(error) = self.error {
            return Err(RpcError::JsonRpc {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }
        Ok(self.result.unwrap_or_else(null_payload))
    }
}

/// JSON-RPC 2.0 error object.
///
/// Standard error codes follow the JSON-RPC 2.0 convention and EIP-1474:
///
/// - `-32700`: Parse error (invalid JSON)
/// - `-32600`: Invalid request (malformed JSON-RPC)
/// - `-32601`: Method not found
/// - `-32602`: Invalid params
/// - `-32603`: Internal error
/// - `-32000` to `-32099`: Server-defined errors (implementation-specific)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Server-initiated subscription message.
#[derive(Debug, Serialize)]
pub struct SubscriptionNotification<'a> {
    pub jsonrpc: Cow<'static, str>,
    pub method: &'a str,
    pub params: SubscriptionParams<'a>,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionParams<'a> {
    pub subscription: &'a str,
    pub result: &'a RawValue,
}

impl<'a> SubscriptionNotification<'a> {
    #[must_use]
    pub fn new(method: &'a str, subscription: &'a str, result: &'a RawValue) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION_COW,
            method,
            params: SubscriptionParams { subscription, result },
        }
    }
}

/// Error type for fixed-size hex parsing
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum HexParseError {
    #[error("missing 0x prefix")]
    MissingPrefix,
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
}

fn decode_fixed<const N: usize>(value: &str) -> Result<[u8; N], HexParseError> {
    let hex_str = value.strip_prefix("0x").ok_or(HexParseError::MissingPrefix)?;
    let bytes = hex::decode(hex_str).map_err(|e| HexParseError::InvalidHex(e.to_string()))?;
    if bytes.len() != N {
        return Err(HexParseError::InvalidLength { expected: N, got: bytes.len() });
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

macro_rules! fixed_hex {
    ($name:ident, $len:expr) => {
        impl $name {
            #[must_use]
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            #[must_use]
            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = HexParseError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                decode_fixed::<$len>(value).map($name)
            }
        }

        impl std::str::FromStr for $name {
            type Err = HexParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::try_from(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = Cow::<'de, str>::deserialize(deserializer)?;
                Self::try_from(s.as_ref()).map_err(de::Error::custom)
            }
        }
    };
}

/// 32-byte hash (block hashes, transaction hashes, log topics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32(pub [u8; 32]);

/// 20-byte account address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

fixed_hex!(Hash32, 32);
fixed_hex!(Address, 20);
