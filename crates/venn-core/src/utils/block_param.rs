//! Centralized block parameter parsing utilities.
//!
//! Provides consistent parsing for block numbers, block tags, and block references
//! across the stages that inspect or rewrite them (head replacement, look-back guard, cacher).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

use crate::types::Hash32;

/// Error types for block parameter parsing
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),
    #[error("invalid number: {0}")]
    InvalidNumber(String),
    #[error("block number larger than int64")]
    TooLarge,
    #[error("invalid block parameter type")]
    InvalidType,
}

/// Standard Ethereum block tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockTag {
    /// The most recent block in the canonical chain
    Latest,
    /// The earliest/genesis block
    Earliest,
    /// A block in the pending state
    Pending,
    /// The most recent safe head block
    Safe,
    /// The most recent finalized block
    Finalized,
    /// The most recent executed block on chains that separate execution from consensus
    LatestExecuted,
}

impl BlockTag {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Latest => "latest",
            Self::Earliest => "earliest",
            Self::Pending => "pending",
            Self::Safe => "safe",
            Self::Finalized => "finalized",
            Self::LatestExecuted => "latestExecuted",
        }
    }
}

/// Block reference types supported by Ethereum JSON-RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockRef {
    /// Specific block number
    Number(u64),
    /// Block tag (latest, earliest, etc.)
    Tag(BlockTag),
}

impl BlockRef {
    /// Parse a block parameter from a string.
    ///
    /// Handles:
    /// - Block tags (`latest`, `earliest`, `pending`, `safe`, `finalized`, `latestExecuted`)
    /// - `null`, which means `latest`
    /// - Decimal strings (e.g., "123")
    /// - Hex strings with "0x" prefix (e.g., "0x7b")
    ///
    /// # Examples
    /// ```
    /// use venn_core::utils::block_param::{BlockRef, BlockTag};
    ///
    /// assert_eq!(BlockRef::parse("latest").unwrap(), BlockRef::Tag(BlockTag::Latest));
    /// assert_eq!(BlockRef::parse("0x10").unwrap(), BlockRef::Number(16));
    /// assert_eq!(BlockRef::parse("100").unwrap(), BlockRef::Number(100));
    /// ```
    ///
    /// # Errors
    /// Returns `ParseError` if the input is not a valid block parameter.
    pub fn parse(param: &str) -> Result<Self, ParseError> {
        let tag = match param {
            "latest" | "null" => BlockTag::Latest,
            "earliest" => BlockTag::Earliest,
            "pending" => BlockTag::Pending,
            "safe" => BlockTag::Safe,
            "finalized" => BlockTag::Finalized,
            "latestExecuted" => BlockTag::LatestExecuted,
            s => {
                let hex = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"));
                let n = if let Some(hex_str) = hex {
                    u64::from_str_radix(hex_str, 16)
                        .map_err(|_| ParseError::InvalidHex(s.to_string()))?
                } else {
                    s.parse::<u64>().map_err(|_| ParseError::InvalidNumber(s.to_string()))?
                };
                if n > i64::MAX as u64 {
                    return Err(ParseError::TooLarge);
                }
                return Ok(Self::Number(n));
            }
        };
        Ok(Self::Tag(tag))
    }

    /// Parses a JSON param: a string, a bare integer, or `null`.
    ///
    /// # Errors
    /// Returns `ParseError` for any other JSON type or an unparseable string.
    pub fn from_value(value: &Value) -> Result<Self, ParseError> {
        match value {
            Value::String(s) => Self::parse(s),
            Value::Number(n) => n.as_u64().map(Self::Number).ok_or(ParseError::InvalidType),
            Value::Null => Ok(Self::Tag(BlockTag::Latest)),
            _ => Err(ParseError::InvalidType),
        }
    }

    #[must_use]
    pub fn number(self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(n),
            Self::Tag(_) => None,
        }
    }

    #[must_use]
    pub fn is_latest(self) -> bool {
        self == Self::Tag(BlockTag::Latest)
    }

    /// Wire form: the tag name, or a `0x` quantity.
    #[must_use]
    pub fn to_value(self) -> Value {
        match self {
            Self::Number(n) => Value::String(to_hex(n)),
            Self::Tag(tag) => Value::String(tag.as_str().to_string()),
        }
    }
}

impl TryFrom<&str> for BlockRef {
    type Error = ParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl Serialize for BlockRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Number(n) => serializer.collect_str(&format_args!("0x{n:x}")),
            Self::Tag(tag) => serializer.serialize_str(tag.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for BlockRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// A block selector that may also be a hash (EIP-1898).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockId {
    Ref(BlockRef),
    Hash { hash: Hash32, require_canonical: bool },
}

impl BlockId {
    /// Parses a string, number, or `{blockNumber|blockHash}` object.
    ///
    /// # Errors
    /// Returns `ParseError` when the value is none of the accepted forms.
    pub fn from_value(value: &Value) -> Result<Self, ParseError> {
        match value {
            Value::Object(obj) => {
                let require_canonical =
                    obj.get("requireCanonical").and_then(Value::as_bool).unwrap_or(false);
                match (obj.get("blockNumber"), obj.get("blockHash")) {
                    (Some(n), None) => BlockRef::from_value(n).map(Self::Ref),
                    (None, Some(Value::String(h))) => Hash32::try_from(h.as_str())
                        .map(|hash| Self::Hash { hash, require_canonical })
                        .map_err(|_| ParseError::InvalidHex(h.clone())),
                    _ => Err(ParseError::InvalidType),
                }
            }
            Value::String(s) if s.len() == 66 => Hash32::try_from(s.as_str())
                .map(|hash| Self::Hash { hash, require_canonical: false })
                .map_err(|_| ParseError::InvalidHex(s.clone())),
            other => BlockRef::from_value(other).map(Self::Ref),
        }
    }

    #[must_use]
    pub fn number(&self) -> Option<u64> {
        match self {
            Self::Ref(r) => r.number(),
            Self::Hash { .. } => None,
        }
    }
}

/// Parse a hex quantity to u64 (with or without 0x prefix).
///
/// # Examples
/// ```
/// use venn_core::utils::block_param::parse_hex;
///
/// assert_eq!(parse_hex("0xff"), Some(255));
/// assert_eq!(parse_hex("ff"), Some(255));
/// assert_eq!(parse_hex("invalid"), None);
/// ```
#[must_use]
pub fn parse_hex(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}

/// Extract a hex quantity from a JSON value.
#[must_use]
pub fn hex_from_value(value: &Value) -> Option<u64> {
    value.as_str().and_then(parse_hex)
}

/// Formats a quantity the way nodes do: `0x` followed by lowercase hex without leading zeros.
#[must_use]
pub fn to_hex(n: u64) -> String {
    format!("0x{n:x}")
}
