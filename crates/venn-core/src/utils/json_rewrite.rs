//! Streaming rewrites over raw JSON payloads.
//!
//! Blocks are large and mostly passed through untouched. These helpers walk the top-level
//! members of an object as borrowed [`RawValue`] slices and re-emit them in their original
//! order, decoding only the member being rewritten.

use serde::{
    de::{MapAccess, Visitor},
    Deserialize, Deserializer,
};
use serde_json::value::RawValue;
use std::fmt;

use crate::{errors::RpcError, types::Payload};

struct Members<'a>(Vec<(String, &'a RawValue)>);

impl<'de> Deserialize<'de> for Members<'de> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MembersVisitor;

        impl<'de> Visitor<'de> for MembersVisitor {
            type Value = Members<'de>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut members = Vec::with_capacity(map.size_hint().unwrap_or(24));
                while let Some((key, value)) = map.next_entry::<String, &'de RawValue>()? {
                    members.push((key, value));
                }
                Ok(Members(members))
            }
        }

        deserializer.deserialize_map(MembersVisitor)
    }
}

#[derive(Deserialize)]
struct TxHash<'a> {
    #[serde(borrow)]
    hash: &'a RawValue,
}

fn malformed(err: serde_json::Error) -> RpcError {
    RpcError::Internal(format!("malformed block: {err}"))
}

fn rewrite<F>(block: &RawValue, mut member: F) -> Result<Payload, RpcError>
where
    F: FnMut(&str, &RawValue, &mut String) -> Result<bool, RpcError>,
{
    if crate::types::is_null(block) {
        return Ok(block.to_owned());
    }
    let Members(members) = serde_json::from_str(block.get()).map_err(malformed)?;

    let mut out = String::with_capacity(block.get().len());
    out.push('{');
    let mut first = true;
    for (key, value) in members {
        let mark = out.len();
        if !first {
            out.push(',');
        }
        out.push_str(&serde_json::to_string(&key).map_err(malformed)?);
        out.push(':');
        if member(&key, value, &mut out)? {
            first = false;
        } else {
            out.truncate(mark);
        }
    }
    out.push('}');

    RawValue::from_string(out).map_err(malformed)
}

/// Replaces each full transaction object in `transactions` with its `hash`, leaving every
/// other member byte-for-byte intact. Hash strings already present are kept.
///
/// # Errors
///
/// Returns [`RpcError::Internal`] if the block is not an object or a transaction has no hash.
pub fn reduce_transactions(block: &RawValue) -> Result<Payload, RpcError> {
    rewrite(block, |key, value, out| {
        if key != "transactions" {
            out.push_str(value.get());
            return Ok(true);
        }
        let txs: Vec<&RawValue> = serde_json::from_str(value.get()).map_err(malformed)?;
        out.push('[');
        for (i, tx) in txs.into_iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            if tx.get().trim_start().starts_with('"') {
                out.push_str(tx.get());
            } else {
                let TxHash { hash } = serde_json::from_str(tx.get()).map_err(malformed)?;
                out.push_str(hash.get());
            }
        }
        out.push(']');
        Ok(true)
    })
}

/// Splits an object into its top-level members, in document order.
///
/// # Errors
///
/// Returns [`RpcError::Internal`] if the payload is not an object.
pub fn members(object: &RawValue) -> Result<Vec<(String, &RawValue)>, RpcError> {
    let Members(members) = serde_json::from_str(object.get()).map_err(malformed)?;
    Ok(members)
}

/// Drops a top-level member from an object.
///
/// # Errors
///
/// Returns [`RpcError::Internal`] if the payload is not an object.
pub fn remove_member(object: &RawValue, name: &str) -> Result<Payload, RpcError> {
    rewrite(object, |key, value, out| {
        if key == name {
            return Ok(false);
        }
        out.push_str(value.get());
        Ok(true)
    })
}

/// Splits a JSON array into borrowed element slices.
///
/// # Errors
///
/// Returns [`RpcError::Internal`] if the payload is not an array.
pub fn array_items(array: &RawValue) -> Result<Vec<&RawValue>, RpcError> {
    serde_json::from_str(array.get())
        .map_err(|e| RpcError::Internal(format!("expected a JSON array: {e}")))
}

/// Joins raw elements into a JSON array payload.
///
/// # Errors
///
/// Returns [`RpcError::Internal`] if an element is not valid JSON.
pub fn join_array<'a, I>(items: I) -> Result<Payload, RpcError>
where
    I: IntoIterator<Item = &'a RawValue>,
{
    let mut out = String::from("[");
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(item.get());
    }
    out.push(']');
    RawValue::from_string(out).map_err(|e| RpcError::Internal(format!("invalid array: {e}")))
}
