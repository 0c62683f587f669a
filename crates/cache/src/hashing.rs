//! Canonical item hashing.
//!
//! An item hash is the SHA-256 of the item's JSON with ignored top-level fields removed
//! and object keys written in sorted order. A data set hash is the XOR of its item
//! hashes, so it does not depend on item order and can be updated incrementally.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use termsync_core::{Order, Position, SymbolSpecification};

use crate::error::{CacheError, Result};

/// Item that can be stored in a reference tree
pub trait HashItem: Clone + Serialize + Send + Sync + 'static {
    /// Name of the serialized field holding the key
    const ID_FIELD: &'static str;

    /// Key of the item within its data set (ticket or symbol)
    fn item_id(&self) -> &str;
}

impl HashItem for SymbolSpecification {
    const ID_FIELD: &'static str = "symbol";

    fn item_id(&self) -> &str {
        &self.symbol
    }
}

impl HashItem for Position {
    const ID_FIELD: &'static str = "id";

    fn item_id(&self) -> &str {
        &self.id
    }
}

impl HashItem for Order {
    const ID_FIELD: &'static str = "id";

    fn item_id(&self) -> &str {
        &self.id
    }
}

/// SHA-256 digest of one canonical item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ItemHash([u8; 32]);

impl ItemHash {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR-combine, used both to add and to remove an item from a set hash
    pub fn xor(&self, other: &ItemHash) -> ItemHash {
        let mut bytes = self.0;
        for (byte, other) in bytes.iter_mut().zip(other.0.iter()) {
            *byte ^= other;
        }
        ItemHash(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|byte| *byte == 0)
    }
}

/// Hash `item`, excluding `ignored` top-level fields. The key field is never excluded.
pub fn hash_item<T: HashItem>(item: &T, ignored: &[String]) -> Result<ItemHash> {
    let mut value =
        serde_json::to_value(item).map_err(|e| CacheError::Serialization(e.to_string()))?;

    if let Value::Object(fields) = &mut value {
        for field in ignored {
            if field != T::ID_FIELD {
                fields.remove(field);
            }
        }
    }

    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(ItemHash(hasher.finalize().into()))
}

/// Hash of a whole data set. `None` for the empty set.
pub fn combine<'a>(hashes: impl IntoIterator<Item = &'a ItemHash>) -> Option<String> {
    let combined = hashes
        .into_iter()
        .fold(ItemHash::default(), |acc, hash| acc.xor(hash));
    if combined.is_zero() {
        None
    } else {
        Some(combined.to_hex())
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(fields) => {
            let mut keys: Vec<&String> = fields.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(&fields[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(values) => {
            out.push('[');
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(value, out);
            }
            out.push(']');
        }
        Value::String(text) => write_string(text, out),
        other => {
            let _ = write!(out, "{other}");
        }
    }
}

fn write_string(text: &str, out: &mut String) {
    let _ = write!(out, "{}", Value::String(text.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position(id: &str, profit: rust_decimal::Decimal) -> Position {
        Position {
            id: id.to_string(),
            symbol: "EURUSD".to_string(),
            profit,
            ..Default::default()
        }
    }

    #[test]
    fn test_same_item_same_hash() {
        let a = hash_item(&position("1", dec!(10)), &[]).unwrap();
        let b = hash_item(&position("1", dec!(10)), &[]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, hash_item(&position("1", dec!(11)), &[]).unwrap());
    }

    #[test]
    fn test_ignored_fields_do_not_affect_hash() {
        let ignored = vec!["profit".to_string()];
        let a = hash_item(&position("1", dec!(10)), &ignored).unwrap();
        let b = hash_item(&position("1", dec!(99)), &ignored).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_id_is_never_ignored() {
        let ignored = vec!["id".to_string()];
        let a = hash_item(&position("1", dec!(10)), &ignored).unwrap();
        let b = hash_item(&position("2", dec!(10)), &ignored).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_combine_is_order_independent() {
        let hashes: Vec<ItemHash> = ["1", "2", "3"]
            .iter()
            .map(|id| hash_item(&position(id, dec!(1)), &[]).unwrap())
            .collect();
        let reversed: Vec<ItemHash> = hashes.iter().rev().copied().collect();

        assert_eq!(combine(&hashes), combine(&reversed));
        assert!(combine(std::iter::empty()).is_none());
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let mut out = String::new();
        write_canonical(
            &serde_json::json!({"b": {"z": 1, "a": [true, null]}, "a": "x\"y"}),
            &mut out,
        );
        assert_eq!(out, r#"{"a":"x\"y","b":{"a":[true,null],"z":1}}"#);
    }
}
