//! Order-independent range checksums.
//!
//! Each row is hashed as SHA-256 over its encoded fields, key first. A field
//! is `v<chars>:<canonical text>`, or `n` for NULL, so no two distinct rows
//! share an encoding. The low 60 bits of the digest (its last 15 hex digits)
//! are summed over the range. Summation keeps the aggregate independent of
//! row order and lets SQL engines compute it with a plain `SUM`.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::value::{DbKey, DbValue};

/// Mask selecting the low 60 bits of a row digest.
const ROW_HASH_MASK: u64 = 0x0FFF_FFFF_FFFF_FFFF;

/// Tag opening a non-NULL field, followed by its length in characters.
pub const VALUE_TAG: &str = "v";

/// Ends the length prefix of a non-NULL field.
pub const LENGTH_END: &str = ":";

/// Encoding of a NULL field.
pub const NULL_FIELD: &str = "n";

/// Sum of 60-bit row hashes over a range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Checksum(pub u128);

impl Checksum {
    /// Checksum of a range with no rows.
    pub const EMPTY: Checksum = Checksum(0);

    /// Parse the decimal text an SQL `SUM` produces. NULL (no rows) is [`Checksum::EMPTY`].
    pub fn from_sum_text(text: Option<&str>) -> Option<Self> {
        match text.map(str::trim) {
            None | Some("") => Some(Self::EMPTY),
            // Some engines render DECIMAL sums with a trailing ".0"
            Some(t) => t.split('.').next()?.parse().ok().map(Checksum),
        }
    }

    /// Add one row hash to the aggregate.
    pub fn add(self, row_hash: u64) -> Self {
        Checksum(self.0.wrapping_add(row_hash as u128))
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::iter::Sum<u64> for Checksum {
    fn sum<I: Iterator<Item = u64>>(iter: I) -> Self {
        iter.fold(Checksum::EMPTY, Checksum::add)
    }
}

/// Encoded text of a row as hashed by every backend.
pub fn row_text(key: &DbKey, values: &[DbValue]) -> String {
    let mut text = String::new();
    push_field(&mut text, Some(&*key.canonical_text()));
    for value in values {
        push_field(&mut text, value.canonical_text().as_deref());
    }
    text
}

fn push_field(text: &mut String, field: Option<&str>) {
    match field {
        Some(v) => {
            text.push_str(VALUE_TAG);
            text.push_str(&v.chars().count().to_string());
            text.push_str(LENGTH_END);
            text.push_str(v);
        }
        None => text.push_str(NULL_FIELD),
    }
}

/// 60-bit hash of a row's encoded text.
pub fn row_hash(key: &DbKey, values: &[DbValue]) -> u64 {
    hash_text(&row_text(key, values))
}

pub fn hash_text(text: &str) -> u64 {
    let digest = Sha256::digest(text.as_bytes());
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&digest[24..32]);
    u64::from_be_bytes(tail) & ROW_HASH_MASK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_text_layout() {
        let text = row_text(
            &DbKey::Int(7),
            &[DbValue::from("a"), DbValue::Null, DbValue::Bool(true)],
        );
        assert_eq!(text, "v1:7v1:anv1:1");
    }

    #[test]
    fn test_null_and_null_text_differ() {
        let null = row_text(&DbKey::Int(1), &[DbValue::Null]);
        let literal = row_text(&DbKey::Int(1), &[DbValue::from("NULL")]);
        let letter = row_text(&DbKey::Int(1), &[DbValue::from("n")]);
        assert_ne!(null, literal);
        assert_ne!(null, letter);
        assert_ne!(row_hash(&DbKey::Int(1), &[DbValue::Null]), row_hash(&DbKey::Int(1), &[DbValue::from("NULL")]));
    }

    #[test]
    fn test_field_boundaries_are_encoded() {
        let left = row_text(&DbKey::Int(1), &[DbValue::from("a|b"), DbValue::from("c")]);
        let right = row_text(&DbKey::Int(1), &[DbValue::from("a"), DbValue::from("b|c")]);
        assert_ne!(left, right);

        // the length counts characters, not bytes
        let text = row_text(&DbKey::from("é"), &[]);
        assert_eq!(text, "v1:é");
    }

    #[test]
    fn test_hash_matches_last_15_hex_digits_of_sha256() {
        let digest = format!("{:x}", Sha256::digest(b"abc"));
        let tail = u64::from_str_radix(&digest[49..], 16).unwrap();
        assert_eq!(hash_text("abc"), tail);
        assert!(hash_text("abc") <= ROW_HASH_MASK);
    }

    #[test]
    fn test_sum_is_order_independent() {
        let hashes = [hash_text("1|a"), hash_text("2|b"), hash_text("3|c")];
        let forward: Checksum = hashes.iter().copied().sum();
        let backward: Checksum = hashes.iter().rev().copied().sum();
        assert_eq!(forward, backward);
        assert_ne!(forward, Checksum::EMPTY);
    }

    #[test]
    fn test_from_sum_text() {
        assert_eq!(Checksum::from_sum_text(None), Some(Checksum::EMPTY));
        assert_eq!(Checksum::from_sum_text(Some("42")), Some(Checksum(42)));
        assert_eq!(Checksum::from_sum_text(Some("42.0")), Some(Checksum(42)));
        assert_eq!(Checksum::from_sum_text(Some("x")), None);
    }
}
