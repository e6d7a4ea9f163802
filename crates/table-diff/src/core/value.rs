//! Key and column value types shared by every backend.
//!
//! Values fetched from different engines are compared through their
//! *canonical text* form, the same representation the SQL dialects produce
//! server-side before hashing. This keeps row comparison and checksums in
//! agreement across engines.

use std::borrow::Cow;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use super::schema::KeyKind;

/// Timestamp type used for update-column bounds.
pub type DbTime = NaiveDateTime;

/// Canonical timestamp layout (microsecond precision).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Canonical date layout.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Fractional digits used for canonical float text.
pub const FLOAT_SCALE: usize = 6;

/// A value of the key column.
///
/// Ordering within one variant is the ordering the bisection relies on.
/// Text keys order by bytes, matching the byte-order collation the SQL
/// dialects request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DbKey {
    /// Integer key (covers smallint, int, bigint).
    Int(i64),
    /// UUID key.
    Uuid(Uuid),
    /// String key (varchar, text, char).
    Text(String),
}

impl DbKey {
    /// Key domain of this value.
    pub fn kind(&self) -> KeyKind {
        match self {
            DbKey::Int(_) => KeyKind::Integer,
            DbKey::Uuid(_) => KeyKind::Uuid,
            DbKey::Text(_) => KeyKind::Text,
        }
    }

    /// Parse the canonical text of a key fetched from a database.
    pub fn parse(kind: KeyKind, text: &str) -> Option<Self> {
        match kind {
            KeyKind::Integer => text.trim().parse().ok().map(DbKey::Int),
            KeyKind::Uuid => Uuid::parse_str(text.trim()).ok().map(DbKey::Uuid),
            KeyKind::Text => Some(DbKey::Text(text.to_string())),
        }
    }

    /// Canonical text used in row hashes.
    pub fn canonical_text(&self) -> Cow<'_, str> {
        match self {
            DbKey::Int(v) => Cow::Owned(v.to_string()),
            DbKey::Uuid(v) => Cow::Owned(v.to_string()),
            DbKey::Text(v) => Cow::Borrowed(v),
        }
    }
}

impl fmt::Display for DbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbKey::Int(v) => write!(f, "{}", v),
            DbKey::Uuid(v) => write!(f, "{}", v),
            DbKey::Text(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<i64> for DbKey {
    fn from(v: i64) -> Self {
        DbKey::Int(v)
    }
}

impl From<Uuid> for DbKey {
    fn from(v: Uuid) -> Self {
        DbKey::Uuid(v)
    }
}

impl From<String> for DbKey {
    fn from(v: String) -> Self {
        DbKey::Text(v)
    }
}

impl From<&str> for DbKey {
    fn from(v: &str) -> Self {
        DbKey::Text(v.to_string())
    }
}

/// A compared column value.
///
/// SQL backends return values already normalized server-side, as [`DbValue::Text`];
/// the in-memory backend keeps typed values. Both compare equal when their
/// canonical text matches.
#[derive(Debug, Clone)]
pub enum DbValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    Date(NaiveDate),
}

impl DbValue {
    /// Check if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    /// Canonical text representation, `None` for NULL.
    pub fn canonical_text(&self) -> Option<Cow<'_, str>> {
        let text = match self {
            DbValue::Null => return None,
            DbValue::Bool(v) => Cow::Borrowed(if *v { "1" } else { "0" }),
            DbValue::Int(v) => Cow::Owned(v.to_string()),
            DbValue::Float(v) => Cow::Owned(format!("{:.*}", FLOAT_SCALE, v)),
            DbValue::Decimal(v) => Cow::Owned(v.to_string()),
            DbValue::Text(v) if v.contains("\r\n") => Cow::Owned(v.replace("\r\n", "\n")),
            DbValue::Text(v) => Cow::Borrowed(v.as_str()),
            DbValue::Bytes(v) => Cow::Owned(v.iter().map(|b| format!("{:02x}", b)).collect()),
            DbValue::Uuid(v) => Cow::Owned(v.to_string()),
            DbValue::Timestamp(v) => Cow::Owned(v.format(TIMESTAMP_FORMAT).to_string()),
            DbValue::TimestampTz(v) => {
                Cow::Owned(v.naive_utc().format(TIMESTAMP_FORMAT).to_string())
            }
            DbValue::Date(v) => Cow::Owned(v.format(DATE_FORMAT).to_string()),
        };
        Some(text)
    }

    /// Timestamp view of this value, for time-range filtering.
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            DbValue::Timestamp(v) => Some(*v),
            DbValue::TimestampTz(v) => Some(v.naive_utc()),
            DbValue::Date(v) => v.and_hms_opt(0, 0, 0),
            DbValue::Text(v) => NaiveDateTime::parse_from_str(v, TIMESTAMP_FORMAT).ok(),
            _ => None,
        }
    }
}

impl PartialEq for DbValue {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_text() == other.canonical_text()
    }
}

impl Eq for DbValue {}

impl fmt::Display for DbValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.canonical_text() {
            Some(text) => write!(f, "{}", text),
            None => write!(f, "NULL"),
        }
    }
}

impl Serialize for DbValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.canonical_text() {
            Some(text) => serializer.serialize_str(&text),
            None => serializer.serialize_none(),
        }
    }
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        DbValue::Bool(v)
    }
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Int(v)
    }
}

impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        DbValue::Float(v)
    }
}

impl From<Decimal> for DbValue {
    fn from(v: Decimal) -> Self {
        DbValue::Decimal(v)
    }
}

impl From<String> for DbValue {
    fn from(v: String) -> Self {
        DbValue::Text(v)
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for DbValue {
    fn from(v: Vec<u8>) -> Self {
        DbValue::Bytes(v)
    }
}

impl From<Uuid> for DbValue {
    fn from(v: Uuid) -> Self {
        DbValue::Uuid(v)
    }
}

impl From<NaiveDateTime> for DbValue {
    fn from(v: NaiveDateTime) -> Self {
        DbValue::Timestamp(v)
    }
}

impl From<DateTime<FixedOffset>> for DbValue {
    fn from(v: DateTime<FixedOffset>) -> Self {
        DbValue::TimestampTz(v)
    }
}

impl From<NaiveDate> for DbValue {
    fn from(v: NaiveDate) -> Self {
        DbValue::Date(v)
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(DbValue::Null)
    }
}

/// One fetched row: the key plus the compared columns
/// (update column first when configured, then extra columns in order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Row {
    pub key: DbKey,
    pub values: Vec<DbValue>,
}

impl Row {
    pub fn new(key: impl Into<DbKey>, values: Vec<DbValue>) -> Self {
        Self {
            key: key.into(),
            values,
        }
    }
}
