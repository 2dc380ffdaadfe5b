//! Typed column values resolved by vindexes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VindexError};

/// A scalar SQL value as seen by a vindex.
///
/// `Null` is a distinguished value: it is never cached, never sent to a
/// backing-table query, and always resolves to "not found".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int64(i64),
    Uint64(u64),
    Text(String),
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Converts the value to an unsigned integer.
    ///
    /// Negative integers, null and non-numeric text or bytes are rejected.
    pub fn to_u64(&self) -> Result<u64> {
        match self {
            Self::Uint64(v) => Ok(*v),
            Self::Int64(v) => u64::try_from(*v).map_err(|_| VindexError::InvalidValue(v.to_string())),
            Self::Text(text) => text
                .parse::<u64>()
                .map_err(|_| VindexError::InvalidValue(text.clone())),
            Self::Binary(bytes) => std::str::from_utf8(bytes)
                .ok()
                .and_then(|text| text.parse::<u64>().ok())
                .ok_or_else(|| VindexError::InvalidValue(String::from_utf8_lossy(bytes).into_owned())),
            Self::Null => Err(VindexError::InvalidValue("NULL".to_string())),
        }
    }

    /// Canonical key used by caches and result maps. `None` for null.
    pub fn cache_key(&self) -> Option<String> {
        if self.is_null() {
            None
        } else {
            Some(self.to_string())
        }
    }

    /// Parses an untyped literal: `null`, a signed or unsigned integer, or text.
    pub fn parse_literal(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("null") {
            return Self::Null;
        }
        if let Ok(v) = raw.parse::<i64>() {
            return Self::Int64(v);
        }
        if let Ok(v) = raw.parse::<u64>() {
            return Self::Uint64(v);
        }
        Self::Text(raw.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Uint64(v) => write!(f, "{v}"),
            Self::Text(text) => f.write_str(text),
            Self::Binary(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::Uint64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}
