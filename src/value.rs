//! Typed values accepted by `set`.
//!
//! Every backend stores values in their string form. `CacheValue` is the
//! closed set of types that have one, so the conversion is checked at
//! compile time instead of at runtime.

use crate::error::{Error, Result};
use std::fmt;

/// A value that can be written to the item store.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Raw bytes; must be valid UTF-8 to be stored.
    Bytes(Vec<u8>),
}

impl CacheValue {
    /// Canonical string form of the value.
    ///
    /// # Errors
    /// Returns `Error::EncodingError` for `Bytes` that are not valid UTF-8.
    pub fn encode(&self) -> Result<String> {
        match self {
            CacheValue::Str(s) => Ok(s.clone()),
            CacheValue::Int(n) => Ok(n.to_string()),
            CacheValue::Float(n) => Ok(n.to_string()),
            CacheValue::Bool(b) => Ok(b.to_string()),
            CacheValue::Bytes(bytes) => String::from_utf8(bytes.clone())
                .map_err(|e| Error::EncodingError(format!("bytes are not valid UTF-8: {}", e))),
        }
    }

    /// Consuming variant of [`encode`](Self::encode) that avoids a copy for
    /// strings and bytes.
    pub fn into_encoded(self) -> Result<String> {
        match self {
            CacheValue::Str(s) => Ok(s),
            CacheValue::Bytes(bytes) => String::from_utf8(bytes)
                .map_err(|e| Error::EncodingError(format!("bytes are not valid UTF-8: {}", e))),
            other => other.encode(),
        }
    }
}

impl fmt::Display for CacheValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheValue::Str(s) => f.write_str(s),
            CacheValue::Int(n) => write!(f, "{}", n),
            CacheValue::Float(n) => write!(f, "{}", n),
            CacheValue::Bool(b) => write!(f, "{}", b),
            CacheValue::Bytes(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
        }
    }
}

impl From<&str> for CacheValue {
    fn from(v: &str) -> Self {
        CacheValue::Str(v.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(v: String) -> Self {
        CacheValue::Str(v)
    }
}

impl From<&String> for CacheValue {
    fn from(v: &String) -> Self {
        CacheValue::Str(v.clone())
    }
}

impl From<i32> for CacheValue {
    fn from(v: i32) -> Self {
        CacheValue::Int(v.into())
    }
}

impl From<u32> for CacheValue {
    fn from(v: u32) -> Self {
        CacheValue::Int(v.into())
    }
}

impl From<i64> for CacheValue {
    fn from(v: i64) -> Self {
        CacheValue::Int(v)
    }
}

impl From<f64> for CacheValue {
    fn from(v: f64) -> Self {
        CacheValue::Float(v)
    }
}

impl From<bool> for CacheValue {
    fn from(v: bool) -> Self {
        CacheValue::Bool(v)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(v: Vec<u8>) -> Self {
        CacheValue::Bytes(v)
    }
}

impl From<&[u8]> for CacheValue {
    fn from(v: &[u8]) -> Self {
        CacheValue::Bytes(v.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_scalars() {
        assert_eq!(CacheValue::from("v").encode().unwrap(), "v");
        assert_eq!(CacheValue::from(42i64).encode().unwrap(), "42");
        assert_eq!(CacheValue::from(-7).encode().unwrap(), "-7");
        assert_eq!(CacheValue::from(1.5).encode().unwrap(), "1.5");
        assert_eq!(CacheValue::from(true).encode().unwrap(), "true");
    }

    #[test]
    fn test_encode_bytes() {
        assert_eq!(CacheValue::from(&b"abc"[..]).encode().unwrap(), "abc");

        let err = CacheValue::from(vec![0xff, 0xfe]).encode().unwrap_err();
        assert!(matches!(err, Error::EncodingError(_)));
    }

    #[test]
    fn test_into_encoded_matches_encode() {
        let value = CacheValue::from(String::from("owned"));
        assert_eq!(value.encode().unwrap(), value.clone().into_encoded().unwrap());
    }
}
