//! CBOR map helpers built on `ciborium::Value`.
//!
//! CTAP2 command parameters and responses are maps keyed by small integers
//! (occasionally text, for the clientPIN COSE key parameter). Serde's derive
//! machinery doesn't have a clean way to express "map keyed by an integer
//! whose value selects the type of value", so — following the teacher's own
//! `cbor_to_string`/`cbor_to_u32`/`cbor_to_u8`/`cbor_to_bool` free functions
//! in `fido2.rs` — this module generalizes that idiom into a reusable
//! key-by-key reader, used for both decoding requests and encoding
//! responses.

use ciborium::Value;
use thiserror::Error;

/// Distinguishes "the key isn't there" from every other parse failure
/// (wrong CBOR type, truncated/unparseable bytes, wrong shape), so callers
/// can map the two to different CTAP status bytes (spec.md §4.A:
/// "distinguish `missing_parameter` from `invalid_cbor`") instead of
/// collapsing every parse failure into one status.
#[derive(Debug, Error)]
pub enum CborError {
    #[error("missing parameter {0}")]
    Missing(String),
    #[error("invalid CBOR: {0}")]
    Invalid(String),
}

pub type CborResult<T> = Result<T, CborError>;

fn missing(key: impl std::fmt::Display) -> CborError {
    CborError::Missing(key.to_string())
}

fn invalid(message: impl Into<String>) -> CborError {
    CborError::Invalid(message.into())
}

/// A CBOR map with integer keys, as used by every CTAP2 command.
pub struct IntMap<'a> {
    entries: &'a [(Value, Value)],
}

impl<'a> IntMap<'a> {
    pub fn parse(bytes: &'a [u8]) -> CborResult<Value> {
        ciborium::from_reader(bytes).map_err(|e| invalid(format!("{e}")))
    }

    pub fn from_value(value: &'a Value) -> CborResult<Self> {
        match value {
            Value::Map(entries) => Ok(IntMap { entries }),
            _ => Err(invalid("expected a CBOR map")),
        }
    }

    fn find(&self, key: i128) -> Option<&'a Value> {
        self.entries.iter().find_map(|(k, v)| {
            if k.as_integer().map(i128::from) == Some(key) {
                Some(v)
            } else {
                None
            }
        })
    }

    pub fn get(&self, key: i128) -> Option<&'a Value> {
        self.find(key)
    }

    pub fn require(&self, key: i128) -> CborResult<&'a Value> {
        self.find(key).ok_or_else(|| missing(key))
    }

    pub fn get_bytes(&self, key: i128) -> CborResult<Option<Vec<u8>>> {
        match self.find(key) {
            None => Ok(None),
            Some(Value::Bytes(b)) => Ok(Some(b.clone())),
            Some(_) => Err(invalid(format!("parameter {key} is not a byte string"))),
        }
    }

    pub fn require_bytes(&self, key: i128) -> CborResult<Vec<u8>> {
        self.get_bytes(key)?.ok_or_else(|| missing(key))
    }

    pub fn get_text(&self, key: i128) -> CborResult<Option<String>> {
        match self.find(key) {
            None => Ok(None),
            Some(Value::Text(s)) => Ok(Some(s.clone())),
            Some(_) => Err(invalid(format!("parameter {key} is not a text string"))),
        }
    }

    pub fn require_text(&self, key: i128) -> CborResult<String> {
        self.get_text(key)?.ok_or_else(|| missing(key))
    }

    pub fn get_u64(&self, key: i128) -> CborResult<Option<u64>> {
        match self.find(key) {
            None => Ok(None),
            Some(v) => v
                .as_integer()
                .and_then(|i| u64::try_from(i).ok())
                .map(Some)
                .ok_or_else(|| invalid(format!("parameter {key} is not a non-negative integer"))),
        }
    }

    pub fn require_u64(&self, key: i128) -> CborResult<u64> {
        self.get_u64(key)?.ok_or_else(|| missing(key))
    }

    pub fn get_i64(&self, key: i128) -> CborResult<Option<i64>> {
        match self.find(key) {
            None => Ok(None),
            Some(v) => v
                .as_integer()
                .and_then(|i| i64::try_from(i).ok())
                .map(Some)
                .ok_or_else(|| invalid(format!("parameter {key} is not an integer"))),
        }
    }

    pub fn get_bool(&self, key: i128) -> CborResult<Option<bool>> {
        match self.find(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(invalid(format!("parameter {key} is not a boolean"))),
        }
    }

    pub fn get_map(&self, key: i128) -> CborResult<Option<IntMap<'a>>> {
        match self.find(key) {
            None => Ok(None),
            Some(Value::Map(entries)) => Ok(Some(IntMap { entries })),
            Some(_) => Err(invalid(format!("parameter {key} is not a map"))),
        }
    }

    /// Like `get_map`, but for a parameter the caller treats as required —
    /// folds the "absent" case into `CborError::Missing` instead of leaving
    /// it to the caller to turn a bare `None` into an error (which used to
    /// get mapped to `invalid_cbor` indiscriminately; see spec.md §4.A).
    pub fn require_map(&self, key: i128) -> CborResult<IntMap<'a>> {
        self.get_map(key)?.ok_or_else(|| missing(key))
    }

    pub fn get_array(&self, key: i128) -> CborResult<Option<&'a Vec<Value>>> {
        match self.find(key) {
            None => Ok(None),
            Some(Value::Array(items)) => Ok(Some(items)),
            Some(_) => Err(invalid(format!("parameter {key} is not an array"))),
        }
    }

    pub fn require_array(&self, key: i128) -> CborResult<&'a Vec<Value>> {
        self.get_array(key)?.ok_or_else(|| missing(key))
    }

    fn find_text(&self, key: &str) -> Option<&'a Value> {
        self.entries.iter().find_map(|(k, v)| {
            if k.as_text() == Some(key) {
                Some(v)
            } else {
                None
            }
        })
    }

    /// Looks up a text-keyed entry — used for the `options` sub-map
    /// (`"rk"`, `"up"`, `"uv"`, `"plat"`, ...) and for the PublicKeyCredential
    /// descriptor / rp / user sub-maps, the places CTAP2 keys a map by
    /// string instead of by small integer.
    pub fn get_bool_text(&self, key: &str) -> CborResult<Option<bool>> {
        match self.find_text(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(invalid(format!("option {key} is not a boolean"))),
        }
    }

    pub fn get_text_text(&self, key: &str) -> CborResult<Option<String>> {
        match self.find_text(key) {
            None => Ok(None),
            Some(Value::Text(s)) => Ok(Some(s.clone())),
            Some(_) => Err(invalid(format!("field {key} is not a text string"))),
        }
    }

    pub fn require_text_text(&self, key: &str) -> CborResult<String> {
        self.get_text_text(key)?.ok_or_else(|| missing(key))
    }

    pub fn get_bytes_text(&self, key: &str) -> CborResult<Option<Vec<u8>>> {
        match self.find_text(key) {
            None => Ok(None),
            Some(Value::Bytes(b)) => Ok(Some(b.clone())),
            Some(_) => Err(invalid(format!("field {key} is not a byte string"))),
        }
    }

    pub fn require_bytes_text(&self, key: &str) -> CborResult<Vec<u8>> {
        self.get_bytes_text(key)?.ok_or_else(|| missing(key))
    }

    /// `alg` inside a `pubKeyCredParams` entry: missing and non-integer are
    /// folded together because a present-but-wrong-type `alg` is exactly as
    /// structurally broken as an absent one — there's no separate "missing"
    /// condition worth distinguishing one level down inside an array entry.
    pub fn require_i64_text(&self, key: &str) -> CborResult<i64> {
        match self.find_text(key) {
            None => Err(missing(key)),
            Some(v) => v
                .as_integer()
                .and_then(|i| i64::try_from(i).ok())
                .ok_or_else(|| invalid(format!("field {key} is not an integer"))),
        }
    }
}

/// Builds a CBOR map response and serializes it, in the teacher's
/// `ciborium::Serializer`/`SerializeMap` style generalized to arbitrary
/// key/value pairs instead of one hand-built map per call site.
pub fn encode_map(entries: Vec<(Value, Value)>) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(&Value::Map(entries), &mut out)
        .map_err(|e| anyhow::anyhow!("CBOR encode failed: {e}"))?;
    Ok(out)
}

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

pub fn bytes(b: Vec<u8>) -> Value {
    Value::Bytes(b)
}

pub fn int(i: i64) -> Value {
    Value::Integer(i.into())
}
