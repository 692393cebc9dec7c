//! Message codec (§4.1).
//!
//! A transport carries only text. Bodies and header values are arbitrary
//! bytes, so every byte string is wrapped in the sentinel prefix
//! [`BASE64_SENTINEL`] followed by its base64 encoding. [`ByteString`] is the
//! field-level primitive both envelope types build on; wrapping every
//! header key/value, method, path, and body in it is what makes the codec a
//! bijection on well-formed envelopes without a dynamic tree walk.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::constants::BASE64_SENTINEL;

/// A byte string that serializes to wire form as `application/base64:<b64>`
/// and deserializes back exactly, by construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ByteString(pub Vec<u8>);

impl ByteString {
    pub fn from_static(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    /// Lossy UTF-8 view, for logging and header-name comparisons.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    pub fn eq_ignore_ascii_case_str(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other.as_bytes())
    }
}

impl From<Vec<u8>> for ByteString {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl From<&str> for ByteString {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

pub fn encode_bytes(bytes: &[u8]) -> String {
    format!("{BASE64_SENTINEL}{}", BASE64.encode(bytes))
}

/// Returns `Some(decoded)` if `s` carries the sentinel prefix and decodes
/// cleanly; `None` otherwise (caller falls back to verbatim bytes).
pub fn decode_prefixed(s: &str) -> Option<Vec<u8>> {
    let rest = s.strip_prefix(BASE64_SENTINEL)?;
    BASE64.decode(rest).ok()
}

impl Serialize for ByteString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode_bytes(&self.0))
    }
}

impl<'de> Deserialize<'de> for ByteString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct V;
        impl Visitor<'_> for V {
            type Value = ByteString;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string, optionally base64-sentinel-prefixed")
            }

            fn visit_str<E: DeError>(self, v: &str) -> Result<ByteString, E> {
                match decode_prefixed(v) {
                    Some(bytes) => Ok(ByteString(bytes)),
                    // Non-prefixed strings are left verbatim (§4.1).
                    None => Ok(ByteString(v.as_bytes().to_vec())),
                }
            }
        }
        deserializer.deserialize_str(V)
    }
}

/// Structural decode failure — the JSON text was not a well-formed envelope.
#[derive(Debug, thiserror::Error)]
#[error("envelope decode error: {0}")]
pub struct DecodeError(pub String);

/// Shared wire-form boundary for [`crate::envelope::RequestEnvelope`] and
/// [`crate::envelope::ResponseEnvelope`] (design note: one generic codec
/// parametric in the struct, expressed here as default trait methods over
/// `Serialize + DeserializeOwned`).
pub trait WireEnvelope: Serialize + for<'de> Deserialize<'de> {
    fn to_wire_form(&self) -> Result<String, DecodeError> {
        serde_json::to_string(self).map_err(|e| DecodeError(e.to_string()))
    }

    fn from_wire_form(text: &str) -> Result<Self, DecodeError>
    where
        Self: Sized,
    {
        serde_json::from_str(text).map_err(|e| DecodeError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_string_round_trips_arbitrary_bytes() {
        let original = ByteString(vec![0, 1, 2, 255, 254, b'h', b'i']);
        let json = serde_json::to_string(&original).unwrap();
        assert!(json.contains(BASE64_SENTINEL));
        let decoded: ByteString = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn non_prefixed_string_is_left_verbatim_as_bytes() {
        let decoded: ByteString = serde_json::from_str("\"plain-text\"").unwrap();
        assert_eq!(decoded.0, b"plain-text");
    }

    #[test]
    fn decode_prefixed_rejects_bad_base64() {
        assert!(decode_prefixed("application/base64:not-base64!!!").is_none());
    }
}
