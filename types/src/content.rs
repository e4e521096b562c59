use std::borrow::Cow;
use std::fmt;

use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A response body.
///
/// Serializes as a UTF-8 string (lossily, replacing invalid sequences) on human-readable
/// formats such as the JSON browser-proxy contract, and as raw bytes on binary formats such as
/// the `rmp-serde`-packed RPC transport. This lets one type serve both wire shapes without the
/// caller having to choose an encoding up front.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Content(pub Vec<u8>);

impl Content {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    #[must_use]
    pub fn as_str_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<u8>> for Content {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl Serialize for Content {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.as_str_lossy())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Content {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ContentVisitor;

        impl<'de> Visitor<'de> for ContentVisitor {
            type Value = Content;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a string or a byte array")
            }

            fn visit_str<E>(self, v: &str) -> Result<Content, E> {
                Ok(Content(v.as_bytes().to_vec()))
            }

            fn visit_string<E>(self, v: String) -> Result<Content, E> {
                Ok(Content(v.into_bytes()))
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Content, E> {
                Ok(Content(v.to_vec()))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<Content, E> {
                Ok(Content(v))
            }
        }

        deserializer.deserialize_any(ContentVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_preserves_text() {
        let content = Content::from("hello");
        let json = serde_json::to_string(&content).unwrap();
        assert_eq!(json, "\"hello\"");
        let back: Content = serde_json::from_str(&json).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn lossy_decoding_never_panics_on_invalid_utf8() {
        let content = Content::from(vec![0xff, 0xfe, b'h', b'i']);
        let _ = content.as_str_lossy();
    }
}
