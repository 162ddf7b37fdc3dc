use bytes::Bytes;
use http::header::{HeaderValue, InvalidHeaderValue};
use std::fmt;
use std::str::{from_utf8, from_utf8_unchecked, Utf8Error};

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

/// A wrapper containing a [`Bytes`] that is guaranteed to be valid utf-8.
///
/// The b2 server hands out strings (tokens, urls, account ids) that this crate turns
/// around and reuses as header values or url fragments. Storing them as shared `Bytes`
/// means a token can be attached to a request without copying the string.
///
/// [`Bytes`]: https://docs.rs/bytes/1/bytes/struct.Bytes.html
#[derive(Clone, PartialEq, Eq)]
pub struct BytesString {
    inner: Bytes,
}
impl BytesString {
    /// Creates a `BytesString` from the provided bytes, checking that they are valid
    /// utf-8.
    pub fn new(inner: Bytes) -> Result<BytesString, Utf8Error> {
        from_utf8(&inner[..])?;
        Ok(BytesString { inner })
    }
    /// Get a reference to the inner string.
    pub fn as_str(&self) -> &str {
        // Checked in new() and the various From impls.
        unsafe { from_utf8_unchecked(&self.inner[..]) }
    }
    /// The length of the string in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }
    /// Returns true if the string is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
    /// Turn the string into a header value without copying it.
    pub(crate) fn as_header(&self) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_maybe_shared(self.inner.clone())
    }
}
impl From<BytesString> for Bytes {
    fn from(v: BytesString) -> Bytes {
        v.inner
    }
}
impl From<String> for BytesString {
    fn from(v: String) -> BytesString {
        BytesString {
            inner: Bytes::from(v),
        }
    }
}
impl<'a> From<&'a str> for BytesString {
    fn from(v: &'a str) -> BytesString {
        BytesString {
            inner: Bytes::from(v.to_string()),
        }
    }
}
impl AsRef<str> for BytesString {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
impl PartialEq<str> for BytesString {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}
impl fmt::Display for BytesString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.as_str(), f)
    }
}
impl fmt::Debug for BytesString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}
impl Serialize for BytesString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
impl<'de> Deserialize<'de> for BytesString {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(BytesString::from(String::deserialize(deserializer)?))
    }
}
