//! Typed access to message headers.
//!
//! Brokers hand header values over as either text or raw bytes (the .NET
//! publisher writes trace fields as byte arrays). Callers never see that
//! difference: [`Headers::get_str`] accepts both and treats empty values as
//! absent.

use std::collections::BTreeMap;

/// A single header value as it came off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl HeaderValue {
    fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s.as_str()),
            HeaderValue::Bytes(b) => std::str::from_utf8(b).ok(),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Text(value)
    }
}

impl From<Vec<u8>> for HeaderValue {
    fn from(value: Vec<u8>) -> Self {
        HeaderValue::Bytes(value)
    }
}

/// String-keyed header map attached to a delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    values: BTreeMap<String, HeaderValue>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, mostly useful in tests.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.values.insert(key.into(), value.into());
    }

    /// Returns the value for `key` as a string.
    ///
    /// Missing keys, empty values and byte values that are not valid UTF-8 all
    /// come back as `None`.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .and_then(HeaderValue::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_and_bytes_both_decode() {
        let headers = Headers::new()
            .with("message_id", "m-1")
            .with("traceparent", b"00-abc".to_vec());

        assert_eq!(headers.get_str("message_id"), Some("m-1"));
        assert_eq!(headers.get_str("traceparent"), Some("00-abc"));
    }

    #[test]
    fn test_empty_value_is_absent() {
        let headers = Headers::new()
            .with("correlation_id", "")
            .with("message_id", Vec::new());

        assert_eq!(headers.get_str("correlation_id"), None);
        assert_eq!(headers.get_str("message_id"), None);
        assert_eq!(headers.get_str("missing"), None);
    }

    #[test]
    fn test_invalid_utf8_is_absent() {
        let headers = Headers::new().with("x", vec![0xff, 0xfe]);
        assert_eq!(headers.get_str("x"), None);
        assert_eq!(headers.len(), 1);
    }
}
