//! Message headers: a small scalar map carried alongside every payload,
//! plus the codec between [`Headers`] and the transport's string header bag.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Well-known header keys.
pub mod well_known {
    /// Wire name of the application message type.
    pub const MESSAGE_TYPE: &str = "message-type";
    /// Opaque unique request identifier.
    pub const REQUEST_ID: &str = "request-id";
    /// Reply channel (topic/queue) name for request/response.
    pub const REPLY_TO: &str = "reply-to";
    /// Absolute request deadline, unix epoch milliseconds. A request whose
    /// deadline has passed must not reach the handler.
    pub const EXPIRES: &str = "expires";
    /// Textual error carried on a fault response.
    pub const ERROR: &str = "error";
}

/// A scalar header value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderValue {
    String(String),
    Int(i64),
    Bool(bool),
    /// Unix epoch milliseconds.
    Timestamp(u64),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::Timestamp(v) => i64::try_from(*v).ok(),
            HeaderValue::String(s) => s.parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HeaderValue::Bool(v) => Some(*v),
            HeaderValue::String(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<u64> {
        match self {
            HeaderValue::Timestamp(v) => Some(*v),
            HeaderValue::Int(v) => u64::try_from(*v).ok(),
            HeaderValue::String(s) => s.parse().ok(),
            HeaderValue::Bool(_) => None,
        }
    }

    /// Wire form used in the transport header bag.
    fn encode(&self) -> String {
        match self {
            HeaderValue::String(s) => s.clone(),
            HeaderValue::Int(v) => v.to_string(),
            HeaderValue::Bool(v) => v.to_string(),
            HeaderValue::Timestamp(v) => v.to_string(),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<u64> for HeaderValue {
    fn from(value: u64) -> Self {
        HeaderValue::Timestamp(value)
    }
}

/// An ordered map of scalar header values. Decoded headers hold string
/// values; the typed accessors coerce on read, so a round trip through the
/// transport bag preserves every scalar kind observably.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    entries: BTreeMap<String, HeaderValue>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<HeaderValue>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HeaderValue)> {
        self.entries.iter()
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(HeaderValue::as_str)
    }

    pub fn timestamp(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(HeaderValue::as_timestamp)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.string(well_known::MESSAGE_TYPE)
    }

    pub fn request_id(&self) -> Option<&str> {
        self.string(well_known::REQUEST_ID)
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.string(well_known::REPLY_TO)
    }

    pub fn expires(&self) -> Option<u64> {
        self.timestamp(well_known::EXPIRES)
    }

    pub fn error(&self) -> Option<&str> {
        self.string(well_known::ERROR)
    }

    /// Encode into the transport header bag.
    pub fn encode(&self) -> HashMap<String, String> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.encode()))
            .collect()
    }

    /// Decode from the transport header bag. Values come back as strings;
    /// the typed accessors parse on demand.
    pub fn decode(bag: &HashMap<String, String>) -> Self {
        let entries = bag
            .iter()
            .map(|(k, v)| (k.clone(), HeaderValue::String(v.clone())))
            .collect();
        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_round_trip_through_bag() {
        let mut headers = Headers::new();
        headers.insert("name", "echo");
        headers.insert("count", 42i64);
        headers.insert("flag", true);
        headers.insert(well_known::EXPIRES, 1_700_000_000_000u64);

        let bag = headers.encode();
        let decoded = Headers::decode(&bag);

        assert_eq!(decoded.string("name"), Some("echo"));
        assert_eq!(decoded.get("count").and_then(HeaderValue::as_int), Some(42));
        assert_eq!(
            decoded.get("flag").and_then(HeaderValue::as_bool),
            Some(true)
        );
        assert_eq!(decoded.expires(), Some(1_700_000_000_000));
    }

    #[test]
    fn test_well_known_accessors() {
        let mut headers = Headers::new();
        headers.insert(well_known::MESSAGE_TYPE, "some.Message");
        headers.insert(well_known::REQUEST_ID, "r-1");
        headers.insert(well_known::REPLY_TO, "replies");
        headers.insert(well_known::ERROR, "boom");

        assert_eq!(headers.message_type(), Some("some.Message"));
        assert_eq!(headers.request_id(), Some("r-1"));
        assert_eq!(headers.reply_to(), Some("replies"));
        assert_eq!(headers.error(), Some("boom"));
        assert_eq!(headers.expires(), None);
    }

    #[test]
    fn test_non_numeric_expires_is_none() {
        let mut bag = HashMap::new();
        bag.insert(well_known::EXPIRES.to_string(), "soon".to_string());
        let headers = Headers::decode(&bag);
        assert_eq!(headers.expires(), None);
    }
}
