//! Payload serializers. Pure byte transforms; no I/O.

use anyhow::Result;
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};

/// Codec for serializing and deserializing message payloads.
#[derive(Debug, Clone, Copy)]
pub enum PayloadCodec {
    Json(JsonCodec),
    Msgpack(MsgpackCodec),
}

impl Default for PayloadCodec {
    fn default() -> Self {
        PayloadCodec::Json(JsonCodec)
    }
}

impl PayloadCodec {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        match self {
            PayloadCodec::Json(c) => c.encode(value),
            PayloadCodec::Msgpack(c) => c.encode(value),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            PayloadCodec::Json(c) => c.decode(bytes),
            PayloadCodec::Msgpack(c) => c.decode(bytes),
        }
    }

    /// Codec name for debugging
    pub fn name(&self) -> &'static str {
        match self {
            PayloadCodec::Json(c) => c.name(),
            PayloadCodec::Msgpack(c) => c.name(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn name(&self) -> &'static str {
        "json"
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MsgpackCodec;

impl MsgpackCodec {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn name(&self) -> &'static str {
        "msgpack"
    }
}
