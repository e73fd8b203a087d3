//! Event envelope and its JSON codec.
//!
//! The broker decodes each published frame once, looks at the uniqueness
//! key to pick a delivery policy, and re-forwards the original frame bytes.
//! It never re-encodes; `encode` exists for the publishing side.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Errors from envelope encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One published event as carried by a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Uniqueness key. When present, the event is delivered to exactly one
    /// worker per suppression window instead of being broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique: Option<String>,
    /// Name of the publishing component.
    pub source: String,
    /// Event name.
    pub event: String,
    /// Opaque payload, forwarded untouched.
    #[serde(default)]
    pub data: String,
}

impl EventEnvelope {
    /// An ordinary event, broadcast to every worker.
    pub fn broadcast(
        source: impl Into<String>,
        event: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            unique: None,
            source: source.into(),
            event: event.into(),
            data: data.into(),
        }
    }

    /// A unique event, delivered to one worker per suppression window.
    pub fn unique(
        key: impl Into<String>,
        source: impl Into<String>,
        event: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        Self {
            unique: Some(key.into()),
            source: source.into(),
            event: event.into(),
            data: data.into(),
        }
    }

    /// Decode one frame.
    pub fn decode(frame: &[u8]) -> Result<Self, CodecError> {
        Ok(serde_json::from_slice(frame)?)
    }

    /// Encode for publishing.
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}
