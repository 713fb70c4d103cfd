//! Event bus producer seam and the transport wire format.
//!
//! Raised events are published as a self-describing envelope: the event's
//! type code, the serialized `(version, timestamp)` header, and the
//! serialized payload. Consumers route on the type code without touching
//! the payload. Bare publishes (messages that never enter the event log)
//! use a two-field envelope. Both encode with `serde_json`, the crate's
//! codec throughout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::event::{Event, EventBasicInfo, FullyEvent, StateId};

/// At-least-once producer handle onto the message bus.
#[async_trait]
pub trait EventBusProducer: Send + Sync {
    /// Publish one serialized transport message.
    async fn publish(&self, bytes: &[u8]) -> Result<(), StorageError>;
}

/// Wire envelope for a committed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMessage {
    /// Stable wire identifier of the event payload.
    pub type_code: String,
    /// Serialized [`EventBasicInfo`]: `(version, timestamp)`.
    pub basic_info: Vec<u8>,
    /// Serialized domain event payload.
    pub event: Vec<u8>,
}

/// Wire envelope for a bare publish that never touched the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BareMessage {
    /// Stable wire identifier of the payload.
    pub type_code: String,
    /// Serialized message payload.
    pub payload: Vec<u8>,
}

/// Encode a committed event into transport bytes.
///
/// `payload` is the already-serialized event body (the same bytes handed to
/// the event log), so the bus sees exactly what was persisted.
///
/// # Errors
///
/// Returns `serde_json::Error` if the header or envelope cannot be encoded.
pub fn encode_transport<K: StateId, E: Event>(
    fully: &FullyEvent<K, E>,
    payload: &[u8],
) -> serde_json::Result<Vec<u8>> {
    let msg = TransportMessage {
        type_code: fully.event.type_code().to_string(),
        basic_info: serde_json::to_vec(&fully.basic_info)?,
        event: payload.to_vec(),
    };
    serde_json::to_vec(&msg)
}

/// Encode a bare message into transport bytes.
///
/// # Errors
///
/// Returns `serde_json::Error` if the payload or envelope cannot be encoded.
pub fn encode_bare<M: Event>(message: &M) -> serde_json::Result<Vec<u8>> {
    let msg = BareMessage {
        type_code: message.type_code().to_string(),
        payload: serde_json::to_vec(message)?,
    };
    serde_json::to_vec(&msg)
}

/// Decode the header half of a transport envelope.
///
/// Consumers that only need routing and ordering information can stop here
/// and never deserialize the payload.
pub fn decode_basic_info(msg: &TransportMessage) -> serde_json::Result<EventBasicInfo> {
    serde_json::from_slice(&msg.basic_info)
}
