//! Head notifications delivered by the live `newHeads` subscription.
use std::pin::Pin;

use alloy_primitives::BlockHash;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lightweight header announced by the live feed. The full block must still be
/// fetched by number.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HeadNotification {
    /// Block number
    pub number: u64,
    /// Block hash
    pub hash: BlockHash,
    /// Block timestamp
    pub timestamp: u64,
}

/// A notification payload that could not be turned into a [`HeadNotification`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotificationError {
    /// The payload is not a JSON object
    #[error("notification payload is not an object")]
    NotAnObject,
    /// A required field is absent
    #[error("notification is missing field `{0}`")]
    MissingField(&'static str),
    /// A field is present but cannot be decoded
    #[error("notification field `{field}` is invalid: {value}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// Raw value as received
        value: String,
    },
}

/// Stream of head notifications. Malformed payloads are yielded as errors so the
/// consumer can skip them without ending the stream.
pub type HeadStream = Pin<Box<dyn Stream<Item = Result<HeadNotification, NotificationError>> + Send>>;

impl HeadNotification {
    /// Decode a raw `newHeads` result object.
    pub fn from_json(value: &Value) -> Result<Self, NotificationError> {
        let obj = value.as_object().ok_or(NotificationError::NotAnObject)?;

        let number = hex_quantity(obj.get("number"), "number")?;
        let timestamp = hex_quantity(obj.get("timestamp"), "timestamp")?;
        let raw_hash = obj.get("hash").ok_or(NotificationError::MissingField("hash"))?;
        let hash = raw_hash.as_str().and_then(|s| s.parse::<BlockHash>().ok()).ok_or_else(|| {
            NotificationError::InvalidField { field: "hash", value: raw_hash.to_string() }
        })?;

        Ok(Self { number, hash, timestamp })
    }
}

fn hex_quantity(value: Option<&Value>, field: &'static str) -> Result<u64, NotificationError> {
    let value = value.ok_or(NotificationError::MissingField(field))?;
    value
        .as_str()
        .and_then(|s| s.strip_prefix("0x"))
        .and_then(|digits| u64::from_str_radix(digits, 16).ok())
        .ok_or_else(|| NotificationError::InvalidField { field, value: value.to_string() })
}
