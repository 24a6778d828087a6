//! Command payloads and their decoder.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Request to send one email, as published by the applications service.
///
/// Every field may be missing, `null`, empty or zero; unknown fields are
/// ignored. Only structurally malformed documents fail to decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendEmailCommand {
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub to: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub subject: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub body: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub application_id: String,
    #[serde(default)]
    pub interview_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub job_id: i64,
}

/// Publishers write `null` for unset values; treat it like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Payload could not be decoded into a command.
///
/// Always poison: the same bytes fail the same way on every retry.
#[derive(Debug, Error)]
#[error("invalid command payload: {source}")]
pub struct DecodeError {
    pub raw: Vec<u8>,
    #[source]
    pub source: serde_json::Error,
}

impl DecodeError {
    /// Raw payload for diagnostic logging.
    pub fn raw_lossy(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }
}

/// Decode payload bytes into a [`SendEmailCommand`].
pub fn decode(bytes: &[u8]) -> Result<SendEmailCommand, DecodeError> {
    serde_json::from_slice(bytes).map_err(|source| DecodeError {
        raw: bytes.to_vec(),
        source,
    })
}
