//! Unified error type for the synchronization core
//!
//! Errors are serializable so the UI collaborator that issued an action can
//! forward them unchanged. Malformed pushes and unresolvable notifications
//! never surface here; they are logged and dropped at the channel edge.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum SyncError {
    /// Programmer error: a diff was requested that the record cannot produce.
    #[error("Invalid record state: {0}")]
    InvalidRecordState(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("No pending request with id {0}")]
    UnknownRequest(u64),

    #[error("Target store no longer exists")]
    StoreGone,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Parse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_serializes_with_type_tag() {
        let err = SyncError::InvalidRecordState("no entryid".to_string());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "InvalidRecordState");
        assert_eq!(json["message"], "no entryid");
    }

    #[test]
    fn test_unit_variant_roundtrip() {
        let json = serde_json::to_string(&SyncError::StoreGone).unwrap();
        let back: SyncError = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, SyncError::StoreGone));
    }
}
