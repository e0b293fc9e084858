//! Transport seam
//!
//! The transport is a plain request/response RPC. Its channel also carries
//! unsolicited notifications; both kinds are pushed into the context's
//! inbound channel as [`Inbound`] messages.

use crate::error::SyncError;
use crate::serializer::WriteAction;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerAction {
    List,
    Open,
    Save,
    Delete,
}

impl ServerAction {
    /// Server action carrying a write
    pub fn for_write(action: WriteAction) -> Self {
        match action {
            WriteAction::Create | WriteAction::Update => ServerAction::Save,
            WriteAction::Destroy => ServerAction::Delete,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, ServerAction::Save | ServerAction::Delete)
    }
}

impl fmt::Display for ServerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerAction::List => "list",
            ServerAction::Open => "open",
            ServerAction::Save => "save",
            ServerAction::Delete => "delete",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    pub request_id: RequestId,
    pub module: String,
    pub action: ServerAction,
    pub payload: Value,
}

/// Messages arriving from the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Inbound {
    /// Answer to a request this client sent
    Response {
        request_id: RequestId,
        module: String,
        payload: Value,
    },
    /// Unsolicited push
    Notification { module: String, payload: Value },
    /// Session is closing
    Shutdown,
}

pub trait Transport: Send + Sync {
    fn send(&self, request: OutboundRequest) -> Result<(), SyncError>;
}

/// Transport that keeps every request in memory. Used by tests and the
/// replay tool, where responses are fed back by hand.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<OutboundRequest>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundRequest> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain the recorded requests
    pub fn take(&self) -> Vec<OutboundRequest> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn last(&self) -> Option<OutboundRequest> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl Transport for RecordingTransport {
    fn send(&self, request: OutboundRequest) -> Result<(), SyncError> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbound_wire_shape() {
        let msg: Inbound = serde_json::from_value(json!({
            "kind": "notification",
            "module": "hierarchynotifier",
            "payload": {"update": {}}
        }))
        .unwrap();
        match msg {
            Inbound::Notification { module, .. } => assert_eq!(module, "hierarchynotifier"),
            _ => panic!("Expected Notification"),
        }
    }

    #[test]
    fn test_write_actions_map_to_server_actions() {
        assert_eq!(ServerAction::for_write(WriteAction::Create), ServerAction::Save);
        assert_eq!(ServerAction::for_write(WriteAction::Update), ServerAction::Save);
        assert_eq!(ServerAction::for_write(WriteAction::Destroy), ServerAction::Delete);
    }

    #[test]
    fn test_recording_transport_take_drains() {
        let t = RecordingTransport::new();
        t.send(OutboundRequest {
            request_id: RequestId(1),
            module: "maillistmodule".into(),
            action: ServerAction::List,
            payload: json!({}),
        })
        .unwrap();
        assert_eq!(t.take().len(), 1);
        assert!(t.sent().is_empty());
    }
}
