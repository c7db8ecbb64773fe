//! Values published by the signaling session

use super::state::SignalingState;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::time::SystemTime;

/// Kind of [`SignalingEvent`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalingEventKind {
    Offer,
    Answer,
    IceCandidate,
    IceCandidateError,
    ConnectionStateChange,
    DataChannelOpen,
    DataChannelClose,
    DataChannelMessage,
}

/// Immutable record of something that happened on the session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalingEvent {
    kind: SignalingEventKind,
    call_id: String,
    from_peer_id: String,
    payload: Map<String, Value>,
    timestamp: SystemTime,
}

impl SignalingEvent {
    pub fn new(
        kind: SignalingEventKind,
        call_id: &str,
        from_peer_id: &str,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            kind,
            call_id: call_id.to_string(),
            from_peer_id: from_peer_id.to_string(),
            payload,
            timestamp: SystemTime::now(),
        }
    }

    pub fn kind(&self) -> SignalingEventKind {
        self.kind
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn from_peer_id(&self) -> &str {
        &self.from_peer_id
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }
}

/// Build a payload map from `(key, value)` pairs
pub fn payload<const N: usize>(entries: [(&str, Value); N]) -> Map<String, Value> {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// The active call as seen by the signaling session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSession {
    pub call_id: String,
    pub local_peer_id: String,
    pub participant_ids: BTreeSet<String>,
    pub state: SignalingState,
    pub created_at: SystemTime,
}

impl CallSession {
    pub fn new(call_id: &str, local_peer_id: &str) -> Self {
        Self {
            call_id: call_id.to_string(),
            local_peer_id: local_peer_id.to_string(),
            participant_ids: BTreeSet::new(),
            state: SignalingState::Connecting,
            created_at: SystemTime::now(),
        }
    }
}
