//! ICE candidate value type and the per-peer pending-candidate buffer

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A remote or local ICE candidate as carried on the signaling wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute line (`candidate:...`)
    pub candidate: String,

    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Index of the m-line this candidate belongs to
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Create a candidate bound to the first m-line
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }
}

/// FIFO queue of candidates that arrived before the remote description
///
/// Candidates are appended in arrival order and only ever leave through
/// [`take_all`](Self::take_all), which empties the buffer in one step.
#[derive(Debug, Default)]
pub struct IceCandidateBuffer {
    queue: VecDeque<IceCandidate>,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a candidate at the back of the queue
    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Remove and return every buffered candidate in arrival order
    pub fn take_all(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }
}

/// Outcome of draining a pending-candidate buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Candidates accepted by the native connection
    pub applied: usize,
    /// Candidates the native connection rejected (logged and skipped)
    pub failed: usize,
}

impl DrainReport {
    pub fn total(&self) -> usize {
        self.applied + self.failed
    }
}
