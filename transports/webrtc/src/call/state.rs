//! Aggregated call state published to the UI layer

use crate::media::coordinator::LocalMediaState;
use crate::media::quality::{CallQualitySample, QualityLevel};
use crate::peer::native::NativeConnectionState;
use crate::peer::record::NegotiationState;
use crate::session::state::SignalingState;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Where the call is from the user's point of view
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    #[default]
    Idle,
    /// Invite sent, nobody accepted yet
    Outgoing,
    /// Incoming invite waiting for answer or reject
    Ringing,
    Connecting,
    Connected,
    Ended,
    Failed,
}

impl CallPhase {
    /// A call is being set up or is running
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            CallPhase::Outgoing | CallPhase::Ringing | CallPhase::Connecting | CallPhase::Connected
        )
    }

    /// Phase implied by a signaling state change
    pub fn after(self, signaling: SignalingState) -> CallPhase {
        match signaling {
            SignalingState::Stable => CallPhase::Connected,
            SignalingState::Failed => CallPhase::Failed,
            SignalingState::Closed => CallPhase::Ended,
            SignalingState::Offering | SignalingState::Answering => match self {
                CallPhase::Connected => CallPhase::Connected,
                _ => CallPhase::Connecting,
            },
            SignalingState::Connecting | SignalingState::Idle => self,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// An invite waiting for the local user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncomingCall {
    pub call_id: String,
    pub from_peer_id: String,
    /// Everyone in the call, local peer included
    pub participant_ids: Vec<String>,
    pub video: bool,
}

/// Media flags a remote participant announced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemoteMediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

impl Default for RemoteMediaState {
    fn default() -> Self {
        Self {
            audio_enabled: true,
            video_enabled: true,
            screen_sharing: false,
        }
    }
}

/// One remote participant as shown in the call UI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantSnapshot {
    pub negotiation_state: NegotiationState,
    pub connection_state: &'static str,
    pub connected: bool,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub quality: Option<f64>,
    pub quality_level: Option<QualityLevel>,
}

impl ParticipantSnapshot {
    pub fn new(
        negotiation_state: NegotiationState,
        connection_state: NativeConnectionState,
        media: RemoteMediaState,
        latest: Option<&CallQualitySample>,
    ) -> Self {
        Self {
            negotiation_state,
            connection_state: connection_state.as_str(),
            connected: connection_state == NativeConnectionState::Connected,
            audio_enabled: media.audio_enabled,
            video_enabled: media.video_enabled,
            screen_sharing: media.screen_sharing,
            quality: latest.map(|s| s.quality_score),
            quality_level: latest.map(CallQualitySample::level),
        }
    }
}

/// Everything the UI needs to render the call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallState {
    pub phase: CallPhase,
    pub call_id: Option<String>,
    pub direction: Option<CallDirection>,
    pub signaling_state: SignalingState,
    pub participants: BTreeMap<String, ParticipantSnapshot>,
    /// Time since the call first became stable
    pub duration: Duration,
    /// Mean of the participants' latest quality scores
    pub quality: Option<f64>,
    pub local_media: LocalMediaState,
    pub video: bool,
    pub incoming: Option<IncomingCall>,
    pub error: Option<String>,
}

impl Default for CallState {
    fn default() -> Self {
        Self {
            phase: CallPhase::Idle,
            call_id: None,
            direction: None,
            signaling_state: SignalingState::Idle,
            participants: BTreeMap::new(),
            duration: Duration::ZERO,
            quality: None,
            local_media: LocalMediaState::default(),
            video: false,
            incoming: None,
            error: None,
        }
    }
}

impl CallState {
    pub fn is_live(&self) -> bool {
        self.phase.is_live()
    }

    pub fn connected_participants(&self) -> usize {
        self.participants.values().filter(|p| p.connected).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_follows_signaling() {
        assert_eq!(CallPhase::Outgoing.after(SignalingState::Connecting), CallPhase::Outgoing);
        assert_eq!(CallPhase::Outgoing.after(SignalingState::Offering), CallPhase::Connecting);
        assert_eq!(CallPhase::Connecting.after(SignalingState::Stable), CallPhase::Connected);
        // a new peer negotiating does not demote a running call
        assert_eq!(CallPhase::Connected.after(SignalingState::Offering), CallPhase::Connected);
        assert_eq!(CallPhase::Connected.after(SignalingState::Closed), CallPhase::Ended);
        assert_eq!(CallPhase::Connecting.after(SignalingState::Failed), CallPhase::Failed);
    }

    #[test]
    fn test_snapshot_connected_flag() {
        let snapshot = ParticipantSnapshot::new(
            NegotiationState::Stable,
            NativeConnectionState::Connected,
            RemoteMediaState::default(),
            Some(&CallQualitySample::new("p1", 40.0, 5.0, 0.0, 1_000_000)),
        );
        assert!(snapshot.connected);
        assert_eq!(snapshot.connection_state, "connected");
        assert_eq!(snapshot.quality_level, Some(QualityLevel::Excellent));

        let mut state = CallState::default();
        state.participants.insert("p1".to_string(), snapshot);
        assert_eq!(state.connected_participants(), 1);
        assert!(!state.is_live());
    }

    #[test]
    fn test_state_serializes() {
        let value = serde_json::to_value(CallState::default()).unwrap();
        assert_eq!(value["phase"], "idle");
        assert_eq!(value["signaling_state"], "idle");
    }
}
