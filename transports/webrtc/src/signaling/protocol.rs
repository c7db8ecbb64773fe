//! Signaling wire format
//!
//! Every message is a flat JSON object carrying `call_id`, `from_peer_id` and
//! `to_peer_id`, an `action` discriminator and the action's payload fields:
//!
//! ```json
//! {"call_id":"c1","from_peer_id":"alice","to_peer_id":"bob",
//!  "action":"webrtc_offer","offer":{"sdp":"v=0...","type":"offer"}}
//! ```
//!
//! Inbound text is parsed once at the transport boundary into
//! [`SignalingMessage`]; nothing past the transport sees untyped maps except
//! the free-form diagnostics of `webrtc_ice_candidate_error`.

use crate::ice::IceCandidate;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// SDP description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,

    #[serde(rename = "type")]
    pub sdp_type: SdpType,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Offer,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: SdpType::Answer,
        }
    }
}

/// Action-specific part of a signaling message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SignalingBody {
    /// SDP offer for the addressed peer
    WebrtcOffer { offer: SessionDescription },

    /// SDP answer to a previous offer
    WebrtcAnswer { answer: SessionDescription },

    /// Trickled ICE candidate
    WebrtcIceCandidate { candidate: IceCandidate },

    /// Diagnostic report about a candidate the sender could not use
    WebrtcIceCandidateError {
        #[serde(flatten)]
        details: Map<String, Value>,
    },

    /// Invitation to join a call with the listed participants
    CallInvite {
        participant_ids: Vec<String>,
        #[serde(default)]
        video: bool,
    },

    /// Invitee accepted and is ready to negotiate
    CallAccept,

    /// Invitee declined
    CallReject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Sender ended the call for everyone
    CallEnd,

    /// Sender left a group call that continues without it
    ParticipantLeft,

    /// Sender's local media flags changed
    MediaState {
        audio_enabled: bool,
        video_enabled: bool,
        #[serde(default)]
        screen_sharing: bool,
    },
}

impl SignalingBody {
    /// Wire name of the action
    pub fn action(&self) -> &'static str {
        match self {
            SignalingBody::WebrtcOffer { .. } => "webrtc_offer",
            SignalingBody::WebrtcAnswer { .. } => "webrtc_answer",
            SignalingBody::WebrtcIceCandidate { .. } => "webrtc_ice_candidate",
            SignalingBody::WebrtcIceCandidateError { .. } => "webrtc_ice_candidate_error",
            SignalingBody::CallInvite { .. } => "call_invite",
            SignalingBody::CallAccept => "call_accept",
            SignalingBody::CallReject { .. } => "call_reject",
            SignalingBody::CallEnd => "call_end",
            SignalingBody::ParticipantLeft => "participant_left",
            SignalingBody::MediaState { .. } => "media_state",
        }
    }

    /// True for the offer/answer/candidate family handled by the signaling session
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            SignalingBody::WebrtcOffer { .. }
                | SignalingBody::WebrtcAnswer { .. }
                | SignalingBody::WebrtcIceCandidate { .. }
                | SignalingBody::WebrtcIceCandidateError { .. }
        )
    }
}

/// One signaling message with its routing envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub call_id: String,
    pub from_peer_id: String,
    pub to_peer_id: String,

    #[serde(flatten)]
    pub body: SignalingBody,
}

impl SignalingMessage {
    pub fn new(
        call_id: impl Into<String>,
        from_peer_id: impl Into<String>,
        to_peer_id: impl Into<String>,
        body: SignalingBody,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            from_peer_id: from_peer_id.into(),
            to_peer_id: to_peer_id.into(),
            body,
        }
    }

    /// Serialize to JSON text
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn action(&self) -> &'static str {
        self.body.action()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_wire_shape() {
        let msg = SignalingMessage::new(
            "c1",
            "alice",
            "bob",
            SignalingBody::WebrtcOffer {
                offer: SessionDescription::offer("v=0"),
            },
        );

        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["action"], "webrtc_offer");
        assert_eq!(value["call_id"], "c1");
        assert_eq!(value["from_peer_id"], "alice");
        assert_eq!(value["to_peer_id"], "bob");
        assert_eq!(value["offer"]["sdp"], "v=0");
        assert_eq!(value["offer"]["type"], "offer");
    }

    #[test]
    fn test_parse_ice_candidate() {
        let text = r#"{
            "action": "webrtc_ice_candidate",
            "call_id": "c1",
            "from_peer_id": "p1",
            "to_peer_id": "me",
            "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0", "sdpMLineIndex": 0}
        }"#;

        let msg = SignalingMessage::from_json(text).unwrap();
        assert_eq!(msg.action(), "webrtc_ice_candidate");
        match msg.body {
            SignalingBody::WebrtcIceCandidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_candidate_error_keeps_diagnostics() {
        let text = r#"{"action":"webrtc_ice_candidate_error","call_id":"c1",
            "from_peer_id":"p1","to_peer_id":"me","error_code":701,"url":"stun:x"}"#;

        let msg = SignalingMessage::from_json(text).unwrap();
        match msg.body {
            SignalingBody::WebrtcIceCandidateError { details } => {
                assert_eq!(details.get("error_code"), Some(&Value::from(701)));
                assert_eq!(details.get("url"), Some(&Value::from("stun:x")));
            }
            other => panic!("unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_unit_actions() {
        let msg = SignalingMessage::from_json(
            r#"{"action":"call_end","call_id":"c1","from_peer_id":"p1","to_peer_id":"me"}"#,
        )
        .unwrap();
        assert_eq!(msg.body, SignalingBody::CallEnd);
        assert!(!msg.body.is_negotiation());
    }

    #[test]
    fn test_missing_envelope_is_rejected() {
        let result = SignalingMessage::from_json(
            r#"{"action":"webrtc_answer","answer":{"sdp":"v=0","type":"answer"}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let result = SignalingMessage::from_json(
            r#"{"action":"presence","call_id":"c1","from_peer_id":"a","to_peer_id":"b"}"#,
        );
        assert!(result.is_err());
    }
}
