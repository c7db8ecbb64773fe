//! Peer connection management
//!
//! Handles the native connection seam, per-peer negotiation records, and the
//! bounded registry of records for the active call.

pub mod native;
pub mod record;
pub mod registry;
pub mod rtc;

pub use native::{
    NativeConnectionFactory, NativeConnectionState, NativeEvent, NativeEventKind,
    NativeEventSink, NativePeerConnection, NativeStats,
};
pub use record::{CandidateDisposition, CloseHandle, NegotiationState, PeerConnectionRecord};
pub use registry::{PeerRegistry, PeerSlot};
pub use rtc::{RtcConnectionFactory, RtcPeerConnection};
