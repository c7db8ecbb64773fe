//! Native peer-connection seam
//!
//! The session logic only talks to these traits. [`super::rtc`] implements
//! them on webrtc-rs; tests plug in scripted fakes.
//!
//! Callbacks from the native stack are not invoked on session state directly.
//! Each connection gets a [`NativeEventSink`] and pushes [`NativeEvent`]s into
//! one channel that the session drains on its own task.

use crate::config::DataChannelMode;
use crate::ice::IceCandidate;
use crate::media::devices::{MediaTrack, TrackKind};
use crate::signaling::protocol::SessionDescription;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Connection state reported by the native stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl NativeConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NativeConnectionState::New => "new",
            NativeConnectionState::Connecting => "connecting",
            NativeConnectionState::Connected => "connected",
            NativeConnectionState::Disconnected => "disconnected",
            NativeConnectionState::Failed => "failed",
            NativeConnectionState::Closed => "closed",
        }
    }
}

/// Something the native connection reported
#[derive(Debug, Clone, PartialEq)]
pub enum NativeEventKind {
    /// Locally gathered ICE candidate to trickle to the peer
    LocalCandidate(IceCandidate),
    ConnectionState(NativeConnectionState),
    DataChannelOpen { label: String },
    DataChannelClose { label: String },
    DataChannelMessage {
        label: String,
        data: Bytes,
        is_text: bool,
    },
}

/// Native event tagged with the connection that produced it
///
/// `connection_id` lets the session discard events from a connection that
/// has since been replaced or closed.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeEvent {
    pub peer_id: String,
    pub connection_id: String,
    pub kind: NativeEventKind,
}

/// Sending half handed to a connection for its callbacks
#[derive(Debug, Clone)]
pub struct NativeEventSink {
    peer_id: String,
    connection_id: String,
    tx: mpsc::UnboundedSender<NativeEvent>,
}

impl NativeEventSink {
    pub fn new(peer_id: &str, connection_id: &str, tx: mpsc::UnboundedSender<NativeEvent>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            connection_id: connection_id.to_string(),
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn emit(&self, kind: NativeEventKind) {
        let event = NativeEvent {
            peer_id: self.peer_id.clone(),
            connection_id: self.connection_id.clone(),
            kind,
        };
        if self.tx.send(event).is_err() {
            debug!(peer_id = %self.peer_id, "Native event dropped, session gone");
        }
    }
}

/// Counters read from a connection's statistics report
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeStats {
    pub round_trip_time_ms: Option<f64>,
    /// Only set when the stack reports it; estimated from RTT otherwise
    pub jitter_ms: Option<f64>,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// One native peer connection
#[async_trait]
pub trait NativePeerConnection: Send + Sync {
    /// Generate a local offer (not yet applied)
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Generate a local answer (not yet applied)
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Attach an outbound track
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<()>;

    /// Swap the track of the outbound sender of `kind` without renegotiation
    ///
    /// Fails with [`crate::Error::NoSender`] when no sender of that kind exists.
    async fn replace_track(&self, kind: TrackKind, track: Arc<MediaTrack>) -> Result<()>;

    async fn create_data_channel(&self, label: &str, mode: DataChannelMode) -> Result<()>;

    async fn send_data(&self, label: &str, data: Bytes) -> Result<()>;

    async fn get_stats(&self) -> Result<NativeStats>;

    /// Close every data channel owned by this connection
    async fn close_data_channels(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Builds native connections for the session
#[async_trait]
pub trait NativeConnectionFactory: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        events: NativeEventSink,
    ) -> Result<Arc<dyn NativePeerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = NativeEventSink::new("p1", "conn-1", tx);

        sink.emit(NativeEventKind::ConnectionState(NativeConnectionState::Connected));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.peer_id, "p1");
        assert_eq!(event.connection_id, "conn-1");
        assert_eq!(
            event.kind,
            NativeEventKind::ConnectionState(NativeConnectionState::Connected)
        );
    }

    #[test]
    fn test_sink_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = NativeEventSink::new("p1", "conn-1", tx);
        sink.emit(NativeEventKind::DataChannelOpen {
            label: "control".to_string(),
        });
    }
}
