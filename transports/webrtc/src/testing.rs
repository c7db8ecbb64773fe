//! Scripted native connections for tests
//!
//! [`FakePeerConnection`] records every call the session makes and flags
//! candidates applied before a remote description. [`FakeConnectionFactory`]
//! keeps the event sink of each connection it built so tests can play the
//! native stack's callbacks.

use crate::config::DataChannelMode;
use crate::ice::IceCandidate;
use crate::media::devices::{MediaTrack, TrackKind};
use crate::peer::native::{
    NativeConnectionFactory, NativeEvent, NativeEventKind, NativeEventSink, NativePeerConnection,
    NativeStats,
};
use crate::signaling::protocol::SessionDescription;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Default)]
struct FakeState {
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    applied: Vec<String>,
    order_violations: usize,
    rejected: HashSet<String>,
    fail_offers: bool,
    senders: HashMap<TrackKind, String>,
    track_count: usize,
    data_channels: Vec<String>,
    sent: Vec<(String, Bytes)>,
    stats: NativeStats,
    close_count: usize,
    data_channel_close_count: usize,
}

/// In-memory stand-in for a native peer connection
pub struct FakePeerConnection {
    peer_id: String,
    state: Mutex<FakeState>,
}

impl FakePeerConnection {
    pub fn new(peer_id: &str) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            state: Mutex::new(FakeState::default()),
        }
    }

    /// Candidates accepted so far, in application order
    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }

    /// Candidates offered before any remote description was set
    pub fn order_violations(&self) -> usize {
        self.state.lock().order_violations
    }

    /// Make `add_ice_candidate` fail for this candidate string
    pub fn reject_candidate(&self, candidate: &str) {
        self.state.lock().rejected.insert(candidate.to_string());
    }

    /// Make every later `create_offer` fail
    pub fn fail_offers(&self) {
        self.state.lock().fail_offers = true;
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    pub fn data_channel_close_count(&self) -> usize {
        self.state.lock().data_channel_close_count
    }

    pub fn track_count(&self) -> usize {
        self.state.lock().track_count
    }

    /// Id of the track currently sent for `kind`
    pub fn current_track(&self, kind: TrackKind) -> Option<String> {
        self.state.lock().senders.get(&kind).cloned()
    }

    pub fn data_channels(&self) -> Vec<String> {
        self.state.lock().data_channels.clone()
    }

    pub fn sent_data(&self) -> Vec<(String, Bytes)> {
        self.state.lock().sent.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local_description.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote_description.clone()
    }

    /// Stats returned by every later `get_stats`
    pub fn set_stats(&self, stats: NativeStats) {
        self.state.lock().stats = stats;
    }

    fn ensure_open(&self, state: &FakeState) -> Result<()> {
        if state.close_count > 0 {
            return Err(Error::Negotiation(format!(
                "connection to {} is closed",
                self.peer_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl NativePeerConnection for FakePeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let state = self.state.lock();
        self.ensure_open(&state)?;
        if state.fail_offers {
            return Err(Error::Negotiation(format!("cannot create offer for {}", self.peer_id)));
        }
        Ok(SessionDescription::offer(&format!("v=0 offer for {}", self.peer_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.state.lock();
        self.ensure_open(&state)?;
        if state.remote_description.is_none() {
            return Err(Error::Negotiation("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer(&format!("v=0 answer for {}", self.peer_id)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        state.local_description = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        state.remote_description = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if state.remote_description.is_none() {
            state.order_violations += 1;
            return Err(Error::Negotiation("remote description not set".to_string()));
        }
        if state.rejected.contains(&candidate.candidate) {
            return Err(Error::Negotiation(format!(
                "malformed candidate {}",
                candidate.candidate
            )));
        }
        state.applied.push(candidate.candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<()> {
        let mut state = self.state.lock();
        state.senders.insert(track.kind(), track.id().to_string());
        state.track_count += 1;
        Ok(())
    }

    async fn replace_track(&self, kind: TrackKind, track: Arc<MediaTrack>) -> Result<()> {
        let mut state = self.state.lock();
        match state.senders.get_mut(&kind) {
            Some(current) => {
                *current = track.id().to_string();
                Ok(())
            }
            None => Err(Error::NoSender(format!("no {:?} sender for {}", kind, self.peer_id))),
        }
    }

    async fn create_data_channel(&self, label: &str, _mode: DataChannelMode) -> Result<()> {
        self.state.lock().data_channels.push(label.to_string());
        Ok(())
    }

    async fn send_data(&self, label: &str, data: Bytes) -> Result<()> {
        let mut state = self.state.lock();
        if !state.data_channels.iter().any(|l| l == label) {
            return Err(Error::DataChannel(format!("no channel {}", label)));
        }
        state.sent.push((label.to_string(), data));
        Ok(())
    }

    async fn get_stats(&self) -> Result<NativeStats> {
        Ok(self.state.lock().stats.clone())
    }

    async fn close_data_channels(&self) -> Result<()> {
        self.state.lock().data_channel_close_count += 1;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().close_count += 1;
        Ok(())
    }
}

#[derive(Default)]
struct FactoryState {
    failing: HashSet<String>,
    connections: HashMap<String, (Arc<FakePeerConnection>, NativeEventSink)>,
    created: usize,
}

/// Builds [`FakePeerConnection`]s and remembers the latest one per peer
#[derive(Default)]
pub struct FakeConnectionFactory {
    state: Mutex<FactoryState>,
}

impl FakeConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connection creation fail for `peer_id`
    pub fn fail_for(&self, peer_id: &str) {
        self.state.lock().failing.insert(peer_id.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// Latest connection built for `peer_id`
    pub fn connection(&self, peer_id: &str) -> Option<Arc<FakePeerConnection>> {
        self.state
            .lock()
            .connections
            .get(peer_id)
            .map(|(c, _)| Arc::clone(c))
    }

    pub fn created_count(&self) -> usize {
        self.state.lock().created
    }

    /// An event as the latest connection for `peer_id` would report it
    pub fn event(&self, peer_id: &str, kind: NativeEventKind) -> Option<NativeEvent> {
        let state = self.state.lock();
        let (_, sink) = state.connections.get(peer_id)?;
        Some(NativeEvent {
            peer_id: sink.peer_id().to_string(),
            connection_id: sink.connection_id().to_string(),
            kind,
        })
    }

    /// Fire a native callback on the latest connection for `peer_id`
    pub fn emit(&self, peer_id: &str, kind: NativeEventKind) {
        let sink = self
            .state
            .lock()
            .connections
            .get(peer_id)
            .map(|(_, s)| s.clone());
        if let Some(sink) = sink {
            sink.emit(kind);
        }
    }
}

#[async_trait]
impl NativeConnectionFactory for FakeConnectionFactory {
    async fn create(
        &self,
        peer_id: &str,
        events: NativeEventSink,
    ) -> Result<Arc<dyn NativePeerConnection>> {
        let mut state = self.state.lock();
        if state.failing.contains(peer_id) {
            return Err(Error::WebRtc(format!("scripted failure for {}", peer_id)));
        }

        let connection = Arc::new(FakePeerConnection::new(peer_id));
        state
            .connections
            .insert(peer_id.to_string(), (Arc::clone(&connection), events));
        state.created += 1;
        Ok(connection)
    }
}
