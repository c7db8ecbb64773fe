//! Per-peer connection record

use super::native::{NativeConnectionState, NativePeerConnection};
use crate::config::DataChannelMode;
use crate::ice::{DrainReport, IceCandidate, IceCandidateBuffer};
use crate::media::devices::{MediaTrack, TrackKind};
use crate::signaling::protocol::SessionDescription;
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

/// Offer/answer progress for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationState {
    Idle,
    Offering,
    Answering,
    Stable,
}

/// What happened to a remote candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Handed to the native connection
    Applied,
    /// Queued until the remote description is set
    Buffered,
}

/// Closes a native connection exactly once
///
/// Clones share the same flag, so whichever path gets there first
/// (peer removal, call end, retry) does the work and the rest are no-ops.
#[derive(Clone)]
pub struct CloseHandle {
    peer_id: String,
    connection: Arc<dyn NativePeerConnection>,
    closed: Arc<AtomicBool>,
}

impl CloseHandle {
    /// Close data channels, then the connection. Returns false if already closed.
    ///
    /// Failures are logged; this never errors.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        if let Err(e) = self.connection.close_data_channels().await {
            warn!("Error closing data channels for {}: {}", self.peer_id, e);
        }
        if let Err(e) = self.connection.close().await {
            warn!("Error closing peer connection for {}: {}", self.peer_id, e);
        }

        debug!("Closed connection for peer {}", self.peer_id);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// One remote participant's connection and negotiation bookkeeping
///
/// Candidates reach the native connection only after the remote
/// description is set; anything earlier waits in the pending buffer and is
/// drained in arrival order right after the description is applied.
pub struct PeerConnectionRecord {
    peer_id: String,
    connection_id: String,
    connection: Arc<dyn NativePeerConnection>,
    closed: Arc<AtomicBool>,
    negotiation_state: NegotiationState,
    pending: IceCandidateBuffer,
    remote_description_set: bool,
    connection_state: NativeConnectionState,
    open_channels: BTreeSet<String>,
    attached_tracks: HashSet<String>,
    connected_at: Option<SystemTime>,
}

impl PeerConnectionRecord {
    pub fn new(peer_id: &str, connection_id: &str, connection: Arc<dyn NativePeerConnection>) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            connection_id: connection_id.to_string(),
            connection,
            closed: Arc::new(AtomicBool::new(false)),
            negotiation_state: NegotiationState::Idle,
            pending: IceCandidateBuffer::new(),
            remote_description_set: false,
            connection_state: NativeConnectionState::New,
            open_channels: BTreeSet::new(),
            attached_tracks: HashSet::new(),
            connected_at: None,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiation_state
    }

    pub fn connection_state(&self) -> NativeConnectionState {
        self.connection_state
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    pub fn open_channels(&self) -> impl Iterator<Item = &str> {
        self.open_channels.iter().map(String::as_str)
    }

    pub fn connected_at(&self) -> Option<SystemTime> {
        self.connected_at
    }

    pub fn connection(&self) -> Arc<dyn NativePeerConnection> {
        Arc::clone(&self.connection)
    }

    /// Handle that closes this record's connection exactly once
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            peer_id: self.peer_id.clone(),
            connection: Arc::clone(&self.connection),
            closed: Arc::clone(&self.closed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Generate and apply a local offer
    pub async fn create_offer(&mut self) -> Result<SessionDescription> {
        let offer = self.connection.create_offer().await?;
        self.connection.set_local_description(offer.clone()).await?;

        self.negotiation_state = NegotiationState::Offering;
        Ok(offer)
    }

    /// Apply a remote offer and drain buffered candidates
    pub async fn apply_remote_offer(&mut self, offer: SessionDescription) -> Result<DrainReport> {
        self.connection.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.negotiation_state = NegotiationState::Answering;

        Ok(self.drain().await)
    }

    /// Generate and apply the answer to a previously applied remote offer
    pub async fn create_answer(&mut self) -> Result<SessionDescription> {
        if !self.remote_description_set || self.negotiation_state != NegotiationState::Answering {
            return Err(Error::InvalidState(format!(
                "cannot answer peer {} in state {:?} without a pending remote offer",
                self.peer_id, self.negotiation_state
            )));
        }

        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;

        self.negotiation_state = NegotiationState::Stable;
        Ok(answer)
    }

    /// Apply the remote answer to our offer and drain buffered candidates
    pub async fn apply_remote_answer(&mut self, answer: SessionDescription) -> Result<DrainReport> {
        if self.negotiation_state != NegotiationState::Offering {
            return Err(Error::InvalidState(format!(
                "unexpected answer from peer {} in state {:?}",
                self.peer_id, self.negotiation_state
            )));
        }

        self.connection.set_remote_description(answer).await?;
        self.remote_description_set = true;
        let report = self.drain().await;

        self.negotiation_state = NegotiationState::Stable;
        Ok(report)
    }

    /// Apply a remote candidate now, or queue it until the remote description is set
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition> {

        if !self.remote_description_set {
            self.pending.push(candidate);
            debug!(
                "Buffered candidate for {} ({} pending)",
                self.peer_id,
                self.pending.len()
            );
            return Ok(CandidateDisposition::Buffered);
        }

        self.connection.add_ice_candidate(candidate).await?;
        Ok(CandidateDisposition::Applied)
    }

    /// Apply every buffered candidate in arrival order
    ///
    /// A rejected candidate is logged and skipped; the buffer is always left empty.
    async fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();

        for candidate in self.pending.take_all() {
            match self.connection.add_ice_candidate(candidate).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!("Skipping buffered candidate for {}: {}", self.peer_id, e);
                    report.failed += 1;
                }
            }
        }

        if report.total() > 0 {
            debug!(
                "Drained {} candidates for {} ({} failed)",
                report.total(),
                self.peer_id,
                report.failed
            );
        }
        report
    }

    /// Move buffered candidates out, to be carried over to a replacement connection
    pub fn take_pending(&mut self) -> Vec<IceCandidate> {
        self.pending.take_all()
    }

    /// Queue candidates carried over from a replaced connection, ahead of any later ones
    pub fn restore_pending(&mut self, candidates: Vec<IceCandidate>) {
        debug_assert!(!self.remote_description_set);
        for candidate in candidates {
            self.pending.push(candidate);
        }
    }

    /// Attach tracks not yet sent on this connection; returns how many were added
    pub async fn attach_tracks(&mut self, tracks: &[Arc<MediaTrack>]) -> Result<usize> {
        let mut added = 0;
        for track in tracks {
            if self.attached_tracks.contains(track.id()) {
                continue;
            }
            self.connection.add_track(Arc::clone(track)).await?;
            self.attached_tracks.insert(track.id().to_string());
            added += 1;
        }
        Ok(added)
    }

    pub async fn replace_track(&mut self, kind: TrackKind, track: Arc<MediaTrack>) -> Result<()> {
        let id = track.id().to_string();
        self.connection.replace_track(kind, track).await?;
        self.attached_tracks.insert(id);
        Ok(())
    }

    pub async fn create_data_channel(&mut self, label: &str, mode: DataChannelMode) -> Result<()> {
        self.connection.create_data_channel(label, mode).await
    }

    /// Record a native state report; returns true if it changed
    pub fn set_connection_state(&mut self, state: NativeConnectionState) -> bool {
        if self.connection_state == state {
            return false;
        }
        if state == NativeConnectionState::Connected && self.connected_at.is_none() {
            self.connected_at = Some(SystemTime::now());
        }
        self.connection_state = state;
        true
    }

    pub fn channel_opened(&mut self, label: &str) {
        self.open_channels.insert(label.to_string());
    }

    pub fn channel_closed(&mut self, label: &str) {
        self.open_channels.remove(label);
    }
}
