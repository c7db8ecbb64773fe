//! Signaling session: one call, N peer connections
//!
//! Routes inbound signaling messages to the right [`PeerConnectionRecord`],
//! drives offer/answer creation, turns native connection events into
//! [`SignalingEvent`]s and keeps the call-level [`SignalingState`].
//!
//! Every inbound handler checks that the message belongs to the active call
//! before doing any work, and re-checks the call generation after each
//! await so work for a call that ended mid-flight is discarded.

use super::event::{payload, CallSession, SignalingEvent, SignalingEventKind};
use super::state::{SignalingState, SignalingStateMachine, SignalingTrigger, StateChange};
use crate::config::{CallConfig, DataChannelMode};
use crate::media::devices::MediaTrack;
use crate::peer::native::{
    NativeConnectionFactory, NativeConnectionState, NativeEvent, NativeEventKind, NativeEventSink,
};
use crate::peer::record::{CandidateDisposition, NegotiationState, PeerConnectionRecord};
use crate::peer::registry::{PeerRegistry, PeerSlot};
use crate::signaling::protocol::{SignalingBody, SignalingMessage};
use crate::signaling::transport::SignalingTransport;
use crate::{Error, Result};
use base64::Engine;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Label of the per-peer data channel opened by the offering side
pub const CONTROL_CHANNEL: &str = "control";

type RecordGuard = OwnedMutexGuard<PeerConnectionRecord>;

/// Orchestrates the peer connections of one call
pub struct SignalingSession {
    local_peer_id: String,
    enable_data_channel: bool,
    data_channel_mode: DataChannelMode,

    transport: Arc<dyn SignalingTransport>,
    factory: Arc<dyn NativeConnectionFactory>,
    registry: PeerRegistry,

    machine: Mutex<SignalingStateMachine>,
    call: RwLock<Option<CallSession>>,
    /// Bumped by every end_call
    generation: AtomicU64,
    local_tracks: RwLock<Vec<Arc<MediaTrack>>>,

    state_tx: watch::Sender<SignalingState>,
    events_tx: broadcast::Sender<SignalingEvent>,
    native_tx: mpsc::UnboundedSender<NativeEvent>,
    native_rx: Mutex<Option<mpsc::UnboundedReceiver<NativeEvent>>>,
}

impl SignalingSession {
    pub fn new(
        config: &CallConfig,
        local_peer_id: &str,
        transport: Arc<dyn SignalingTransport>,
        factory: Arc<dyn NativeConnectionFactory>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SignalingState::Idle);
        let (events_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (native_tx, native_rx) = mpsc::unbounded_channel();

        Self {
            local_peer_id: local_peer_id.to_string(),
            enable_data_channel: config.enable_data_channel,
            data_channel_mode: config.data_channel_mode,
            transport,
            factory,
            registry: PeerRegistry::new(config.max_peers as usize),
            machine: Mutex::new(SignalingStateMachine::new()),
            call: RwLock::new(None),
            generation: AtomicU64::new(0),
            local_tracks: RwLock::new(Vec::new()),
            state_tx,
            events_tx,
            native_tx,
            native_rx: Mutex::new(Some(native_rx)),
        }
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn state(&self) -> SignalingState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SignalingState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SignalingEvent> {
        self.events_tx.subscribe()
    }

    pub fn current_call(&self) -> Option<CallSession> {
        self.call.read().clone()
    }

    /// Id of the call if one is active
    pub fn active_call_id(&self) -> Option<String> {
        self.call
            .read()
            .as_ref()
            .filter(|c| !c.state.is_terminal())
            .map(|c| c.call_id.clone())
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.registry.peer_ids().await
    }

    pub async fn negotiation_state(&self, peer_id: &str) -> Result<NegotiationState> {
        let slot = self.registry.get(peer_id).await?;
        let record = slot.record.lock().await;
        Ok(record.negotiation_state())
    }

    pub async fn pending_candidates(&self, peer_id: &str) -> Result<usize> {
        let slot = self.registry.get(peer_id).await?;
        let record = slot.record.lock().await;
        Ok(record.pending_candidates())
    }

    /// Tracks attached to every connection created from now on
    pub fn set_local_tracks(&self, tracks: Vec<Arc<MediaTrack>>) {
        *self.local_tracks.write() = tracks;
    }

    pub fn local_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.local_tracks.read().clone()
    }

    // ------------------------------------------------------------------
    // Outbound, user-initiated operations. Errors propagate.
    // ------------------------------------------------------------------

    /// Start a call with the given participants
    ///
    /// Creates one record per participant and moves to `connecting`; does not
    /// wait for negotiation. If some connections cannot be created the others
    /// are kept and [`Error::Negotiation`] names the failed peers.
    #[instrument(skip(self, participant_ids), fields(local = %self.local_peer_id))]
    pub async fn start_call(&self, call_id: &str, participant_ids: &[String]) -> Result<()> {
        let generation = self.begin_call(call_id).await?;
        info!("Starting call {} with {} participants", call_id, participant_ids.len());

        let mut failed = Vec::new();
        for peer_id in participant_ids {
            if *peer_id == self.local_peer_id {
                continue;
            }
            if let Err(e) = self.ensure_peer(peer_id, generation).await {
                warn!("Failed to create connection for {}: {}", peer_id, e);
                failed.push(format!("{} ({})", peer_id, e));
            }
        }

        self.finish_setup(failed).await
    }

    /// Join a call with one remote peer
    ///
    /// Joining the call that is already active just adds the peer.
    #[instrument(skip(self), fields(local = %self.local_peer_id))]
    pub async fn join_call(&self, call_id: &str, remote_peer_id: &str) -> Result<()> {
        let generation = match self.active_generation_for(call_id) {
            Some(generation) => generation,
            None => self.begin_call(call_id).await?,
        };

        let failed = match self.ensure_peer(remote_peer_id, generation).await {
            Ok(_) => Vec::new(),
            Err(e) => vec![format!("{} ({})", remote_peer_id, e)],
        };
        self.finish_setup(failed).await
    }

    /// Create, apply and send a local offer to `peer_id`
    #[instrument(skip(self), fields(local = %self.local_peer_id))]
    pub async fn create_offer(&self, peer_id: &str) -> Result<()> {
        let (call_id, generation) = self.active_call()?;
        let (_slot, mut record) = self
            .lock_live(peer_id)
            .await
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;

        if self.enable_data_channel && record.negotiation_state() == NegotiationState::Idle {
            if let Err(e) = record
                .create_data_channel(CONTROL_CHANNEL, self.data_channel_mode)
                .await
            {
                warn!("Failed to create control channel for {}: {}", peer_id, e);
            }
        }

        let offer = record.create_offer().await?;
        drop(record);
        self.ensure_generation(generation)?;

        self.transition(SignalingTrigger::LocalOffer);
        debug!("Sending offer to {}", peer_id);
        self.send(&call_id, peer_id, SignalingBody::WebrtcOffer { offer })
            .await
    }

    /// Create, apply and send the answer to a previously applied offer
    ///
    /// Fails with [`Error::InvalidState`] if no remote offer is pending.
    #[instrument(skip(self), fields(local = %self.local_peer_id))]
    pub async fn create_answer(&self, peer_id: &str) -> Result<()> {
        let (call_id, generation) = self.active_call()?;
        let (_slot, mut record) = self
            .lock_live(peer_id)
            .await
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;

        let answer = record.create_answer().await?;
        drop(record);
        self.ensure_generation(generation)?;

        self.send(&call_id, peer_id, SignalingBody::WebrtcAnswer { answer })
            .await
    }

    /// Discard a peer's connection and build a fresh one
    ///
    /// The new connection starts idle; the caller decides who offers.
    #[instrument(skip(self), fields(local = %self.local_peer_id))]
    pub async fn retry_peer(&self, peer_id: &str) -> Result<()> {
        let (_, generation) = self.active_call()?;
        let (old_slot, mut old) = self
            .lock_live(peer_id)
            .await
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;

        self.replace_connection(peer_id, &mut old, &old_slot, false, generation)
            .await?;
        info!("Recreated connection for {}", peer_id);
        Ok(())
    }

    /// Send bytes on a peer's control channel
    pub async fn send_data(&self, peer_id: &str, data: Bytes) -> Result<()> {
        let slot = self.registry.get(peer_id).await?;
        let connection = slot.record.lock().await.connection();
        connection.send_data(CONTROL_CHANNEL, data).await
    }

    /// Send a message on the signaling transport
    pub async fn send(&self, call_id: &str, to_peer_id: &str, body: SignalingBody) -> Result<()> {
        let message = SignalingMessage::new(call_id, &self.local_peer_id, to_peer_id, body);
        self.transport.send(message).await
    }

    // ------------------------------------------------------------------
    // Teardown. Never fails.
    // ------------------------------------------------------------------

    /// End the active call
    ///
    /// Closes every connection and data channel exactly once, clears call
    /// state and moves to `closed`. Calling it again, or with no call, is a
    /// no-op.
    #[instrument(skip(self), fields(local = %self.local_peer_id))]
    pub async fn end_call(&self) {
        let ended = self.call.write().take();
        if ended.is_none() && self.registry.is_empty().await {
            debug!("end_call with no active call");
            return;
        }

        self.generation.fetch_add(1, Ordering::SeqCst);
        let slots = self.registry.drain_all().await;
        for (_, slot) in &slots {
            slot.closer.close().await;
        }
        self.local_tracks.write().clear();

        if let Some(call) = ended {
            info!("Call {} ended, closed {} connections", call.call_id, slots.len());
        }
        self.transition(SignalingTrigger::End);
    }

    /// Close and forget one peer, leaving the others untouched
    ///
    /// Returns false if the peer was unknown.
    #[instrument(skip(self), fields(local = %self.local_peer_id))]
    pub async fn remove_peer(&self, peer_id: &str) -> bool {
        let Some(slot) = self.registry.remove(peer_id).await else {
            return false;
        };
        slot.closer.close().await;

        if let Some(call) = self.call.write().as_mut() {
            call.participant_ids.remove(peer_id);
        }
        true
    }

    // ------------------------------------------------------------------
    // Inbound messages. Failures are logged and surfaced as events.
    // ------------------------------------------------------------------

    /// Route one inbound signaling message
    pub async fn handle_message(&self, message: &SignalingMessage) {
        match &message.body {
            SignalingBody::WebrtcOffer { .. } => self.handle_remote_offer(message).await,
            SignalingBody::WebrtcAnswer { .. } => self.handle_remote_answer(message).await,
            SignalingBody::WebrtcIceCandidate { .. } => {
                self.handle_remote_ice_candidate(message).await
            }
            SignalingBody::WebrtcIceCandidateError { details } => {
                if self.accepts(message).is_some() {
                    self.emit(
                        SignalingEventKind::IceCandidateError,
                        &message.call_id,
                        &message.from_peer_id,
                        details.clone(),
                    );
                }
            }
            SignalingBody::CallEnd => {
                if self.is_current_call(message) {
                    info!("Call ended by {}", message.from_peer_id);
                    self.end_call().await;
                }
            }
            SignalingBody::ParticipantLeft => {
                if self.accepts(message).is_some() {
                    info!("{} left the call", message.from_peer_id);
                    self.remove_peer(&message.from_peer_id).await;
                    if self.registry.is_empty().await {
                        self.end_call().await;
                    }
                }
            }
            _ => debug!("Session ignores {} messages", message.action()),
        }
    }

    /// Apply a remote offer, drain buffered candidates, answer
    pub async fn handle_remote_offer(&self, message: &SignalingMessage) {
        let SignalingBody::WebrtcOffer { offer } = &message.body else {
            return;
        };
        let Some(generation) = self.accepts(message) else {
            debug!("Ignoring offer for inactive call {}", message.call_id);
            return;
        };
        let peer_id = message.from_peer_id.as_str();

        if let Err(e) = self.ensure_peer(peer_id, generation).await {
            warn!("Cannot accept offer from {}: {}", peer_id, e);
            self.emit_failure(&message.call_id, peer_id, "create_connection", &e);
            if self.registry.is_empty().await {
                self.transition(SignalingTrigger::Failure);
            }
            return;
        }

        let Some((slot, mut record)) = self.lock_live(peer_id).await else {
            return;
        };

        if record.negotiation_state() == NegotiationState::Offering {
            // both sides offered; the lower id keeps its offer
            if self.local_peer_id < message.from_peer_id {
                debug!("Offer collision with {}, keeping local offer", peer_id);
                return;
            }
            debug!("Offer collision with {}, yielding", peer_id);
            let replaced = self
                .replace_connection(peer_id, &mut record, &slot, true, generation)
                .await;
            match replaced {
                Ok((_, fresh)) => record = fresh,
                Err(e) => {
                    warn!("Failed to reset connection for {}: {}", peer_id, e);
                    self.emit_failure(&message.call_id, peer_id, "reset_connection", &e);
                    return;
                }
            }
        }

        let report = match record.apply_remote_offer(offer.clone()).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Failed to apply offer from {}: {}", peer_id, e);
                self.emit_failure(&message.call_id, peer_id, "apply_offer", &e);
                return;
            }
        };
        if self.generation() != generation {
            return;
        }
        self.transition(SignalingTrigger::RemoteOffer);

        let answer = match record.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Failed to answer {}: {}", peer_id, e);
                self.emit_failure(&message.call_id, peer_id, "create_answer", &e);
                return;
            }
        };
        drop(record);
        if self.generation() != generation {
            return;
        }

        if let Err(e) = self
            .send(&message.call_id, peer_id, SignalingBody::WebrtcAnswer { answer })
            .await
        {
            warn!("Failed to send answer to {}: {}", peer_id, e);
        }

        self.emit(
            SignalingEventKind::Offer,
            &message.call_id,
            peer_id,
            payload([
                ("sdp", Value::from(offer.sdp.clone())),
                ("drained", Value::from(report.applied)),
                ("drain_failed", Value::from(report.failed)),
            ]),
        );
    }

    /// Apply a remote answer and drain buffered candidates
    pub async fn handle_remote_answer(&self, message: &SignalingMessage) {
        let SignalingBody::WebrtcAnswer { answer } = &message.body else {
            return;
        };
        let Some(generation) = self.accepts(message) else {
            debug!("Ignoring answer for inactive call {}", message.call_id);
            return;
        };
        let peer_id = message.from_peer_id.as_str();

        let Some((_slot, mut record)) = self.lock_live(peer_id).await else {
            warn!("Answer from unknown peer {}", peer_id);
            return;
        };

        let report = match record.apply_remote_answer(answer.clone()).await {
            Ok(report) => report,
            Err(e) => {
                warn!("Failed to apply answer from {}: {}", peer_id, e);
                self.emit_failure(&message.call_id, peer_id, "apply_answer", &e);
                return;
            }
        };
        drop(record);
        if self.generation() != generation {
            return;
        }

        self.transition(SignalingTrigger::RemoteAnswerApplied);
        self.emit(
            SignalingEventKind::Answer,
            &message.call_id,
            peer_id,
            payload([
                ("sdp", Value::from(answer.sdp.clone())),
                ("drained", Value::from(report.applied)),
                ("drain_failed", Value::from(report.failed)),
            ]),
        );
    }

    /// Apply or buffer a remote candidate
    ///
    /// Unknown peers are logged and ignored; otherwise an `iceCandidate`
    /// event is always emitted.
    pub async fn handle_remote_ice_candidate(&self, message: &SignalingMessage) {
        let SignalingBody::WebrtcIceCandidate { candidate } = &message.body else {
            return;
        };
        let Some(generation) = self.accepts(message) else {
            debug!("Ignoring candidate for inactive call {}", message.call_id);
            return;
        };
        let peer_id = message.from_peer_id.as_str();

        let Some((_slot, mut record)) = self.lock_live(peer_id).await else {
            warn!("ICE candidate from unknown peer {}", peer_id);
            return;
        };

        let result = record.add_remote_candidate(candidate.clone()).await;
        drop(record);
        if self.generation() != generation {
            return;
        }

        let mut event_payload = match serde_json::to_value(candidate) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        event_payload.insert(
            "buffered".to_string(),
            Value::Bool(matches!(result, Ok(CandidateDisposition::Buffered))),
        );
        self.emit(
            SignalingEventKind::IceCandidate,
            &message.call_id,
            peer_id,
            event_payload,
        );

        if let Err(e) = result {
            warn!("Failed to apply candidate from {}: {}", peer_id, e);
            self.emit_failure(&message.call_id, peer_id, "add_ice_candidate", &e);
        }
    }

    // ------------------------------------------------------------------
    // Native connection events
    // ------------------------------------------------------------------

    /// Start the task that consumes native connection events
    ///
    /// Can only be started once per session.
    pub fn spawn_event_loop(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut rx = self
            .native_rx
            .lock()
            .take()
            .ok_or_else(|| Error::InvalidState("event loop already running".to_string()))?;
        let session = Arc::downgrade(self);

        Ok(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.handle_native_event(event).await;
            }
            debug!("Native event loop terminated");
        }))
    }

    pub async fn handle_native_event(&self, event: NativeEvent) {
        let slot = match self.registry.try_get(&event.peer_id).await {
            Some(slot) if slot.connection_id == event.connection_id => slot,
            _ => {
                debug!("Dropping event from stale connection of {}", event.peer_id);
                return;
            }
        };
        let Some(call_id) = self.active_call_id() else {
            return;
        };
        let peer_id = event.peer_id.as_str();

        match event.kind {
            NativeEventKind::LocalCandidate(candidate) => {
                if let Err(e) = self
                    .send(&call_id, peer_id, SignalingBody::WebrtcIceCandidate { candidate })
                    .await
                {
                    warn!("Failed to trickle candidate to {}: {}", peer_id, e);
                }
            }
            NativeEventKind::ConnectionState(state) => {
                if !slot.record.lock().await.set_connection_state(state) {
                    return;
                }
                info!("Peer {} connection {}", peer_id, state.as_str());
                self.emit(
                    SignalingEventKind::ConnectionStateChange,
                    &call_id,
                    peer_id,
                    payload([("state", Value::from(state.as_str()))]),
                );

                match state {
                    NativeConnectionState::Connected => {
                        self.transition(SignalingTrigger::PeerConnected);
                    }
                    NativeConnectionState::Failed => {
                        if self.all_peers_failed().await {
                            warn!("Every peer connection failed");
                            self.transition(SignalingTrigger::Failure);
                        }
                    }
                    _ => {}
                }
            }
            NativeEventKind::DataChannelOpen { label } => {
                slot.record.lock().await.channel_opened(&label);
                self.emit(
                    SignalingEventKind::DataChannelOpen,
                    &call_id,
                    peer_id,
                    payload([("label", Value::from(label))]),
                );
            }
            NativeEventKind::DataChannelClose { label } => {
                slot.record.lock().await.channel_closed(&label);
                self.emit(
                    SignalingEventKind::DataChannelClose,
                    &call_id,
                    peer_id,
                    payload([("label", Value::from(label))]),
                );
            }
            NativeEventKind::DataChannelMessage {
                label,
                data,
                is_text,
            } => {
                let body = match (is_text, std::str::from_utf8(&data)) {
                    (true, Ok(text)) => ("text", Value::from(text)),
                    _ => (
                        "data",
                        Value::from(base64::engine::general_purpose::STANDARD.encode(&data)),
                    ),
                };
                self.emit(
                    SignalingEventKind::DataChannelMessage,
                    &call_id,
                    peer_id,
                    payload([("label", Value::from(label)), body]),
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn ensure_generation(&self, generation: u64) -> Result<()> {
        if self.generation() == generation {
            Ok(())
        } else {
            Err(Error::NoActiveCall)
        }
    }

    fn active_call(&self) -> Result<(String, u64)> {
        let call_id = self.active_call_id().ok_or(Error::NoActiveCall)?;
        Ok((call_id, self.generation()))
    }

    fn active_generation_for(&self, call_id: &str) -> Option<u64> {
        let call = self.call.read();
        call.as_ref()
            .filter(|c| c.call_id == call_id && !c.state.is_terminal())
            .map(|_| self.generation())
    }

    /// Generation to work under if the message belongs to the active call
    fn accepts(&self, message: &SignalingMessage) -> Option<u64> {
        if !message.to_peer_id.is_empty() && message.to_peer_id != self.local_peer_id {
            return None;
        }
        self.active_generation_for(&message.call_id)
    }

    /// The message belongs to the current call, active or failed
    fn is_current_call(&self, message: &SignalingMessage) -> bool {
        if !message.to_peer_id.is_empty() && message.to_peer_id != self.local_peer_id {
            return false;
        }
        self.call
            .read()
            .as_ref()
            .map_or(false, |c| c.call_id == message.call_id)
    }

    /// Install a new call session, rejecting if one is active
    ///
    /// Connections still held by a failed call are closed first so the new
    /// call never reuses them.
    async fn begin_call(&self, call_id: &str) -> Result<u64> {
        if let Some(active) = self.active_call_id() {
            return Err(Error::CallAlreadyActive(active));
        }

        let leftovers = self.registry.drain_all().await;
        if !leftovers.is_empty() {
            self.generation.fetch_add(1, Ordering::SeqCst);
            for (_, slot) in &leftovers {
                slot.closer.close().await;
            }
            info!("Closed {} connections left by the previous call", leftovers.len());
        }

        {
            let mut call = self.call.write();
            if let Some(active) = call.as_ref().filter(|c| !c.state.is_terminal()) {
                return Err(Error::CallAlreadyActive(active.call_id.clone()));
            }
            *call = Some(CallSession::new(call_id, &self.local_peer_id));
        }
        self.transition(SignalingTrigger::Start);
        Ok(self.generation())
    }

    /// Report partial or total setup failure
    async fn finish_setup(&self, failed: Vec<String>) -> Result<()> {
        if failed.is_empty() {
            return Ok(());
        }
        if self.registry.is_empty().await {
            self.transition(SignalingTrigger::Failure);
        }
        Err(Error::Negotiation(format!(
            "failed to create connections for {}",
            failed.join(", ")
        )))
    }

    /// Build a native connection and its record with local tracks attached
    async fn create_record(&self, peer_id: &str) -> Result<PeerConnectionRecord> {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let sink = NativeEventSink::new(peer_id, &connection_id, self.native_tx.clone());

        let connection = self
            .factory
            .create(peer_id, sink)
            .await
            .map_err(|e| Error::Negotiation(format!("peer {}: {}", peer_id, e)))?;
        let mut record = PeerConnectionRecord::new(peer_id, &connection_id, connection);

        let tracks = self.local_tracks();
        if !tracks.is_empty() {
            if let Err(e) = record.attach_tracks(&tracks).await {
                warn!("Failed to attach local media for {}: {}", peer_id, e);
            }
        }
        Ok(record)
    }

    /// Get or lazily create the record for a peer
    async fn ensure_peer(&self, peer_id: &str, generation: u64) -> Result<PeerSlot> {
        if let Some(slot) = self.registry.try_get(peer_id).await {
            return Ok(slot);
        }

        let slot = PeerSlot::new(self.create_record(peer_id).await?);
        if self.generation() != generation {
            slot.closer.close().await;
            return Err(Error::NoActiveCall);
        }

        let (current, inserted) = match self.registry.insert_if_absent(peer_id, slot.clone()).await {
            Ok(result) => result,
            Err(e) => {
                slot.closer.close().await;
                return Err(e);
            }
        };
        if !inserted {
            // lost a creation race for the same peer
            slot.closer.close().await;
        }

        if let Some(call) = self.call.write().as_mut() {
            call.participant_ids.insert(peer_id.to_string());
        }
        Ok(current)
    }

    /// Swap the connection behind a locked record for a fresh one
    async fn replace_connection(
        &self,
        peer_id: &str,
        old: &mut PeerConnectionRecord,
        old_slot: &PeerSlot,
        carry_pending: bool,
        generation: u64,
    ) -> Result<(PeerSlot, RecordGuard)> {
        let mut record = self.create_record(peer_id).await?;
        if self.generation() != generation {
            record.close_handle().close().await;
            return Err(Error::NoActiveCall);
        }
        if carry_pending {
            record.restore_pending(old.take_pending());
        }

        let slot = PeerSlot::new(record);
        let guard = Arc::clone(&slot.record).lock_owned().await;
        self.registry.replace(peer_id, slot.clone()).await;
        old_slot.closer.close().await;

        Ok((slot, guard))
    }

    /// Lock the live record of a peer
    ///
    /// A record closed while we waited for its lock has been replaced or
    /// removed; look the peer up again.
    async fn lock_live(&self, peer_id: &str) -> Option<(PeerSlot, RecordGuard)> {
        for _ in 0..3 {
            let slot = self.registry.try_get(peer_id).await?;
            let guard = Arc::clone(&slot.record).lock_owned().await;
            if !guard.is_closed() {
                return Some((slot, guard));
            }
        }
        None
    }

    async fn all_peers_failed(&self) -> bool {
        for (_, slot) in self.registry.slots().await {
            if slot.record.lock().await.connection_state() != NativeConnectionState::Failed {
                return false;
            }
        }
        true
    }

    /// Advance the state machine and publish the new state
    fn transition(&self, trigger: SignalingTrigger) -> Option<StateChange> {
        let change = match self.machine.lock().apply(trigger) {
            Ok(change) => change?,
            Err(e) => {
                debug!("State machine rejected {:?}: {}", trigger, e);
                return None;
            }
        };

        if let Some(call) = self.call.write().as_mut() {
            call.state = change.to;
        }
        self.state_tx.send_if_modified(|state| {
            if *state == change.to {
                false
            } else {
                *state = change.to;
                true
            }
        });

        info!("Signaling state {:?} -> {:?}", change.from, change.to);
        Some(change)
    }

    fn emit(&self, kind: SignalingEventKind, call_id: &str, peer_id: &str, payload: Map<String, Value>) {
        // no subscribers is fine
        let _ = self
            .events_tx
            .send(SignalingEvent::new(kind, call_id, peer_id, payload));
    }

    fn emit_failure(&self, call_id: &str, peer_id: &str, stage: &str, error: &Error) {
        self.emit(
            SignalingEventKind::IceCandidateError,
            call_id,
            peer_id,
            payload([
                ("stage", Value::from(stage)),
                ("error", Value::from(error.to_string())),
            ]),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ice::IceCandidate;
    use crate::signaling::protocol::SessionDescription;
    use crate::signaling::transport::ChannelTransport;
    use crate::testing::FakeConnectionFactory;

    struct Harness {
        session: Arc<SignalingSession>,
        factory: Arc<FakeConnectionFactory>,
        remote: ChannelTransport,
    }

    fn harness() -> Harness {
        let (local, remote) = ChannelTransport::pair();
        let factory = Arc::new(FakeConnectionFactory::new());
        let session = Arc::new(SignalingSession::new(
            &CallConfig::default(),
            "me",
            Arc::new(local),
            factory.clone(),
        ));
        Harness {
            session,
            factory,
            remote,
        }
    }

    fn msg(call_id: &str, from: &str, body: SignalingBody) -> SignalingMessage {
        SignalingMessage::new(call_id, from, "me", body)
    }

    fn candidate(call_id: &str, from: &str, c: &str) -> SignalingMessage {
        msg(
            call_id,
            from,
            SignalingBody::WebrtcIceCandidate {
                candidate: IceCandidate::new(c),
            },
        )
    }

    fn offer(call_id: &str, from: &str) -> SignalingMessage {
        msg(
            call_id,
            from,
            SignalingBody::WebrtcOffer {
                offer: SessionDescription::offer("v=0 remote"),
            },
        )
    }

    fn participants(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_start_call_creates_records() {
        let h = harness();
        h.session
            .start_call("c1", &participants(&["p1", "p2", "me"]))
            .await
            .unwrap();

        assert_eq!(h.session.state(), SignalingState::Connecting);
        assert_eq!(h.session.peer_ids().await, vec!["p1", "p2"]);
        assert_eq!(h.factory.created_count(), 2);
        assert_eq!(
            h.session.negotiation_state("p1").await.unwrap(),
            NegotiationState::Idle
        );
    }

    #[tokio::test]
    async fn test_start_call_rejected_while_active() {
        let h = harness();
        h.session.start_call("c1", &participants(&["p1"])).await.unwrap();

        let err = h.session.start_call("c2", &participants(&["p2"])).await.unwrap_err();
        assert!(matches!(err, Error::CallAlreadyActive(id) if id == "c1"));
    }

    #[tokio::test]
    async fn test_partial_creation_failure_keeps_others() {
        let h = harness();
        h.factory.fail_for("p2");

        let err = h
            .session
            .start_call("c1", &participants(&["p1", "p2"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Negotiation(_)));
        assert_eq!(h.session.peer_ids().await, vec!["p1"]);
        assert_eq!(h.session.state(), SignalingState::Connecting);
    }

    #[tokio::test]
    async fn test_total_creation_failure_fails_session() {
        let h = harness();
        h.factory.fail_for("p1");

        assert!(h.session.start_call("c1", &participants(&["p1"])).await.is_err());
        assert_eq!(h.session.state(), SignalingState::Failed);

        // a failed call can be replaced
        h.session.start_call("c2", &participants(&["p2"])).await.unwrap();
        assert_eq!(h.session.state(), SignalingState::Connecting);
    }

    #[tokio::test]
    async fn test_create_offer_sends_message() {
        let h = harness();
        let mut wire = h.remote.subscribe();
        h.session.start_call("c1", &participants(&["p1", "p2"])).await.unwrap();

        h.session.create_offer("p1").await.unwrap();

        assert_eq!(h.session.state(), SignalingState::Offering);
        assert_eq!(
            h.session.negotiation_state("p1").await.unwrap(),
            NegotiationState::Offering
        );
        let sent = wire.recv().await.unwrap();
        assert_eq!(sent.action(), "webrtc_offer");
        assert_eq!(sent.to_peer_id, "p1");
        assert_eq!(sent.from_peer_id, "me");
        assert_eq!(sent.call_id, "c1");

        let fake = h.factory.connection("p1").unwrap();
        assert_eq!(fake.data_channels(), vec![CONTROL_CHANNEL]);
    }

    #[tokio::test]
    async fn test_create_offer_unknown_peer() {
        let h = harness();
        h.session.start_call("c1", &participants(&["p1"])).await.unwrap();

        let err = h.session.create_offer("p9").await.unwrap_err();
        assert!(matches!(err, Error::UnknownPeer(_)));
    }

    #[tokio::test]
    async fn test_create_answer_without_offer() {
        let h = harness();
        h.session.start_call("c1", &participants(&["p1"])).await.unwrap();

        let err = h.session.create_answer("p1").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_remote_offer_answers_and_emits() {
        let h = harness();
        let mut wire = h.remote.subscribe();
        let mut events = h.session.subscribe_events();
        h.session.join_call("c1", "p1").await.unwrap();

        h.session.handle_message(&offer("c1", "p1")).await;

        assert_eq!(h.session.state(), SignalingState::Answering);
        let sent = wire.recv().await.unwrap();
        assert_eq!(sent.action(), "webrtc_answer");
        assert_eq!(sent.to_peer_id, "p1");

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), SignalingEventKind::Offer);
        assert_eq!(event.from_peer_id(), "p1");
    }

    #[tokio::test]
    async fn test_buffered_candidate_drained_after_offer() {
        let h = harness();
        h.session.join_call("c1", "p1").await.unwrap();

        h.session.handle_message(&candidate("c1", "p1", "candidate:early")).await;
        assert_eq!(h.session.pending_candidates("p1").await.unwrap(), 1);
        let fake = h.factory.connection("p1").unwrap();
        assert!(fake.applied_candidates().is_empty());

        h.session.handle_message(&offer("c1", "p1")).await;

        assert_eq!(h.session.pending_candidates("p1").await.unwrap(), 0);
        assert_eq!(fake.applied_candidates(), vec!["candidate:early"]);
        assert_eq!(fake.order_violations(), 0);
    }

    #[tokio::test]
    async fn test_candidate_for_unknown_peer() {
        let h = harness();
        let mut events = h.session.subscribe_events();
        h.session.start_call("c1", &participants(&["p1"])).await.unwrap();

        h.session.handle_message(&candidate("c1", "p3", "candidate:x")).await;

        assert!(events.try_recv().is_err());
        assert!(!h.session.registry().contains("p3").await);
    }

    #[tokio::test]
    async fn test_candidate_event_always_emitted() {
        let h = harness();
        let mut events = h.session.subscribe_events();
        h.session.join_call("c1", "p1").await.unwrap();

        h.session.handle_message(&candidate("c1", "p1", "candidate:1")).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), SignalingEventKind::IceCandidate);
        assert_eq!(event.payload()["buffered"], Value::Bool(true));
        assert_eq!(event.payload()["candidate"], "candidate:1");
    }

    #[tokio::test]
    async fn test_rejected_candidate_emits_error_event() {
        let h = harness();
        let mut events = h.session.subscribe_events();
        h.session.join_call("c1", "p1").await.unwrap();
        h.session.handle_message(&offer("c1", "p1")).await;
        h.factory.connection("p1").unwrap().reject_candidate("candidate:bad");

        h.session.handle_message(&candidate("c1", "p1", "candidate:bad")).await;

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind())
            .collect();
        assert!(kinds.ends_with(&[
            SignalingEventKind::IceCandidate,
            SignalingEventKind::IceCandidateError
        ]));
    }

    #[tokio::test]
    async fn test_mismatched_call_id_is_ignored() {
        let h = harness();
        let mut events = h.session.subscribe_events();
        h.session.start_call("c1", &participants(&["p1"])).await.unwrap();
        h.session.create_offer("p1").await.unwrap();

        h.session.handle_message(&offer("old-call", "p1")).await;
        h.session
            .handle_message(&msg(
                "old-call",
                "p1",
                SignalingBody::WebrtcAnswer {
                    answer: SessionDescription::answer("v=0"),
                },
            ))
            .await;

        assert!(events.try_recv().is_err());
        assert_eq!(
            h.session.negotiation_state("p1").await.unwrap(),
            NegotiationState::Offering
        );
        assert!(h.factory.connection("p1").unwrap().remote_description().is_none());
    }

    #[tokio::test]
    async fn test_remote_answer_reaches_stable() {
        let h = harness();
        let mut events = h.session.subscribe_events();
        h.session.start_call("c1", &participants(&["p1"])).await.unwrap();
        h.session.create_offer("p1").await.unwrap();
        h.session.handle_message(&candidate("c1", "p1", "candidate:1")).await;

        h.session
            .handle_message(&msg(
                "c1",
                "p1",
                SignalingBody::WebrtcAnswer {
                    answer: SessionDescription::answer("v=0"),
                },
            ))
            .await;

        assert_eq!(h.session.state(), SignalingState::Stable);
        assert_eq!(
            h.session.negotiation_state("p1").await.unwrap(),
            NegotiationState::Stable
        );
        assert_eq!(h.session.pending_candidates("p1").await.unwrap(), 0);

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![SignalingEventKind::IceCandidate, SignalingEventKind::Answer]
        );
    }

    #[tokio::test]
    async fn test_end_call_is_idempotent() {
        let h = harness();
        h.session.start_call("c1", &participants(&["p1", "p2"])).await.unwrap();

        h.session.end_call().await;
        h.session.end_call().await;

        assert_eq!(h.session.state(), SignalingState::Closed);
        assert!(h.session.current_call().is_none());
        assert!(h.session.registry().is_empty().await);
        for peer in ["p1", "p2"] {
            let fake = h.factory.connection(peer).unwrap();
            assert_eq!(fake.close_count(), 1);
            assert_eq!(fake.data_channel_close_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_end_call_without_call() {
        let h = harness();
        h.session.end_call().await;
        assert_eq!(h.session.state(), SignalingState::Idle);
    }

    #[tokio::test]
    async fn test_remove_peer_isolation() {
        let h = harness();
        h.session.start_call("c1", &participants(&["p1", "p2"])).await.unwrap();
        h.session.create_offer("p2").await.unwrap();

        assert!(h.session.remove_peer("p1").await);
        assert!(!h.session.remove_peer("p1").await);

        assert_eq!(h.factory.connection("p1").unwrap().close_count(), 1);
        assert_eq!(h.factory.connection("p2").unwrap().close_count(), 0);
        assert_eq!(h.session.peer_ids().await, vec!["p2"]);
        assert_eq!(
            h.session.negotiation_state("p2").await.unwrap(),
            NegotiationState::Offering
        );
        let call = h.session.current_call().unwrap();
        assert!(!call.participant_ids.contains("p1"));
    }

    #[tokio::test]
    async fn test_participant_left_last_peer_ends_call() {
        let h = harness();
        h.session.start_call("c1", &participants(&["p1"])).await.unwrap();

        h.session
            .handle_message(&msg("c1", "p1", SignalingBody::ParticipantLeft))
            .await;

        assert_eq!(h.session.state(), SignalingState::Closed);
    }

    #[tokio::test]
    async fn test_remote_call_end() {
        let h = harness();
        h.session.start_call("c1", &participants(&["p1", "p2"])).await.unwrap();

        h.session.handle_message(&msg("other", "p1", SignalingBody::CallEnd)).await;
        assert_eq!(h.session.state(), SignalingState::Connecting);

        h.session.handle_message(&msg("c1", "p1", SignalingBody::CallEnd)).await;
        assert_eq!(h.session.state(), SignalingState::Closed);
    }

    #[tokio::test]
    async fn test_retry_peer_replaces_connection() {
        let h = harness();
        h.session.start_call("c1", &participants(&["p1"])).await.unwrap();
        h.session.create_offer("p1").await.unwrap();
        let first = h.factory.connection("p1").unwrap();

        h.session.retry_peer("p1").await.unwrap();

        let second = h.factory.connection("p1").unwrap();
        assert_eq!(first.close_count(), 1);
        assert_eq!(second.close_count(), 0);
        assert_eq!(h.factory.created_count(), 2);
        assert_eq!(
            h.session.negotiation_state("p1").await.unwrap(),
            NegotiationState::Idle
        );
    }

    #[tokio::test]
    async fn test_glare_polite_side_yields() {
        // "me" > "alice": local side yields to the remote offer
        let h = harness();
        h.session.join_call("c1", "alice").await.unwrap();
        h.session.create_offer("alice").await.unwrap();
        h.session.handle_message(&candidate("c1", "alice", "candidate:1")).await;

        h.session.handle_message(&offer("c1", "alice")).await;

        let fresh = h.factory.connection("alice").unwrap();
        assert_eq!(h.factory.created_count(), 2);
        assert!(fresh.remote_description().is_some());
        assert_eq!(fresh.applied_candidates(), vec!["candidate:1"]);
    }

    #[tokio::test]
    async fn test_glare_impolite_side_keeps_offer() {
        // "me" < "zed": local offer wins
        let h = harness();
        h.session.join_call("c1", "zed").await.unwrap();
        h.session.create_offer("zed").await.unwrap();

        h.session.handle_message(&offer("c1", "zed")).await;

        assert_eq!(h.factory.created_count(), 1);
        assert_eq!(
            h.session.negotiation_state("zed").await.unwrap(),
            NegotiationState::Offering
        );
    }

    #[tokio::test]
    async fn test_native_events() {
        let h = harness();
        let _loop = h.session.spawn_event_loop().unwrap();
        assert!(h.session.spawn_event_loop().is_err());

        let mut wire = h.remote.subscribe();
        let mut events = h.session.subscribe_events();
        let mut state = h.session.subscribe_state();
        h.session.start_call("c1", &participants(&["p1"])).await.unwrap();
        h.session.create_offer("p1").await.unwrap();
        wire.recv().await.unwrap();

        h.factory.emit("p1", NativeEventKind::LocalCandidate(IceCandidate::new("candidate:local")));
        let trickled = wire.recv().await.unwrap();
        assert_eq!(trickled.action(), "webrtc_ice_candidate");
        assert_eq!(trickled.to_peer_id, "p1");

        h.factory.emit(
            "p1",
            NativeEventKind::ConnectionState(NativeConnectionState::Connected),
        );
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), SignalingEventKind::ConnectionStateChange);
        assert_eq!(event.payload()["state"], "connected");

        state
            .wait_for(|s| *s == SignalingState::Stable)
            .await
            .unwrap();

        h.factory.emit(
            "p1",
            NativeEventKind::DataChannelMessage {
                label: CONTROL_CHANNEL.to_string(),
                data: Bytes::from_static(b"hello"),
                is_text: true,
            },
        );
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), SignalingEventKind::DataChannelMessage);
        assert_eq!(event.payload()["text"], "hello");
    }

    #[tokio::test]
    async fn test_all_peers_failed() {
        let h = harness();
        h.session.start_call("c1", &participants(&["p1", "p2"])).await.unwrap();
        let failed = NativeEventKind::ConnectionState(NativeConnectionState::Failed);

        h.session.handle_native_event(h.factory.event("p1", failed.clone()).unwrap()).await;
        assert_eq!(h.session.state(), SignalingState::Connecting);

        h.session.handle_native_event(h.factory.event("p2", failed).unwrap()).await;
        assert_eq!(h.session.state(), SignalingState::Failed);
    }

    async fn fail_all(h: &Harness, peers: &[&str]) {
        for peer in peers {
            let failed = NativeEventKind::ConnectionState(NativeConnectionState::Failed);
            h.session
                .handle_native_event(h.factory.event(peer, failed).unwrap())
                .await;
        }
        assert_eq!(h.session.state(), SignalingState::Failed);
    }

    #[tokio::test]
    async fn test_end_call_after_failure_closes_once() {
        let h = harness();
        h.session.start_call("c1", &participants(&["p1", "p2"])).await.unwrap();
        fail_all(&h, &["p1", "p2"]).await;
        assert!(h.session.active_call_id().is_none());

        h.session.end_call().await;
        h.session.end_call().await;

        assert_eq!(h.session.state(), SignalingState::Closed);
        assert!(h.session.registry().is_empty().await);
        for peer in ["p1", "p2"] {
            assert_eq!(h.factory.connection(peer).unwrap().close_count(), 1);
        }
    }

    #[tokio::test]
    async fn test_new_call_after_failure_gets_fresh_connections() {
        let h = harness();
        h.session.start_call("c1", &participants(&["p1"])).await.unwrap();
        let failed_connection = h.factory.connection("p1").unwrap();
        fail_all(&h, &["p1"]).await;

        h.session.start_call("c2", &participants(&["p1"])).await.unwrap();

        assert_eq!(h.factory.created_count(), 2);
        assert_eq!(failed_connection.close_count(), 1);
        let fresh = h.factory.connection("p1").unwrap();
        assert_eq!(fresh.close_count(), 0);
        assert_eq!(h.session.state(), SignalingState::Connecting);
        assert_eq!(h.session.active_call_id().as_deref(), Some("c2"));

        // the new record negotiates from scratch
        h.session.create_offer("p1").await.unwrap();
        assert!(fresh.local_description().is_some());
    }

    #[tokio::test]
    async fn test_remote_end_closes_failed_call() {
        let h = harness();
        h.session.start_call("c1", &participants(&["p1"])).await.unwrap();
        fail_all(&h, &["p1"]).await;

        h.session.handle_message(&msg("c1", "p1", SignalingBody::CallEnd)).await;

        assert_eq!(h.session.state(), SignalingState::Closed);
        assert!(h.session.current_call().is_none());
        assert_eq!(h.factory.connection("p1").unwrap().close_count(), 1);
    }

    #[tokio::test]
    async fn test_create_offer_failure_propagates() {
        let h = harness();
        let mut wire = h.remote.subscribe();
        h.session.start_call("c1", &participants(&["p1"])).await.unwrap();
        h.factory.connection("p1").unwrap().fail_offers();

        let err = h.session.create_offer("p1").await.unwrap_err();

        assert!(matches!(err, Error::Negotiation(_)));
        assert_eq!(
            h.session.negotiation_state("p1").await.unwrap(),
            NegotiationState::Idle
        );
        assert_eq!(h.session.state(), SignalingState::Connecting);
        assert!(wire.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stale_connection_events_dropped() {
        let h = harness();
        let mut events = h.session.subscribe_events();
        h.session.start_call("c1", &participants(&["p1"])).await.unwrap();
        let stale = h
            .factory
            .event("p1", NativeEventKind::DataChannelOpen { label: "control".into() })
            .unwrap();

        h.session.retry_peer("p1").await.unwrap();
        h.session.handle_native_event(stale).await;

        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_data() {
        let h = harness();
        h.session.start_call("c1", &participants(&["p1"])).await.unwrap();
        h.session.create_offer("p1").await.unwrap();

        h.session.send_data("p1", Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(
            h.factory.connection("p1").unwrap().sent_data(),
            vec![(CONTROL_CHANNEL.to_string(), Bytes::from_static(b"ping"))]
        );
        assert!(matches!(
            h.session.send_data("p9", Bytes::new()).await,
            Err(Error::UnknownPeer(_))
        ));
    }
}
