//! Call orchestrator
//!
//! Top-level façade consumed by the UI layer. Maps user intents onto the
//! signaling session and media coordinator, handles the call-control
//! messages (invite, accept, reject, media state) and republishes one
//! [`CallState`].

use super::state::{
    CallDirection, CallPhase, CallState, IncomingCall, ParticipantSnapshot, RemoteMediaState,
};
use crate::config::CallConfig;
use crate::media::coordinator::{MediaSessionCoordinator, TrackReplaceReport};
use crate::media::devices::{MediaConstraints, MediaDevices};
use crate::media::quality::CallQualitySample;
use crate::peer::native::NativeConnectionFactory;
use crate::peer::record::NegotiationState;
use crate::session::{SignalingEvent, SignalingEventKind, SignalingSession, SignalingState};
use crate::signaling::protocol::{SignalingBody, SignalingMessage};
use crate::signaling::transport::SignalingTransport;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

const DURATION_TICK: Duration = Duration::from_secs(1);

/// Per-call timers, cancelled when the call ends
#[derive(Default)]
struct CallTimers {
    ring: Option<JoinHandle<()>>,
    duration: Option<JoinHandle<()>>,
}

impl CallTimers {
    fn cancel_ring(&mut self) {
        if let Some(task) = self.ring.take() {
            task.abort();
        }
    }

    fn cancel_all(&mut self) {
        self.cancel_ring();
        if let Some(task) = self.duration.take() {
            task.abort();
        }
    }
}

/// Drives calls for one local peer
pub struct CallOrchestrator {
    config: CallConfig,
    local_peer_id: String,
    transport: Arc<dyn SignalingTransport>,
    session: Arc<SignalingSession>,
    media: Arc<MediaSessionCoordinator>,

    state_tx: watch::Sender<CallState>,
    /// Serializes user intents
    intents: tokio::sync::Mutex<()>,
    ending: AtomicBool,
    /// Negotiation messages that arrived while ringing
    stashed: Mutex<Vec<SignalingMessage>>,
    remote_media: Mutex<HashMap<String, RemoteMediaState>>,
    timers: Mutex<CallTimers>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    weak_self: Weak<CallOrchestrator>,
}

impl CallOrchestrator {
    /// Create an orchestrator
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid.
    pub fn new(
        config: CallConfig,
        transport: Arc<dyn SignalingTransport>,
        factory: Arc<dyn NativeConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let local_peer_id = config.resolve_local_peer_id();
        info!("Creating call orchestrator for {}", local_peer_id);

        let session = Arc::new(SignalingSession::new(
            &config,
            &local_peer_id,
            Arc::clone(&transport),
            factory,
        ));
        let media = Arc::new(MediaSessionCoordinator::new(
            &config,
            Arc::clone(&session),
            devices,
        ));
        let (state_tx, _) = watch::channel(CallState::default());

        Ok(Arc::new_cyclic(|weak_self| Self {
            config,
            local_peer_id,
            transport,
            session,
            media,
            state_tx,
            intents: tokio::sync::Mutex::new(()),
            ending: AtomicBool::new(false),
            stashed: Mutex::new(Vec::new()),
            remote_media: Mutex::new(HashMap::new()),
            timers: Mutex::new(CallTimers::default()),
            tasks: Mutex::new(Vec::new()),
            weak_self: weak_self.clone(),
        }))
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn session(&self) -> &Arc<SignalingSession> {
        &self.session
    }

    pub fn media(&self) -> &Arc<MediaSessionCoordinator> {
        &self.media
    }

    pub fn state(&self) -> CallState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.state_tx.subscribe()
    }

    /// Start the background tasks
    ///
    /// Subscribes to the signaling transport and relays session state,
    /// events and quality samples into [`CallState`].
    pub fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Err(Error::InvalidState("orchestrator already started".to_string()));
        }

        tasks.push(self.session.spawn_event_loop()?);

        let inbound = self.transport.subscribe();
        tasks.push(tokio::spawn(Self::dispatch_loop(self.weak_self.clone(), inbound)));

        let states = self.session.subscribe_state();
        let events = self.session.subscribe_events();
        let quality = self.media.subscribe_quality();
        tasks.push(tokio::spawn(Self::relay_loop(
            self.weak_self.clone(),
            states,
            events,
            quality,
        )));

        info!("Call orchestrator {} started", self.local_peer_id);
        Ok(())
    }

    /// End any call and stop the background tasks
    pub async fn shutdown(&self) {
        info!("Shutting down call orchestrator");
        self.end_call().await;

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.timers.lock().cancel_all();
    }

    // ------------------------------------------------------------------
    // Intents
    // ------------------------------------------------------------------

    /// Call one or more peers
    ///
    /// Acquires local media, creates a connection per participant and sends
    /// `call_invite`; each peer is offered to once it accepts.
    ///
    /// # Errors
    ///
    /// Fails if a call is already active or ringing, if local media cannot
    /// be acquired, or if no participant connection could be created.
    #[instrument(skip(self, participants), fields(local = %self.local_peer_id))]
    pub async fn initiate_call(&self, participants: &[String], video: bool) -> Result<String> {
        let _intent = self.intents.lock().await;
        self.ensure_idle()?;

        let mut peers: Vec<String> = Vec::new();
        for peer in participants {
            if *peer != self.local_peer_id && !peers.contains(peer) {
                peers.push(peer.clone());
            }
        }
        if peers.is_empty() {
            return Err(Error::InvalidState("no participants to call".to_string()));
        }
        if peers.len() > self.config.max_peers as usize {
            return Err(Error::MaxPeersReached(self.config.max_peers as usize));
        }

        let call_id = format!("call-{}", uuid::Uuid::new_v4());
        self.discard_finished_call();
        self.media.create_local_stream(&constraints(video)).await?;

        let setup_error = match self.session.start_call(&call_id, &peers).await {
            Ok(()) => None,
            Err(e) => {
                if self.session.registry().is_empty().await {
                    self.teardown(Some(e.to_string())).await;
                    return Err(e);
                }
                warn!("Calling without some participants: {}", e);
                Some(e.to_string())
            }
        };

        self.state_tx.send_modify(|state| {
            *state = CallState {
                phase: CallPhase::Outgoing,
                call_id: Some(call_id.clone()),
                direction: Some(CallDirection::Outgoing),
                signaling_state: self.session.state(),
                video,
                error: setup_error,
                local_media: self.media.media_state(),
                ..CallState::default()
            };
        });

        let mut everyone = vec![self.local_peer_id.clone()];
        everyone.extend(peers.iter().cloned());
        for peer in self.session.peer_ids().await {
            let invite = SignalingBody::CallInvite {
                participant_ids: everyone.clone(),
                video,
            };
            if let Err(e) = self.session.send(&call_id, &peer, invite).await {
                warn!("Failed to invite {}: {}", peer, e);
                self.teardown(Some(e.to_string())).await;
                return Err(e);
            }
        }

        self.media.start_stats_collection();
        self.start_ring_timer(&call_id);
        self.refresh_participants().await;

        info!("Calling {} peers in {}", peers.len(), call_id);
        Ok(call_id)
    }

    /// Accept the ringing call
    ///
    /// # Errors
    ///
    /// Fails with [`Error::NoActiveCall`] when nothing is ringing, or with the
    /// media error if local capture cannot start (the call keeps ringing).
    #[instrument(skip(self), fields(local = %self.local_peer_id))]
    pub async fn answer_call(&self) -> Result<()> {
        let _intent = self.intents.lock().await;
        let incoming = self.state().incoming.ok_or(Error::NoActiveCall)?;

        self.discard_finished_call();
        self.media
            .create_local_stream(&constraints(incoming.video))
            .await?;

        let peers = remote_participants(&incoming, &self.local_peer_id);
        let mut failures = Vec::new();
        for peer in &peers {
            if let Err(e) = self.session.join_call(&incoming.call_id, peer).await {
                warn!("Failed to connect to {}: {}", peer, e);
                failures.push(e.to_string());
            }
        }
        if self.session.registry().is_empty().await {
            let error = failures.join("; ");
            self.teardown(Some(error.clone())).await;
            return Err(Error::Negotiation(error));
        }

        self.state_tx.send_modify(|state| {
            state.phase = CallPhase::Connecting;
            state.incoming = None;
            state.signaling_state = self.session.state();
            state.local_media = self.media.media_state();
            state.error = (!failures.is_empty()).then(|| failures.join("; "));
        });

        for peer in self.session.peer_ids().await {
            if let Err(e) = self
                .session
                .send(&incoming.call_id, &peer, SignalingBody::CallAccept)
                .await
            {
                warn!("Failed to accept towards {}: {}", peer, e);
            }
        }

        let stashed: Vec<_> = self.stashed.lock().drain(..).collect();
        for message in stashed {
            self.session.handle_message(&message).await;
        }

        self.media.start_stats_collection();
        self.refresh_participants().await;
        info!("Answered call {}", incoming.call_id);
        Ok(())
    }

    /// Decline the ringing call
    #[instrument(skip(self), fields(local = %self.local_peer_id))]
    pub async fn reject_call(&self, reason: Option<String>) -> Result<()> {
        let _intent = self.intents.lock().await;
        let incoming = self.state().incoming.ok_or(Error::NoActiveCall)?;

        for peer in remote_participants(&incoming, &self.local_peer_id) {
            let body = SignalingBody::CallReject {
                reason: reason.clone(),
            };
            if let Err(e) = self.session.send(&incoming.call_id, &peer, body).await {
                warn!("Failed to send reject to {}: {}", peer, e);
            }
        }

        self.clear_ringing(None);
        info!("Rejected call {}", incoming.call_id);
        Ok(())
    }

    /// Hang up
    ///
    /// Sends `call_end` to every peer, closes all connections and releases
    /// local media. A second call while one is in flight is ignored; ending
    /// a ringing call rejects it. Never fails.
    #[instrument(skip(self), fields(local = %self.local_peer_id))]
    pub async fn end_call(&self) {
        if self.ending.swap(true, Ordering::SeqCst) {
            debug!("end_call already in progress");
            return;
        }

        if self.state().incoming.is_some() {
            if let Err(e) = self.reject_call(Some("declined".to_string())).await {
                debug!("Nothing to decline: {}", e);
            }
        } else {
            let _intent = self.intents.lock().await;
            // a failed call is no longer active but still holds its peers
            let current = self.session.current_call().map(|c| c.call_id);
            if let Some(call_id) = &current {
                self.broadcast(call_id, SignalingBody::CallEnd).await;
            }
            if current.is_some() || self.state().is_live() || self.media.local_stream().is_some() {
                self.teardown(None).await;
            }
        }

        self.ending.store(false, Ordering::SeqCst);
    }

    /// Join a running call with one of its participants
    ///
    /// The remote side offers once it sees our `call_accept`.
    #[instrument(skip(self), fields(local = %self.local_peer_id))]
    pub async fn join_call(&self, call_id: &str, peer_id: &str, video: bool) -> Result<()> {
        let _intent = self.intents.lock().await;
        match self.session.active_call_id() {
            Some(active) if active != call_id => return Err(Error::CallAlreadyActive(active)),
            Some(_) => {}
            None => {
                self.ensure_idle()?;
                self.discard_finished_call();
                self.media.create_local_stream(&constraints(video)).await?;
            }
        }

        if let Err(e) = self.session.join_call(call_id, peer_id).await {
            if self.session.registry().is_empty().await {
                self.teardown(Some(e.to_string())).await;
            }
            return Err(e);
        }

        self.state_tx.send_modify(|state| {
            if !state.is_live() {
                *state = CallState {
                    phase: CallPhase::Connecting,
                    call_id: Some(call_id.to_string()),
                    direction: Some(CallDirection::Incoming),
                    video,
                    ..CallState::default()
                };
            }
            state.signaling_state = self.session.state();
            state.local_media = self.media.media_state();
        });

        self.session
            .send(call_id, peer_id, SignalingBody::CallAccept)
            .await?;
        self.media.start_stats_collection();
        self.refresh_participants().await;
        Ok(())
    }

    /// Leave a group call without ending it for the others
    #[instrument(skip(self), fields(local = %self.local_peer_id))]
    pub async fn leave_call(&self) -> Result<()> {
        let _intent = self.intents.lock().await;
        let call_id = self.session.active_call_id().ok_or(Error::NoActiveCall)?;

        self.broadcast(&call_id, SignalingBody::ParticipantLeft).await;
        self.teardown(None).await;
        info!("Left call {}", call_id);
        Ok(())
    }

    /// Flip the microphone; returns whether audio is now enabled
    pub async fn toggle_audio(&self) -> Result<bool> {
        let _intent = self.intents.lock().await;
        let enabled = self.media.set_audio_enabled(!self.media.media_state().audio_enabled)?;
        self.announce_media_state().await;
        Ok(enabled)
    }

    /// Flip the camera; returns whether video is now enabled
    pub async fn toggle_video(&self) -> Result<bool> {
        let _intent = self.intents.lock().await;
        let enabled = self.media.set_video_enabled(!self.media.media_state().video_enabled)?;
        self.announce_media_state().await;
        Ok(enabled)
    }

    pub async fn switch_camera(&self) -> Result<TrackReplaceReport> {
        let _intent = self.intents.lock().await;
        let report = self.media.switch_camera().await?;
        self.warn_skipped(&report);
        Ok(report)
    }

    pub async fn start_screen_share(&self) -> Result<TrackReplaceReport> {
        let _intent = self.intents.lock().await;
        let report = self.media.start_screen_share().await?;
        self.warn_skipped(&report);
        self.announce_media_state().await;
        Ok(report)
    }

    pub async fn stop_screen_share(&self) -> TrackReplaceReport {
        let _intent = self.intents.lock().await;
        let report = self.media.stop_screen_share().await;
        self.announce_media_state().await;
        report
    }

    // ------------------------------------------------------------------
    // Inbound call control
    // ------------------------------------------------------------------

    async fn dispatch_loop(this: Weak<Self>, mut inbound: broadcast::Receiver<SignalingMessage>) {
        loop {
            let message = match inbound.recv().await {
                Ok(message) => message,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} signaling messages", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(orchestrator) = this.upgrade() else {
                break;
            };
            orchestrator.handle_inbound(message).await;
        }
        debug!("Signaling dispatch loop terminated");
    }

    /// Route one inbound message
    pub async fn handle_inbound(&self, message: SignalingMessage) {
        if !message.to_peer_id.is_empty() && message.to_peer_id != self.local_peer_id {
            return;
        }

        match &message.body {
            SignalingBody::CallInvite {
                participant_ids,
                video,
            } => {
                self.on_invite(&message, participant_ids, *video).await;
            }
            SignalingBody::CallAccept => self.on_accept(&message).await,
            SignalingBody::CallReject { reason } => self.on_reject(&message, reason.clone()).await,
            SignalingBody::MediaState {
                audio_enabled,
                video_enabled,
                screen_sharing,
            } => {
                self.remote_media.lock().insert(
                    message.from_peer_id.clone(),
                    RemoteMediaState {
                        audio_enabled: *audio_enabled,
                        video_enabled: *video_enabled,
                        screen_sharing: *screen_sharing,
                    },
                );
                self.refresh_participants().await;
            }
            SignalingBody::CallEnd if self.is_ringing_for(&message.call_id) => {
                info!("Caller {} cancelled {}", message.from_peer_id, message.call_id);
                self.clear_ringing(None);
            }
            SignalingBody::WebrtcOffer { offer } if self.is_unknown_call(&message.call_id) => {
                // a peer may open a call by offering directly
                let participants = [message.from_peer_id.clone(), self.local_peer_id.clone()];
                self.on_invite(&message, &participants, offer.sdp.contains("m=video"))
                    .await;
                if self.is_ringing_for(&message.call_id) {
                    self.stashed.lock().push(message.clone());
                }
            }
            _ if message.body.is_negotiation() && self.is_ringing_for(&message.call_id) => {
                self.stashed.lock().push(message.clone());
            }
            _ => self.session.handle_message(&message).await,
        }
    }

    async fn on_invite(&self, message: &SignalingMessage, participant_ids: &[String], video: bool) {
        let current = self.state();
        if current.call_id.as_deref() == Some(message.call_id.as_str()) && current.is_live() {
            debug!("Duplicate invite for {}", message.call_id);
            return;
        }

        if current.is_live() || self.session.active_call_id().is_some() {
            info!("Busy, rejecting {} from {}", message.call_id, message.from_peer_id);
            let busy = SignalingBody::CallReject {
                reason: Some("busy".to_string()),
            };
            if let Err(e) = self
                .session
                .send(&message.call_id, &message.from_peer_id, busy)
                .await
            {
                warn!("Failed to send busy to {}: {}", message.from_peer_id, e);
            }
            return;
        }

        let mut participants = participant_ids.to_vec();
        if !participants.contains(&message.from_peer_id) {
            participants.push(message.from_peer_id.clone());
        }
        let incoming = IncomingCall {
            call_id: message.call_id.clone(),
            from_peer_id: message.from_peer_id.clone(),
            participant_ids: participants,
            video,
        };

        self.stashed.lock().clear();
        self.remote_media.lock().clear();
        self.state_tx.send_modify(|state| {
            *state = CallState {
                phase: CallPhase::Ringing,
                call_id: Some(incoming.call_id.clone()),
                direction: Some(CallDirection::Incoming),
                video,
                incoming: Some(incoming.clone()),
                ..CallState::default()
            };
        });
        self.start_ring_timer(&message.call_id);
        info!("Incoming call {} from {}", message.call_id, message.from_peer_id);
    }

    async fn on_accept(&self, message: &SignalingMessage) {
        if self.session.active_call_id().as_deref() != Some(message.call_id.as_str()) {
            debug!("Accept for inactive call {}", message.call_id);
            return;
        }
        let peer_id = message.from_peer_id.as_str();
        info!("{} accepted {}", peer_id, message.call_id);

        if let Err(e) = self.session.join_call(&message.call_id, peer_id).await {
            warn!("Cannot connect to {}: {}", peer_id, e);
            return;
        }
        self.state_tx.send_if_modified(|state| {
            if state.phase == CallPhase::Outgoing {
                state.phase = CallPhase::Connecting;
                true
            } else {
                false
            }
        });

        match self.session.negotiation_state(peer_id).await {
            Ok(NegotiationState::Idle) => {
                if let Err(e) = self.session.create_offer(peer_id).await {
                    warn!("Failed to offer to {}: {}", peer_id, e);
                }
            }
            Ok(state) => debug!("Not offering to {} in state {:?}", peer_id, state),
            Err(e) => debug!("Peer {} gone: {}", peer_id, e),
        }
        self.refresh_participants().await;
    }

    async fn on_reject(&self, message: &SignalingMessage, reason: Option<String>) {
        if self.session.active_call_id().as_deref() != Some(message.call_id.as_str()) {
            return;
        }
        let peer_id = message.from_peer_id.as_str();
        let reason = reason.unwrap_or_else(|| "rejected".to_string());
        info!("{} rejected {}: {}", peer_id, message.call_id, reason);

        self.session.remove_peer(peer_id).await;
        self.remote_media.lock().remove(peer_id);

        if self.session.registry().is_empty().await {
            let _intent = self.intents.lock().await;
            self.teardown(Some(format!("call {}", reason))).await;
        } else {
            self.refresh_participants().await;
        }
    }

    // ------------------------------------------------------------------
    // Session relay
    // ------------------------------------------------------------------

    async fn relay_loop(
        this: Weak<Self>,
        mut states: watch::Receiver<SignalingState>,
        mut events: broadcast::Receiver<SignalingEvent>,
        mut quality: broadcast::Receiver<CallQualitySample>,
    ) {
        loop {
            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow_and_update();
                    let Some(orchestrator) = this.upgrade() else { break };
                    orchestrator.on_signaling_state(state).await;
                }
                event = events.recv() => {
                    let Some(orchestrator) = this.upgrade() else { break };
                    match event {
                        Ok(event) => orchestrator.on_session_event(&event).await,
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            orchestrator.refresh_participants().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                sample = quality.recv() => {
                    let Some(orchestrator) = this.upgrade() else { break };
                    match sample {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            orchestrator.refresh_participants().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        debug!("Session relay loop terminated");
    }

    async fn on_signaling_state(&self, signaling: SignalingState) {
        self.state_tx.send_if_modified(|state| {
            if state.phase == CallPhase::Ringing {
                return false;
            }
            // an ended call keeps its final phase
            let phase = if state.is_live() || !signaling.is_terminal() {
                state.phase.after(signaling)
            } else {
                state.phase
            };
            let changed = state.signaling_state != signaling || state.phase != phase;
            state.signaling_state = signaling;
            state.phase = phase;
            if signaling == SignalingState::Failed {
                state.error.get_or_insert_with(|| "connection failed".to_string());
            }
            changed
        });

        match signaling {
            SignalingState::Stable => self.start_duration_ticker(),
            SignalingState::Failed => {
                warn!("Call failed");
                self.timers.lock().cancel_all();
            }
            SignalingState::Closed => {
                // ended by the remote side or by the last peer leaving
                let _intent = self.intents.lock().await;
                if self.session.state() == SignalingState::Closed {
                    self.release_call_resources();
                }
            }
            _ => {}
        }
        self.refresh_participants().await;
    }

    async fn on_session_event(&self, event: &SignalingEvent) {
        match event.kind() {
            SignalingEventKind::IceCandidateError => {
                debug!("Negotiation problem with {}: {:?}", event.from_peer_id(), event.payload());
            }
            SignalingEventKind::DataChannelMessage => return,
            _ => {}
        }
        self.refresh_participants().await;
    }

    /// Rebuild participant snapshots from the session and quality data
    async fn refresh_participants(&self) {
        let latest = self.media.latest_samples();
        let mut participants = BTreeMap::new();

        for (peer_id, slot) in self.session.registry().slots().await {
            let (negotiation, connection) = {
                let record = slot.record.lock().await;
                (record.negotiation_state(), record.connection_state())
            };
            let media = self
                .remote_media
                .lock()
                .get(&peer_id)
                .copied()
                .unwrap_or_default();
            let sample = latest.get(&peer_id);
            participants.insert(
                peer_id,
                ParticipantSnapshot::new(negotiation, connection, media, sample),
            );
        }

        let quality = self.media.aggregate_quality();
        let local_media = self.media.media_state();
        self.state_tx.send_if_modified(|state| {
            if state.phase == CallPhase::Ringing {
                return false;
            }
            let changed = state.participants != participants
                || state.quality != quality
                || state.local_media != local_media;
            state.participants = participants;
            state.quality = quality;
            state.local_media = local_media;
            changed
        });
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ensure_idle(&self) -> Result<()> {
        if let Some(call_id) = self.session.active_call_id() {
            return Err(Error::CallAlreadyActive(call_id));
        }
        if let Some(incoming) = self.state().incoming {
            return Err(Error::CallAlreadyActive(incoming.call_id));
        }
        Ok(())
    }

    /// Neither the active, ringing nor last finished call
    fn is_unknown_call(&self, call_id: &str) -> bool {
        if self.session.active_call_id().as_deref() == Some(call_id) {
            return false;
        }
        let state = self.state_tx.borrow();
        state.call_id.as_deref() != Some(call_id)
            && state.incoming.as_ref().map_or(true, |i| i.call_id != call_id)
    }

    fn is_ringing_for(&self, call_id: &str) -> bool {
        self.state_tx
            .borrow()
            .incoming
            .as_ref()
            .map_or(false, |i| i.call_id == call_id)
    }

    /// Drop a ringing call without joining it
    fn clear_ringing(&self, error: Option<String>) {
        self.stashed.lock().clear();
        self.timers.lock().cancel_all();
        self.state_tx.send_modify(|state| {
            state.phase = CallPhase::Ended;
            state.incoming = None;
            state.error = error;
        });
    }

    /// End the call locally and publish the final state
    async fn teardown(&self, error: Option<String>) {
        self.session.end_call().await;
        self.release_call_resources();

        self.state_tx.send_modify(|state| {
            state.phase = if error.is_some() && state.phase != CallPhase::Connected {
                CallPhase::Failed
            } else {
                CallPhase::Ended
            };
            state.signaling_state = self.session.state();
            state.participants.clear();
            state.incoming = None;
            state.local_media = self.media.media_state();
            if error.is_some() {
                state.error = error;
            }
        });
    }

    /// Drop media a failed call still holds before starting another
    ///
    /// Its connections are closed by the session when the next call begins.
    fn discard_finished_call(&self) {
        if self.session.active_call_id().is_none() && self.media.local_stream().is_some() {
            debug!("Releasing media of the previous call");
            self.release_call_resources();
        }
    }

    fn release_call_resources(&self) {
        self.timers.lock().cancel_all();
        self.media.release();
        self.stashed.lock().clear();
        self.remote_media.lock().clear();
    }

    async fn broadcast(&self, call_id: &str, body: SignalingBody) {
        for peer in self.session.peer_ids().await {
            if let Err(e) = self.session.send(call_id, &peer, body.clone()).await {
                warn!("Failed to send {} to {}: {}", body.action(), peer, e);
            }
        }
    }

    async fn announce_media_state(&self) {
        let local = self.media.media_state();
        self.state_tx.send_if_modified(|state| {
            let changed = state.local_media != local;
            state.local_media = local;
            changed
        });

        if let Some(call_id) = self.session.active_call_id() {
            let body = SignalingBody::MediaState {
                audio_enabled: local.audio_enabled,
                video_enabled: local.video_enabled,
                screen_sharing: local.screen_sharing,
            };
            self.broadcast(&call_id, body).await;
        }
    }

    fn warn_skipped(&self, report: &TrackReplaceReport) {
        for (peer_id, reason) in &report.skipped {
            warn!("Video unchanged for {}: {}", peer_id, reason);
        }
    }

    fn start_ring_timer(&self, call_id: &str) {
        let Some(timeout) = self.config.ring_timeout() else {
            return;
        };
        let this = self.weak_self.clone();
        let call_id = call_id.to_string();

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(orchestrator) = this.upgrade() {
                orchestrator.on_ring_timeout(&call_id).await;
            }
        });

        let mut timers = self.timers.lock();
        timers.cancel_ring();
        timers.ring = Some(task);
    }

    async fn on_ring_timeout(&self, call_id: &str) {
        if self.is_ringing_for(call_id) {
            info!("Missed call {}", call_id);
            self.clear_ringing(Some("missed call".to_string()));
            return;
        }

        let _intent = self.intents.lock().await;
        let state = self.state();
        let unanswered = state.call_id.as_deref() == Some(call_id)
            && matches!(state.phase, CallPhase::Outgoing | CallPhase::Connecting);
        if unanswered && self.session.active_call_id().as_deref() == Some(call_id) {
            info!("No answer for {}", call_id);
            self.broadcast(call_id, SignalingBody::CallEnd).await;
            self.teardown(Some("no answer".to_string())).await;
        }
    }

    fn start_duration_ticker(&self) {
        let mut timers = self.timers.lock();
        timers.cancel_ring();
        if timers.duration.is_some() {
            return;
        }

        let started = Instant::now();
        let this = self.weak_self.clone();
        timers.duration = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DURATION_TICK);
            loop {
                ticker.tick().await;
                let Some(orchestrator) = this.upgrade() else {
                    break;
                };
                let elapsed = started.elapsed();
                orchestrator.state_tx.send_modify(|state| state.duration = elapsed);
            }
        }));
    }
}

impl Drop for CallOrchestrator {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        self.timers.get_mut().cancel_all();
    }
}

fn constraints(video: bool) -> MediaConstraints {
    if video {
        MediaConstraints::audio_video()
    } else {
        MediaConstraints::audio_only()
    }
}

fn remote_participants(incoming: &IncomingCall, local_peer_id: &str) -> Vec<String> {
    incoming
        .participant_ids
        .iter()
        .filter(|p| p.as_str() != local_peer_id)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::devices::StaticMediaDevices;
    use crate::peer::native::{NativeConnectionState, NativeEventKind};
    use crate::signaling::transport::ChannelTransport;
    use crate::testing::FakeConnectionFactory;

    struct Harness {
        orchestrator: Arc<CallOrchestrator>,
        factory: Arc<FakeConnectionFactory>,
        devices: Arc<StaticMediaDevices>,
        remote: ChannelTransport,
    }

    fn harness_with(config: CallConfig) -> Harness {
        let (local, remote) = ChannelTransport::pair();
        let factory = Arc::new(FakeConnectionFactory::new());
        let devices = Arc::new(StaticMediaDevices::with_default_devices());
        let orchestrator = CallOrchestrator::new(
            config.with_local_peer_id("me"),
            Arc::new(local),
            factory.clone(),
            devices.clone(),
        )
        .unwrap();
        orchestrator.start().unwrap();
        Harness {
            orchestrator,
            factory,
            devices,
            remote,
        }
    }

    fn harness() -> Harness {
        harness_with(CallConfig::default())
    }

    fn ids(peers: &[&str]) -> Vec<String> {
        peers.iter().map(|s| s.to_string()).collect()
    }

    fn invite(call_id: &str, from: &str, participants: &[&str]) -> SignalingMessage {
        SignalingMessage::new(
            call_id,
            from,
            "me",
            SignalingBody::CallInvite {
                participant_ids: ids(participants),
                video: false,
            },
        )
    }

    async fn wait_for_phase(h: &Harness, phase: CallPhase) {
        let mut rx = h.orchestrator.subscribe();
        tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| s.phase == phase))
            .await
            .expect("phase not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_initiate_call_sends_invites() {
        let h = harness();
        let mut wire = h.remote.subscribe();

        let call_id = h
            .orchestrator
            .initiate_call(&ids(&["p1", "p2"]), true)
            .await
            .unwrap();

        let mut invited = Vec::new();
        for _ in 0..2 {
            let message = wire.recv().await.unwrap();
            assert_eq!(message.action(), "call_invite");
            assert_eq!(message.call_id, call_id);
            invited.push(message.to_peer_id);
        }
        invited.sort();
        assert_eq!(invited, vec!["p1", "p2"]);

        let state = h.orchestrator.state();
        assert_eq!(state.phase, CallPhase::Outgoing);
        assert_eq!(state.direction, Some(CallDirection::Outgoing));
        assert!(state.local_media.has_video);
        assert_eq!(h.factory.created_count(), 2);
    }

    #[tokio::test]
    async fn test_initiate_call_rejected_while_active() {
        let h = harness();
        h.orchestrator.initiate_call(&ids(&["p1"]), false).await.unwrap();

        let err = h
            .orchestrator
            .initiate_call(&ids(&["p2"]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CallAlreadyActive(_)));
    }

    #[tokio::test]
    async fn test_initiate_call_permission_denied() {
        let h = harness();
        h.devices.set_microphone_permission(false);

        let err = h
            .orchestrator
            .initiate_call(&ids(&["p1"]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
        assert_eq!(h.factory.created_count(), 0);
        assert_eq!(h.orchestrator.state().phase, CallPhase::Idle);
    }

    #[tokio::test]
    async fn test_accept_triggers_offer() {
        let h = harness();
        let mut wire = h.remote.subscribe();
        let call_id = h.orchestrator.initiate_call(&ids(&["p1"]), false).await.unwrap();
        wire.recv().await.unwrap();

        h.orchestrator
            .handle_inbound(SignalingMessage::new(&call_id, "p1", "me", SignalingBody::CallAccept))
            .await;

        let offer = wire.recv().await.unwrap();
        assert_eq!(offer.action(), "webrtc_offer");
        assert_eq!(offer.to_peer_id, "p1");
        assert_eq!(h.orchestrator.state().phase, CallPhase::Connecting);
    }

    #[tokio::test]
    async fn test_incoming_call_rings_then_rejects() {
        let h = harness();
        let mut wire = h.remote.subscribe();

        h.orchestrator.handle_inbound(invite("c9", "alice", &["alice", "me"])).await;
        let state = h.orchestrator.state();
        assert_eq!(state.phase, CallPhase::Ringing);
        assert_eq!(state.incoming.as_ref().unwrap().from_peer_id, "alice");

        h.orchestrator.reject_call(Some("later".to_string())).await.unwrap();
        let message = wire.recv().await.unwrap();
        assert_eq!(message.action(), "call_reject");
        assert_eq!(message.to_peer_id, "alice");
        assert_eq!(h.orchestrator.state().phase, CallPhase::Ended);
        assert_eq!(h.factory.created_count(), 0);
    }

    #[tokio::test]
    async fn test_busy_while_in_call() {
        let h = harness();
        let mut wire = h.remote.subscribe();
        h.orchestrator.initiate_call(&ids(&["p1"]), false).await.unwrap();
        wire.recv().await.unwrap();

        h.orchestrator.handle_inbound(invite("other", "bob", &["bob", "me"])).await;

        let message = wire.recv().await.unwrap();
        assert_eq!(message.to_peer_id, "bob");
        assert_eq!(
            message.body,
            SignalingBody::CallReject {
                reason: Some("busy".to_string())
            }
        );
        assert_eq!(h.orchestrator.state().phase, CallPhase::Outgoing);
    }

    #[tokio::test]
    async fn test_offer_while_ringing_replayed_on_answer() {
        let h = harness();
        let mut wire = h.remote.subscribe();
        h.orchestrator.handle_inbound(invite("c1", "alice", &["alice", "me"])).await;
        h.orchestrator
            .handle_inbound(SignalingMessage::new(
                "c1",
                "alice",
                "me",
                SignalingBody::WebrtcOffer {
                    offer: crate::signaling::protocol::SessionDescription::offer("v=0"),
                },
            ))
            .await;
        assert_eq!(h.factory.created_count(), 0);

        h.orchestrator.answer_call().await.unwrap();

        let accept = wire.recv().await.unwrap();
        assert_eq!(accept.action(), "call_accept");
        let answer = wire.recv().await.unwrap();
        assert_eq!(answer.action(), "webrtc_answer");
        assert_eq!(answer.to_peer_id, "alice");
    }

    #[tokio::test]
    async fn test_end_call_is_deduplicated_and_notifies() {
        let h = harness();
        let mut wire = h.remote.subscribe();
        h.orchestrator.initiate_call(&ids(&["p1"]), true).await.unwrap();
        wire.recv().await.unwrap();

        tokio::join!(h.orchestrator.end_call(), h.orchestrator.end_call());
        h.orchestrator.end_call().await;

        let message = wire.recv().await.unwrap();
        assert_eq!(message.action(), "call_end");
        assert!(wire.try_recv().is_err());

        let fake = h.factory.connection("p1").unwrap();
        assert_eq!(fake.close_count(), 1);
        let state = h.orchestrator.state();
        assert_eq!(state.phase, CallPhase::Ended);
        assert!(!state.local_media.has_audio);
    }

    async fn fail_connection(h: &Harness, peer_id: &str) {
        h.factory.emit(
            peer_id,
            NativeEventKind::ConnectionState(NativeConnectionState::Failed),
        );
        wait_for_phase(h, CallPhase::Failed).await;
    }

    #[tokio::test]
    async fn test_end_call_after_connection_failure() {
        let h = harness();
        let mut wire = h.remote.subscribe();
        let call_id = h.orchestrator.initiate_call(&ids(&["p1"]), true).await.unwrap();
        wire.recv().await.unwrap();

        fail_connection(&h, "p1").await;
        assert_eq!(h.orchestrator.state().error.as_deref(), Some("connection failed"));

        h.orchestrator.end_call().await;

        let message = wire.recv().await.unwrap();
        assert_eq!(message.action(), "call_end");
        assert_eq!(message.call_id, call_id);
        assert_eq!(h.factory.connection("p1").unwrap().close_count(), 1);
        assert!(h.orchestrator.session().registry().is_empty().await);
        let state = h.orchestrator.state();
        assert_eq!(state.phase, CallPhase::Ended);
        assert!(!state.local_media.has_audio);
        assert!(h.orchestrator.media().local_stream().is_none());
    }

    #[tokio::test]
    async fn test_new_call_after_connection_failure() {
        let h = harness();
        h.orchestrator.initiate_call(&ids(&["p1"]), false).await.unwrap();
        let failed = h.factory.connection("p1").unwrap();
        fail_connection(&h, "p1").await;

        let call_id = h.orchestrator.initiate_call(&ids(&["p1"]), false).await.unwrap();

        assert_eq!(failed.close_count(), 1);
        assert_eq!(h.factory.created_count(), 2);
        assert_eq!(h.factory.connection("p1").unwrap().close_count(), 0);
        assert_eq!(h.orchestrator.session().active_call_id(), Some(call_id));
        let state = h.orchestrator.state();
        assert_eq!(state.phase, CallPhase::Outgoing);
        assert!(state.local_media.has_audio);
    }

    #[tokio::test]
    async fn test_offer_without_invite_rings() {
        let h = harness();
        let mut wire = h.remote.subscribe();
        let offer = SignalingMessage::new(
            "c1",
            "alice",
            "me",
            SignalingBody::WebrtcOffer {
                offer: crate::signaling::protocol::SessionDescription::offer("v=0"),
            },
        );

        h.orchestrator.handle_inbound(offer).await;

        let state = h.orchestrator.state();
        assert_eq!(state.phase, CallPhase::Ringing);
        let incoming = state.incoming.unwrap();
        assert_eq!(incoming.from_peer_id, "alice");
        assert_eq!(incoming.participant_ids, ids(&["alice", "me"]));
        assert!(!incoming.video);
        assert_eq!(h.factory.created_count(), 0);

        h.orchestrator.answer_call().await.unwrap();

        assert_eq!(wire.recv().await.unwrap().action(), "call_accept");
        let answer = wire.recv().await.unwrap();
        assert_eq!(answer.action(), "webrtc_answer");
        assert_eq!(answer.call_id, "c1");
        assert_eq!(h.orchestrator.session().active_call_id().as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_offer_for_finished_call_ignored() {
        let h = harness();
        h.orchestrator.handle_inbound(invite("c1", "alice", &["alice", "me"])).await;
        h.orchestrator.reject_call(None).await.unwrap();

        h.orchestrator
            .handle_inbound(SignalingMessage::new(
                "c1",
                "alice",
                "me",
                SignalingBody::WebrtcOffer {
                    offer: crate::signaling::protocol::SessionDescription::offer("v=0"),
                },
            ))
            .await;

        let state = h.orchestrator.state();
        assert_eq!(state.phase, CallPhase::Ended);
        assert!(state.incoming.is_none());
        assert_eq!(h.factory.created_count(), 0);
    }

    #[tokio::test]
    async fn test_remote_reject_ends_one_to_one_call() {
        let h = harness();
        let call_id = h.orchestrator.initiate_call(&ids(&["p1"]), false).await.unwrap();

        h.orchestrator
            .handle_inbound(SignalingMessage::new(
                &call_id,
                "p1",
                "me",
                SignalingBody::CallReject { reason: None },
            ))
            .await;

        let state = h.orchestrator.state();
        assert_eq!(state.phase, CallPhase::Failed);
        assert_eq!(state.error.as_deref(), Some("call rejected"));
    }

    #[tokio::test]
    async fn test_toggle_audio_announces_state() {
        let h = harness();
        let mut wire = h.remote.subscribe();
        h.orchestrator.initiate_call(&ids(&["p1"]), false).await.unwrap();
        wire.recv().await.unwrap();

        assert!(!h.orchestrator.toggle_audio().await.unwrap());

        let message = wire.recv().await.unwrap();
        assert_eq!(
            message.body,
            SignalingBody::MediaState {
                audio_enabled: false,
                video_enabled: false,
                screen_sharing: false,
            }
        );
        assert!(!h.orchestrator.state().local_media.audio_enabled);
        assert!(h.orchestrator.toggle_video().await.is_err());
    }

    #[tokio::test]
    async fn test_remote_media_state_in_snapshot() {
        let h = harness();
        let call_id = h.orchestrator.initiate_call(&ids(&["p1"]), false).await.unwrap();

        h.orchestrator
            .handle_inbound(SignalingMessage::new(
                &call_id,
                "p1",
                "me",
                SignalingBody::MediaState {
                    audio_enabled: false,
                    video_enabled: true,
                    screen_sharing: true,
                },
            ))
            .await;

        let participant = &h.orchestrator.state().participants["p1"];
        assert!(!participant.audio_enabled);
        assert!(participant.screen_sharing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out() {
        let h = harness_with(CallConfig {
            ring_timeout_secs: 10,
            ..CallConfig::default()
        });
        h.orchestrator.initiate_call(&ids(&["p1"]), false).await.unwrap();

        wait_for_phase(&h, CallPhase::Failed).await;
        assert_eq!(h.orchestrator.state().error.as_deref(), Some("no answer"));
        assert_eq!(h.factory.connection("p1").unwrap().close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_call_missed() {
        let h = harness_with(CallConfig {
            ring_timeout_secs: 5,
            ..CallConfig::default()
        });
        h.orchestrator.handle_inbound(invite("c1", "alice", &["alice", "me"])).await;

        wait_for_phase(&h, CallPhase::Ended).await;
        let state = h.orchestrator.state();
        assert!(state.incoming.is_none());
        assert_eq!(state.error.as_deref(), Some("missed call"));
    }
}
