//! Binds local media to the call's peer connections
//!
//! Attaches the local stream to every known connection, swaps the outbound
//! video track in place (camera switch, screen share) and samples
//! connection statistics into per-peer quality histories.

use super::devices::{
    DeviceKind, LocalMediaStream, MediaConstraints, MediaDevices, MediaTrack, TrackKind,
};
use super::quality::{CallQualitySample, JitterEstimator, QualityHistory};
use crate::config::CallConfig;
use crate::peer::native::{NativeConnectionState, NativeStats};
use crate::session::SignalingSession;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Outcome of swapping the video track on every peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackReplaceReport {
    pub replaced: Vec<String>,
    /// Peers left on the old track, with the reason
    pub skipped: Vec<(String, String)>,
}

/// Local capture state as shown to the user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LocalMediaState {
    pub has_audio: bool,
    pub has_video: bool,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

struct PeerQuality {
    previous: Option<NativeStats>,
    sampled_at: Option<Instant>,
    jitter: JitterEstimator,
    history: QualityHistory,
}

impl PeerQuality {
    fn new(capacity: usize) -> Self {
        Self {
            previous: None,
            sampled_at: None,
            jitter: JitterEstimator::default(),
            history: QualityHistory::new(capacity),
        }
    }
}

pub struct MediaSessionCoordinator {
    session: Arc<SignalingSession>,
    devices: Arc<dyn MediaDevices>,

    stream: RwLock<Option<LocalMediaStream>>,
    /// Camera track parked while the screen is shared
    parked_camera: RwLock<Option<Arc<MediaTrack>>>,
    screen: RwLock<Option<Arc<MediaTrack>>>,

    quality: Mutex<HashMap<String, PeerQuality>>,
    history_capacity: usize,
    stats_interval: Duration,
    quality_tx: broadcast::Sender<CallQualitySample>,
    stats_task: Mutex<Option<JoinHandle<()>>>,
}

impl MediaSessionCoordinator {
    pub fn new(
        config: &CallConfig,
        session: Arc<SignalingSession>,
        devices: Arc<dyn MediaDevices>,
    ) -> Self {
        let (quality_tx, _) = broadcast::channel(config.quality_channel_capacity.max(1));
        Self {
            session,
            devices,
            stream: RwLock::new(None),
            parked_camera: RwLock::new(None),
            screen: RwLock::new(None),
            quality: Mutex::new(HashMap::new()),
            history_capacity: config.quality_history_capacity,
            stats_interval: config.stats_interval(),
            quality_tx,
            stats_task: Mutex::new(None),
        }
    }

    pub fn devices(&self) -> &Arc<dyn MediaDevices> {
        &self.devices
    }

    pub fn local_stream(&self) -> Option<LocalMediaStream> {
        self.stream.read().clone()
    }

    pub fn media_state(&self) -> LocalMediaState {
        let stream = self.stream.read();
        let screen_sharing = self.screen.read().is_some();
        let audio = stream.as_ref().and_then(|s| s.audio.as_ref());
        let video = stream.as_ref().and_then(|s| s.video.as_ref());

        LocalMediaState {
            has_audio: audio.is_some(),
            has_video: video.is_some(),
            audio_enabled: audio.map_or(false, |t| t.is_enabled()),
            video_enabled: video.map_or(false, |t| t.is_enabled()),
            screen_sharing,
        }
    }

    /// Acquire local media and attach it to every known peer connection
    ///
    /// Peers created afterwards pick the tracks up from the session.
    pub async fn create_local_stream(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream> {
        if self.stream.read().is_some() {
            return Err(Error::InvalidState("local stream already acquired".to_string()));
        }

        let stream = self.devices.acquire(constraints).await?;
        {
            let mut current = self.stream.write();
            if current.is_some() {
                return Err(Error::InvalidState("local stream already acquired".to_string()));
            }
            *current = Some(stream.clone());
        }

        let tracks = stream.tracks();
        self.session.set_local_tracks(tracks.clone());

        for (peer_id, slot) in self.session.registry().slots().await {
            let mut record = slot.record.lock().await;
            if let Err(e) = record.attach_tracks(&tracks).await {
                warn!("Failed to attach local media to {}: {}", peer_id, e);
            }
        }

        info!("Local stream {} attached ({} tracks)", stream.id, tracks.len());
        Ok(stream)
    }

    /// Swap the outbound video track on every live peer without renegotiation
    ///
    /// Peers whose connection failed or closed are left alone. Peers still
    /// connecting are included so they do not come up on the old track. A
    /// peer with no video sender is logged and skipped.
    pub async fn replace_video_track(&self, track: Arc<MediaTrack>) -> TrackReplaceReport {
        let mut report = TrackReplaceReport::default();

        for (peer_id, slot) in self.session.registry().slots().await {
            let mut record = slot.record.lock().await;
            if matches!(
                record.connection_state(),
                NativeConnectionState::Failed | NativeConnectionState::Closed
            ) {
                debug!("Not replacing video for {} ({})", peer_id, record.connection_state().as_str());
                continue;
            }
            match record.replace_track(TrackKind::Video, Arc::clone(&track)).await {
                Ok(()) => report.replaced.push(peer_id),
                Err(e) => {
                    warn!("Video track not replaced for {}: {}", peer_id, e);
                    report.skipped.push((peer_id, e.to_string()));
                }
            }
        }

        let mut tracks = self.session.local_tracks();
        tracks.retain(|t| t.kind() != TrackKind::Video);
        tracks.push(track);
        self.session.set_local_tracks(tracks);

        report
    }

    /// Mute or unmute the microphone; returns the new state
    pub fn set_audio_enabled(&self, enabled: bool) -> Result<bool> {
        let stream = self.stream.read();
        let track = stream
            .as_ref()
            .and_then(|s| s.audio.as_ref())
            .ok_or_else(|| Error::Device("no local audio track".to_string()))?;
        track.set_enabled(enabled);
        debug!("Audio {}", if enabled { "enabled" } else { "muted" });
        Ok(enabled)
    }

    /// Turn the camera on or off; returns the new state
    pub fn set_video_enabled(&self, enabled: bool) -> Result<bool> {
        let stream = self.stream.read();
        let track = stream
            .as_ref()
            .and_then(|s| s.video.as_ref())
            .ok_or_else(|| Error::Device("no local video track".to_string()))?;
        track.set_enabled(enabled);
        debug!("Video {}", if enabled { "enabled" } else { "disabled" });
        Ok(enabled)
    }

    /// Move to the next camera in device order
    pub async fn switch_camera(&self) -> Result<TrackReplaceReport> {
        if self.screen.read().is_some() {
            return Err(Error::InvalidState("cannot switch camera while sharing screen".to_string()));
        }
        let current = self
            .stream
            .read()
            .as_ref()
            .and_then(|s| s.video.clone())
            .ok_or_else(|| Error::Device("no local video track".to_string()))?;

        let cameras: Vec<_> = self
            .devices
            .enumerate()
            .await?
            .into_iter()
            .filter(|d| d.kind == DeviceKind::VideoInput)
            .collect();
        if cameras.len() < 2 {
            return Err(Error::Device("no other camera available".to_string()));
        }
        let position = cameras
            .iter()
            .position(|d| d.device_id == current.device_id())
            .unwrap_or(0);
        let next = &cameras[(position + 1) % cameras.len()];

        let constraints = MediaConstraints {
            audio: false,
            video: true,
            audio_device_id: None,
            video_device_id: Some(next.device_id.clone()),
        };
        let track = self
            .devices
            .acquire(&constraints)
            .await?
            .video
            .ok_or_else(|| Error::Device(format!("camera {} produced no track", next.device_id)))?;
        track.set_enabled(current.is_enabled());

        let report = self.replace_video_track(Arc::clone(&track)).await;
        if let Some(stream) = self.stream.write().as_mut() {
            stream.video = Some(track);
        }
        current.set_enabled(false);

        info!("Switched camera to {}", next.device_id);
        Ok(report)
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen.read().is_some()
    }

    /// Replace the camera with a screen capture track
    pub async fn start_screen_share(&self) -> Result<TrackReplaceReport> {
        if self.is_screen_sharing() {
            return Err(Error::InvalidState("screen share already active".to_string()));
        }

        let track = self.devices.acquire_display().await?;
        let camera = self.stream.read().as_ref().and_then(|s| s.video.clone());

        let report = self.replace_video_track(Arc::clone(&track)).await;
        *self.parked_camera.write() = camera;
        *self.screen.write() = Some(track);

        info!("Screen share started on {} peers", report.replaced.len());
        Ok(report)
    }

    /// Put the camera back; no-op when not sharing
    pub async fn stop_screen_share(&self) -> TrackReplaceReport {
        let Some(screen) = self.screen.write().take() else {
            return TrackReplaceReport::default();
        };
        screen.set_enabled(false);

        let parked = self.parked_camera.write().take();
        let report = match parked {
            Some(camera) => self.replace_video_track(camera).await,
            None => {
                let mut tracks = self.session.local_tracks();
                tracks.retain(|t| t.id() != screen.id());
                self.session.set_local_tracks(tracks);
                TrackReplaceReport::default()
            }
        };

        info!("Screen share stopped");
        report
    }

    pub fn subscribe_quality(&self) -> broadcast::Receiver<CallQualitySample> {
        self.quality_tx.subscribe()
    }

    /// Sample every peer's statistics once
    pub async fn collect_stats(&self) -> Vec<CallQualitySample> {
        let slots = self.session.registry().slots().await;
        let live: HashSet<String> = slots.iter().map(|(id, _)| id.clone()).collect();
        let mut samples = Vec::with_capacity(slots.len());

        for (peer_id, slot) in slots {
            // do not hold the record while the native stack gathers stats
            let connection = slot.record.lock().await.connection();
            let stats = match connection.get_stats().await {
                Ok(stats) => stats,
                Err(e) => {
                    debug!("Stats unavailable for {}: {}", peer_id, e);
                    continue;
                }
            };

            let sample = {
                let mut quality = self.quality.lock();
                let entry = quality
                    .entry(peer_id.clone())
                    .or_insert_with(|| PeerQuality::new(self.history_capacity));

                let now = Instant::now();
                let elapsed = entry
                    .sampled_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or(self.stats_interval);
                let jitter = match stats.round_trip_time_ms {
                    Some(rtt) => entry.jitter.update(rtt),
                    None => entry.jitter.current(),
                };

                let sample = CallQualitySample::from_stats(
                    &peer_id,
                    entry.previous.as_ref(),
                    &stats,
                    elapsed,
                    jitter,
                );
                entry.previous = Some(stats);
                entry.sampled_at = Some(now);
                entry.history.push(sample.clone());
                sample
            };

            if sample.is_degraded() {
                debug!("Degraded quality for {}: {:.1}", peer_id, sample.quality_score);
            }
            let _ = self.quality_tx.send(sample.clone());
            samples.push(sample);
        }

        self.quality.lock().retain(|peer_id, _| live.contains(peer_id));
        samples
    }

    /// Start periodic sampling; no-op when already running
    pub fn start_stats_collection(self: &Arc<Self>) {
        let mut task = self.stats_task.lock();
        if task.as_ref().map_or(false, |t| !t.is_finished()) {
            return;
        }

        let coordinator = Arc::downgrade(self);
        let period = self.stats_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(coordinator) = coordinator.upgrade() else {
                    break;
                };
                coordinator.collect_stats().await;
            }
        }));
        debug!("Stats collection every {:?}", period);
    }

    pub fn stop_stats_collection(&self) {
        if let Some(task) = self.stats_task.lock().take() {
            task.abort();
        }
    }

    /// Retained samples for one peer, oldest first
    pub fn history(&self, peer_id: &str) -> Vec<CallQualitySample> {
        self.quality
            .lock()
            .get(peer_id)
            .map(|q| q.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent sample per peer
    pub fn latest_samples(&self) -> HashMap<String, CallQualitySample> {
        self.quality
            .lock()
            .iter()
            .filter_map(|(id, q)| q.history.latest().map(|s| (id.clone(), s.clone())))
            .collect()
    }

    /// Mean of each peer's latest score
    pub fn aggregate_quality(&self) -> Option<f64> {
        let quality = self.quality.lock();
        let scores: Vec<f64> = quality
            .values()
            .filter_map(|q| q.history.latest().map(|s| s.quality_score))
            .collect();
        if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f64>() / scores.len() as f64)
        }
    }

    /// Stop sampling and drop every local track. Never fails.
    pub fn release(&self) {
        self.stop_stats_collection();

        let stream = self.stream.write().take();
        let screen = self.screen.write().take();
        let camera = self.parked_camera.write().take();
        let tracks = stream
            .iter()
            .flat_map(|s| s.tracks())
            .chain(screen)
            .chain(camera);
        let mut released = 0;
        for track in tracks {
            track.set_enabled(false);
            released += 1;
        }

        self.quality.lock().clear();
        self.session.set_local_tracks(Vec::new());
        if released > 0 {
            debug!("Released {} local tracks", released);
        }
    }
}

impl Drop for MediaSessionCoordinator {
    fn drop(&mut self) {
        self.stop_stats_collection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::devices::StaticMediaDevices;
    use crate::signaling::transport::ChannelTransport;
    use crate::testing::FakeConnectionFactory;

    struct Harness {
        session: Arc<SignalingSession>,
        factory: Arc<FakeConnectionFactory>,
        devices: Arc<StaticMediaDevices>,
        coordinator: Arc<MediaSessionCoordinator>,
        _remote: ChannelTransport,
    }

    async fn harness(peers: &[&str]) -> Harness {
        let config = CallConfig::default();
        let (local, remote) = ChannelTransport::pair();
        let factory = Arc::new(FakeConnectionFactory::new());
        let session = Arc::new(SignalingSession::new(&config, "me", Arc::new(local), factory.clone()));
        let devices = Arc::new(StaticMediaDevices::with_default_devices());
        let coordinator = Arc::new(MediaSessionCoordinator::new(
            &config,
            session.clone(),
            devices.clone(),
        ));

        let ids: Vec<String> = peers.iter().map(|s| s.to_string()).collect();
        session.start_call("c1", &ids).await.unwrap();

        Harness {
            session,
            factory,
            devices,
            coordinator,
            _remote: remote,
        }
    }

    #[tokio::test]
    async fn test_stream_attached_to_existing_and_new_peers() {
        let h = harness(&["p1"]).await;
        h.coordinator
            .create_local_stream(&MediaConstraints::audio_video())
            .await
            .unwrap();
        assert_eq!(h.factory.connection("p1").unwrap().track_count(), 2);

        h.session.join_call("c1", "p2").await.unwrap();
        assert_eq!(h.factory.connection("p2").unwrap().track_count(), 2);

        let err = h
            .coordinator
            .create_local_stream(&MediaConstraints::audio_only())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_permission_error_propagates() {
        let h = harness(&["p1"]).await;
        h.devices.set_microphone_permission(false);

        let err = h
            .coordinator
            .create_local_stream(&MediaConstraints::audio_only())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Permission(_)));
        assert!(h.coordinator.local_stream().is_none());
    }

    #[tokio::test]
    async fn test_replace_skips_peers_without_video_sender() {
        let h = harness(&["p1"]).await;
        h.coordinator
            .create_local_stream(&MediaConstraints::audio_video())
            .await
            .unwrap();
        // p2 joins after media was reset to audio only
        h.session.set_local_tracks(Vec::new());
        h.session.join_call("c1", "p2").await.unwrap();

        let track = Arc::new(MediaTrack::new(TrackKind::Video, "camera-back", "s"));
        let report = h.coordinator.replace_video_track(track.clone()).await;

        assert_eq!(report.replaced, vec!["p1"]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0, "p2");
        assert_eq!(
            h.factory.connection("p1").unwrap().current_track(TrackKind::Video),
            Some(track.id().to_string())
        );
    }

    #[tokio::test]
    async fn test_replace_leaves_failed_peers_alone() {
        let h = harness(&["p1", "p2"]).await;
        h.coordinator
            .create_local_stream(&MediaConstraints::audio_video())
            .await
            .unwrap();
        let old_video = h.factory.connection("p2").unwrap().current_track(TrackKind::Video);
        let failed = NativeConnectionState::Failed;
        let event = h
            .factory
            .event("p2", crate::peer::NativeEventKind::ConnectionState(failed))
            .unwrap();
        h.session.handle_native_event(event).await;

        let track = Arc::new(MediaTrack::new(TrackKind::Video, "camera-back", "s"));
        let report = h.coordinator.replace_video_track(track).await;

        assert_eq!(report.replaced, vec!["p1"]);
        assert!(report.skipped.is_empty());
        assert_eq!(
            h.factory.connection("p2").unwrap().current_track(TrackKind::Video),
            old_video
        );
    }

    #[tokio::test]
    async fn test_toggles() {
        let h = harness(&["p1"]).await;
        assert!(h.coordinator.set_audio_enabled(false).is_err());

        h.coordinator
            .create_local_stream(&MediaConstraints::audio_video())
            .await
            .unwrap();
        h.coordinator.set_audio_enabled(false).unwrap();

        let state = h.coordinator.media_state();
        assert!(!state.audio_enabled);
        assert!(state.video_enabled);
        assert!(!state.screen_sharing);
    }

    #[tokio::test]
    async fn test_switch_camera_cycles_devices() {
        let h = harness(&["p1"]).await;
        h.coordinator
            .create_local_stream(&MediaConstraints::audio_video())
            .await
            .unwrap();

        let report = h.coordinator.switch_camera().await.unwrap();
        assert_eq!(report.replaced, vec!["p1"]);
        let video = h.coordinator.local_stream().unwrap().video.unwrap();
        assert_eq!(video.device_id(), "camera-back");

        h.coordinator.switch_camera().await.unwrap();
        let video = h.coordinator.local_stream().unwrap().video.unwrap();
        assert_eq!(video.device_id(), "camera-front");
    }

    #[tokio::test]
    async fn test_screen_share_round_trip() {
        let h = harness(&["p1"]).await;
        h.coordinator
            .create_local_stream(&MediaConstraints::audio_video())
            .await
            .unwrap();
        let camera = h.coordinator.local_stream().unwrap().video.unwrap();

        h.coordinator.start_screen_share().await.unwrap();
        assert!(h.coordinator.is_screen_sharing());
        assert!(h.coordinator.start_screen_share().await.is_err());
        assert!(h.coordinator.switch_camera().await.is_err());

        h.coordinator.stop_screen_share().await;
        assert!(!h.coordinator.is_screen_sharing());
        assert_eq!(
            h.factory.connection("p1").unwrap().current_track(TrackKind::Video),
            Some(camera.id().to_string())
        );
    }

    #[tokio::test]
    async fn test_collect_stats_builds_history() {
        let h = harness(&["p1", "p2"]).await;
        h.factory.connection("p1").unwrap().set_stats(NativeStats {
            round_trip_time_ms: Some(250.0),
            jitter_ms: Some(20.0),
            packets_received: 99,
            packets_lost: 1,
            ..Default::default()
        });
        h.factory.connection("p2").unwrap().set_stats(NativeStats {
            round_trip_time_ms: Some(400.0),
            jitter_ms: Some(10.0),
            packets_received: 100,
            ..Default::default()
        });
        let mut quality = h.coordinator.subscribe_quality();

        let samples = h.coordinator.collect_stats().await;

        assert_eq!(samples.len(), 2);
        assert_eq!(quality.recv().await.unwrap().peer_id, "p1");
        let p1 = &h.coordinator.history("p1")[0];
        assert_eq!(p1.quality_score, 4.5);
        assert_eq!(h.coordinator.latest_samples()["p2"].quality_score, 3.5);
        assert_eq!(h.coordinator.aggregate_quality(), Some(4.0));
    }

    #[tokio::test]
    async fn test_history_dropped_for_removed_peer() {
        let h = harness(&["p1", "p2"]).await;
        h.coordinator.collect_stats().await;
        assert_eq!(h.coordinator.latest_samples().len(), 2);

        h.session.remove_peer("p2").await;
        h.coordinator.collect_stats().await;

        assert!(h.coordinator.history("p2").is_empty());
        assert_eq!(h.coordinator.history("p1").len(), 2);
    }

    #[tokio::test]
    async fn test_release_disables_tracks() {
        let h = harness(&["p1"]).await;
        let stream = h
            .coordinator
            .create_local_stream(&MediaConstraints::audio_video())
            .await
            .unwrap();
        h.coordinator.start_stats_collection();

        h.coordinator.release();
        h.coordinator.release();

        assert!(stream.tracks().iter().all(|t| !t.is_enabled()));
        assert!(h.coordinator.local_stream().is_none());
        assert!(h.session.local_tracks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_collection() {
        let h = harness(&["p1"]).await;
        let mut quality = h.coordinator.subscribe_quality();
        h.coordinator.start_stats_collection();

        let sample = quality.recv().await.unwrap();
        assert_eq!(sample.peer_id, "p1");
        h.coordinator.stop_stats_collection();
    }
}
