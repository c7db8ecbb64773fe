//! Local media acquisition
//!
//! Capture itself belongs to the platform. This module defines the contract
//! the call core consumes (constraints in, stream or permission/device error
//! out) and the track type handed to peer connections.

use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Kind of capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    AudioInput,
    VideoInput,
}

/// One capture device as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDeviceInfo {
    pub device_id: String,
    pub label: String,
    pub kind: DeviceKind,
}

impl MediaDeviceInfo {
    pub fn new(device_id: &str, label: &str, kind: DeviceKind) -> Self {
        Self {
            device_id: device_id.to_string(),
            label: label.to_string(),
            kind,
        }
    }
}

/// What the caller wants captured
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    /// Specific microphone, first available when `None`
    pub audio_device_id: Option<String>,
    /// Specific camera, first available when `None`
    pub video_device_id: Option<String>,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            ..Default::default()
        }
    }

    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
            ..Default::default()
        }
    }

    pub fn with_video_device(mut self, device_id: &str) -> Self {
        self.video = true;
        self.video_device_id = Some(device_id.to_string());
        self
    }
}

/// Device id reported for screen capture tracks
pub const SCREEN_DEVICE_ID: &str = "screen";

/// A local outbound track
///
/// Wraps the webrtc-rs sample track that peer connections send from.
/// Disabling a track keeps it attached but stops samples from being written.
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    device_id: String,
    enabled: AtomicBool,
    local: Arc<TrackLocalStaticSample>,
}

impl MediaTrack {
    /// Create a track with the default codec for its kind (Opus or VP8)
    pub fn new(kind: TrackKind, device_id: &str, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind_label(kind), uuid::Uuid::new_v4());

        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };

        let local = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            stream_id.to_string(),
        ));

        Self {
            id,
            kind,
            device_id: device_id.to_string(),
            enabled: AtomicBool::new(true),
            local,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_screen(&self) -> bool {
        self.device_id == SCREEN_DEVICE_ID
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// The webrtc-rs track attached to peer connections
    pub fn local(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.local)
    }

    /// Write one encoded frame; dropped while the track is disabled
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }

        let sample = Sample {
            data,
            duration,
            timestamp: std::time::SystemTime::now(),
            ..Default::default()
        };

        self.local
            .write_sample(&sample)
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to write sample: {}", e)))
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("device_id", &self.device_id)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

fn kind_label(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

/// Tracks acquired together for one call
#[derive(Debug, Clone)]
pub struct LocalMediaStream {
    pub id: String,
    pub audio: Option<Arc<MediaTrack>>,
    pub video: Option<Arc<MediaTrack>>,
}

impl LocalMediaStream {
    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }
}

/// Platform media collaborator
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// List capture devices
    async fn enumerate(&self) -> Result<Vec<MediaDeviceInfo>>;

    /// Acquire a camera/microphone stream
    ///
    /// Fails with [`Error::Permission`] when access is denied and
    /// [`Error::Device`] when no device matches.
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream>;

    /// Acquire a screen capture video track
    async fn acquire_display(&self) -> Result<Arc<MediaTrack>>;
}

#[derive(Debug, Clone, Copy)]
struct Permissions {
    microphone: bool,
    camera: bool,
    screen: bool,
}

/// Fixed device list with switchable permission grants
///
/// Tracks it hands out are fed by the application through
/// [`MediaTrack::write_sample`].
pub struct StaticMediaDevices {
    devices: Vec<MediaDeviceInfo>,
    permissions: RwLock<Permissions>,
}

impl StaticMediaDevices {
    /// All permissions granted
    pub fn new(devices: Vec<MediaDeviceInfo>) -> Self {
        Self {
            devices,
            permissions: RwLock::new(Permissions {
                microphone: true,
                camera: true,
                screen: true,
            }),
        }
    }

    /// One microphone plus front and back cameras
    pub fn with_default_devices() -> Self {
        Self::new(vec![
            MediaDeviceInfo::new("mic-0", "Built-in Microphone", DeviceKind::AudioInput),
            MediaDeviceInfo::new("camera-front", "Front Camera", DeviceKind::VideoInput),
            MediaDeviceInfo::new("camera-back", "Back Camera", DeviceKind::VideoInput),
        ])
    }

    pub fn set_microphone_permission(&self, granted: bool) {
        self.permissions.write().microphone = granted;
    }

    pub fn set_camera_permission(&self, granted: bool) {
        self.permissions.write().camera = granted;
    }

    pub fn set_screen_permission(&self, granted: bool) {
        self.permissions.write().screen = granted;
    }

    fn pick(&self, kind: DeviceKind, wanted: Option<&str>) -> Result<&MediaDeviceInfo> {
        self.devices
            .iter()
            .filter(|d| d.kind == kind)
            .find(|d| wanted.map_or(true, |id| d.device_id == id))
            .ok_or_else(|| match wanted {
                Some(id) => Error::Device(format!("no device with id {}", id)),
                None => Error::Device(format!("no {:?} device available", kind)),
            })
    }
}

#[async_trait]
impl MediaDevices for StaticMediaDevices {
    async fn enumerate(&self) -> Result<Vec<MediaDeviceInfo>> {
        Ok(self.devices.clone())
    }

    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaStream> {
        if !constraints.audio && !constraints.video {
            return Err(Error::Device("constraints request no media".to_string()));
        }

        let permissions = *self.permissions.read();
        let stream_id = format!("stream-{}", uuid::Uuid::new_v4());

        let audio = if constraints.audio {
            if !permissions.microphone {
                return Err(Error::Permission("microphone access denied".to_string()));
            }
            let device = self.pick(DeviceKind::AudioInput, constraints.audio_device_id.as_deref())?;
            Some(Arc::new(MediaTrack::new(TrackKind::Audio, &device.device_id, &stream_id)))
        } else {
            None
        };

        let video = if constraints.video {
            if !permissions.camera {
                return Err(Error::Permission("camera access denied".to_string()));
            }
            let device = self.pick(DeviceKind::VideoInput, constraints.video_device_id.as_deref())?;
            Some(Arc::new(MediaTrack::new(TrackKind::Video, &device.device_id, &stream_id)))
        } else {
            None
        };

        info!(
            stream_id = %stream_id,
            audio = audio.is_some(),
            video = video.is_some(),
            "Acquired local media"
        );

        Ok(LocalMediaStream {
            id: stream_id,
            audio,
            video,
        })
    }

    async fn acquire_display(&self) -> Result<Arc<MediaTrack>> {
        if !self.permissions.read().screen {
            return Err(Error::Permission("screen capture denied".to_string()));
        }

        debug!("Acquired screen capture track");
        Ok(Arc::new(MediaTrack::new(
            TrackKind::Video,
            SCREEN_DEVICE_ID,
            &format!("screen-{}", uuid::Uuid::new_v4()),
        )))
    }
}
