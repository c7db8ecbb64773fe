//! Local media, track replacement and connection quality

pub mod coordinator;
pub mod devices;
pub mod quality;

pub use coordinator::{LocalMediaState, MediaSessionCoordinator, TrackReplaceReport};
pub use devices::{
    DeviceKind, LocalMediaStream, MediaConstraints, MediaDeviceInfo, MediaDevices, MediaTrack,
    StaticMediaDevices, TrackKind,
};
pub use quality::{quality_score, CallQualitySample, QualityHistory, QualityLevel};
