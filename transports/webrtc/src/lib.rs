//! Mesh call signaling and peer-session orchestration over WebRTC
//!
//! This crate negotiates and manages WebRTC sessions between two or more
//! participants over a signaling transport. Every participant holds a direct
//! connection to every other participant (mesh topology).
//!
//! # Features
//!
//! - **Per-peer negotiation records**: offer/answer state and a pending ICE
//!   candidate buffer drained right after the remote description is applied
//! - **Call-level state machine**: idle → connecting → offering/answering →
//!   stable → closed, with failed reachable from any live state
//! - **Unified event stream**: offers, answers, candidates, connection state
//!   and data channel traffic as [`session::SignalingEvent`]s
//! - **Media coordination**: local stream attachment, in-place video track
//!   replacement (camera switch, screen share) and per-peer quality history
//! - **Call façade**: invite/accept/reject/end intents and one aggregated
//!   [`call::CallState`] stream for the UI
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  UI layer                                              │
//! │  ↓ intents                     ↑ CallState (watch)     │
//! │  CallOrchestrator                                      │
//! │  ├─ MediaSessionCoordinator (tracks, quality samples)  │
//! │  └─ SignalingSession (one call, N peers)               │
//! │     ├─ SignalingStateMachine                           │
//! │     ├─ PeerRegistry → PeerConnectionRecord per peer    │
//! │     │   └─ NativePeerConnection (webrtc-rs)            │
//! │     └─ SignalingTransport (WebSocket / in-memory)      │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use meshcall_webrtc::CallConfig;
//!
//! let config = CallConfig {
//!     signaling_url: "ws://localhost:8080".to_string(),
//!     max_peers: 4,
//!     ..Default::default()
//! };
//!
//! assert!(config.validate().is_ok());
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use meshcall_webrtc::media::StaticMediaDevices;
//! use meshcall_webrtc::peer::RtcConnectionFactory;
//! use meshcall_webrtc::signaling::WebSocketTransport;
//! use meshcall_webrtc::{CallConfig, CallOrchestrator};
//! use std::sync::Arc;
//!
//! # async fn example() -> meshcall_webrtc::Result<()> {
//! let config = CallConfig::default().with_local_peer_id("alice");
//! let transport = WebSocketTransport::connect(&config.signaling_url, 256).await?;
//! let factory = RtcConnectionFactory::new(&config);
//! let devices = StaticMediaDevices::with_default_devices();
//!
//! let orchestrator = CallOrchestrator::new(
//!     config,
//!     Arc::new(transport),
//!     Arc::new(factory),
//!     Arc::new(devices),
//! )?;
//! orchestrator.start()?;
//!
//! let call_id = orchestrator.initiate_call(&["bob".to_string()], true).await?;
//! # let _ = call_id;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod call;
pub mod config;
pub mod error;
pub mod ice;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-exports for public API
pub use call::{CallOrchestrator, CallPhase, CallState};
pub use config::{CallConfig, DataChannelMode, TurnServerConfig};
pub use error::{Error, Result};
pub use ice::IceCandidate;
pub use session::{SignalingEvent, SignalingEventKind, SignalingSession, SignalingState};
pub use signaling::{SignalingMessage, SignalingTransport};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
