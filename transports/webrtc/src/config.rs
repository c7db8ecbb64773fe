//! Configuration types for call signaling

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Largest mesh a single device will hold connections for
pub const MAX_MESH_PEERS: u32 = 16;

/// Main configuration for a [`crate::CallOrchestrator`] and the session it drives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// WebSocket signaling server URL (ws:// or wss://)
    pub signaling_url: String,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Local peer ID (auto-generated if None)
    pub local_peer_id: Option<String>,

    /// Maximum remote peers in the mesh (default: 8, max: 16)
    pub max_peers: u32,

    /// Open a control data channel to every peer (default: true)
    pub enable_data_channel: bool,

    /// Data channel mode (default: Reliable)
    pub data_channel_mode: DataChannelMode,

    /// Interval between connection statistics samples (default: 5000ms)
    pub stats_interval_ms: u64,

    /// Quality samples retained per peer (default: 60)
    pub quality_history_capacity: usize,

    /// Buffered signaling events per subscriber (default: 256)
    pub event_channel_capacity: usize,

    /// Buffered quality samples per subscriber (default: 64)
    pub quality_channel_capacity: usize,

    /// Seconds an unanswered call rings before it is dropped (0 disables)
    pub ring_timeout_secs: u64,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Data channel mode
///
/// Determines the reliability of message delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataChannelMode {
    /// Reliable, ordered delivery (default)
    Reliable,
    /// Unreliable, unordered delivery (low latency)
    Unreliable,
}

impl DataChannelMode {
    /// Get the ordered setting for webrtc-rs
    pub fn ordered(&self) -> bool {
        match self {
            DataChannelMode::Reliable => true,
            DataChannelMode::Unreliable => false,
        }
    }

    /// Get the max retransmits setting for webrtc-rs
    pub fn max_retransmits(&self) -> Option<u16> {
        match self {
            DataChannelMode::Reliable => None,
            DataChannelMode::Unreliable => Some(0),
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8080".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            local_peer_id: None,
            max_peers: 8,
            enable_data_channel: true,
            data_channel_mode: DataChannelMode::Reliable,
            stats_interval_ms: 5000,
            quality_history_capacity: 60,
            event_channel_capacity: 256,
            quality_channel_capacity: 64,
            ring_timeout_secs: 45,
        }
    }
}

impl CallConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_servers` is empty
    /// - `max_peers` is not in range 1-16
    /// - `stats_interval_ms` is not in range 1000-60000
    /// - `quality_history_capacity` is not in range 1-1024
    /// - either channel capacity is zero
    /// - `signaling_url` is not a WebSocket URL
    /// - a TURN server URL does not use the turn:/turns: scheme
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        if self.max_peers == 0 || self.max_peers > MAX_MESH_PEERS {
            return Err(Error::InvalidConfig(format!(
                "max_peers must be in range 1-{}, got {}",
                MAX_MESH_PEERS, self.max_peers
            )));
        }

        if !(1000..=60000).contains(&self.stats_interval_ms) {
            return Err(Error::InvalidConfig(format!(
                "stats_interval_ms must be in range 1000-60000, got {}",
                self.stats_interval_ms
            )));
        }

        if self.quality_history_capacity == 0 || self.quality_history_capacity > 1024 {
            return Err(Error::InvalidConfig(format!(
                "quality_history_capacity must be in range 1-1024, got {}",
                self.quality_history_capacity
            )));
        }

        if self.event_channel_capacity == 0 || self.quality_channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "channel capacities must be non-zero".to_string(),
            ));
        }

        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got {}",
                self.signaling_url
            )));
        }

        if let Some(turn) = self
            .turn_servers
            .iter()
            .find(|t| !t.url.starts_with("turn:") && !t.url.starts_with("turns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "TURN url must start with turn: or turns:, got {}",
                turn.url
            )));
        }

        Ok(())
    }

    /// Load a configuration from a JSON file
    ///
    /// Missing fields fall back to their defaults. The result is validated.
    pub fn from_json_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: CallConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Statistics sampling interval
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    /// Ring timeout, `None` when disabled
    pub fn ring_timeout(&self) -> Option<Duration> {
        (self.ring_timeout_secs > 0).then(|| Duration::from_secs(self.ring_timeout_secs))
    }

    /// Create a configuration preset optimized for low latency
    ///
    /// Faster statistics feedback and an unreliable data channel.
    ///
    /// # Example
    ///
    /// ```
    /// use meshcall_webrtc::config::{CallConfig, DataChannelMode};
    ///
    /// let config = CallConfig::low_latency_preset("ws://localhost:8080");
    /// assert_eq!(config.stats_interval_ms, 2000);
    /// assert_eq!(config.data_channel_mode, DataChannelMode::Unreliable);
    /// ```
    pub fn low_latency_preset(signaling_url: &str) -> Self {
        Self {
            signaling_url: signaling_url.to_string(),
            data_channel_mode: DataChannelMode::Unreliable,
            stats_interval_ms: 2000,
            quality_history_capacity: 150,
            ..Self::default()
        }
    }

    /// Create a configuration preset for cellular or unstable networks
    ///
    /// Backup STUN server, smaller mesh, longer ring timeout. TURN servers
    /// are usually required and can be added with
    /// [`with_turn_servers`](Self::with_turn_servers).
    ///
    /// # Example
    ///
    /// ```
    /// use meshcall_webrtc::config::{CallConfig, TurnServerConfig};
    ///
    /// let config = CallConfig::mobile_network_preset("ws://localhost:8080")
    ///     .with_turn_servers(vec![TurnServerConfig {
    ///         url: "turn:turn.example.com:3478".to_string(),
    ///         username: "user".to_string(),
    ///         credential: "pass".to_string(),
    ///     }]);
    /// assert_eq!(config.max_peers, 4);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn mobile_network_preset(signaling_url: &str) -> Self {
        Self {
            signaling_url: signaling_url.to_string(),
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            max_peers: 4,
            stats_interval_ms: 3000,
            ring_timeout_secs: 60,
            ..Self::default()
        }
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Set the local peer ID for this configuration
    pub fn with_local_peer_id(mut self, peer_id: &str) -> Self {
        self.local_peer_id = Some(peer_id.to_string());
        self
    }

    /// Set the maximum number of remote peers
    pub fn with_max_peers(mut self, max_peers: u32) -> Self {
        self.max_peers = max_peers;
        self
    }

    /// Resolve the local peer ID, generating one if none is configured
    pub fn resolve_local_peer_id(&self) -> String {
        self.local_peer_id
            .clone()
            .unwrap_or_else(|| format!("peer-{}", uuid::Uuid::new_v4()))
    }
}
