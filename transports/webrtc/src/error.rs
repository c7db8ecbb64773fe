//! Error types for call signaling and media orchestration

/// Result type alias using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while negotiating or running a call
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation referenced a peer with no connection record
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    /// Operation is not valid for the current negotiation state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Native connection, description or candidate operation failed
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// Media device permission denied
    #[error("Permission denied: {0}")]
    Permission(String),

    /// No media device matched the requested constraints
    #[error("Device error: {0}")]
    Device(String),

    /// Track replacement found no matching outbound sender
    #[error("No sender: {0}")]
    NoSender(String),

    /// A call is already active on this device
    #[error("Call already active: {0}")]
    CallAlreadyActive(String),

    /// Operation requires an active call
    #[error("No active call")]
    NoActiveCall,

    /// Mesh size limit reached
    #[error("Maximum peer limit reached ({0})")]
    MaxPeersReached(usize),

    /// Signaling transport error
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannel(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Negotiation(_) | Error::Signaling(_) | Error::WebSocket(_) | Error::Io(_)
        )
    }

    /// Check if this error came from local media acquisition or track handling
    pub fn is_media_error(&self) -> bool {
        matches!(
            self,
            Error::Permission(_) | Error::Device(_) | Error::NoSender(_)
        )
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::UnknownPeer(_) | Error::Negotiation(_) | Error::MaxPeersReached(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UnknownPeer("p1".to_string());
        assert_eq!(err.to_string(), "Unknown peer: p1");
        assert_eq!(Error::NoActiveCall.to_string(), "No active call");
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::Negotiation("offer".to_string()).is_retryable());
        assert!(Error::Signaling("closed".to_string()).is_retryable());
        assert!(!Error::Permission("camera".to_string()).is_retryable());
    }

    #[test]
    fn test_error_is_media_error() {
        assert!(Error::Permission("mic".to_string()).is_media_error());
        assert!(Error::Device("no camera".to_string()).is_media_error());
        assert!(Error::NoSender("p1".to_string()).is_media_error());
        assert!(!Error::InvalidState("x".to_string()).is_media_error());
    }

    #[test]
    fn test_error_is_peer_error() {
        assert!(Error::UnknownPeer("p3".to_string()).is_peer_error());
        assert!(Error::MaxPeersReached(4).is_peer_error());
        assert!(!Error::InvalidConfig("x".to_string()).is_peer_error());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(Error::from(json_err), Error::Serialization(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "config missing");
        assert!(matches!(Error::from(io_err), Error::Io(_)));
    }
}
