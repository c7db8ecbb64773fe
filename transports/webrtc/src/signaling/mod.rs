//! Signaling wire format and transports

pub mod protocol;
pub mod transport;
pub mod websocket;

pub use protocol::{SdpType, SessionDescription, SignalingBody, SignalingMessage};
pub use transport::{ChannelHub, ChannelTransport, SignalingTransport};
pub use websocket::WebSocketTransport;
