//! Signaling transport abstraction and in-memory implementations

use super::protocol::SignalingMessage;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Default inbound buffer for in-memory transports
const DEFAULT_CAPACITY: usize = 256;

/// Duplex channel to the call-signaling server
///
/// Implementations parse inbound frames into [`SignalingMessage`] before
/// publishing them; frames that do not parse are logged and dropped.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Send one message to the server
    async fn send(&self, message: SignalingMessage) -> Result<()>;

    /// Subscribe to inbound messages
    fn subscribe(&self) -> broadcast::Receiver<SignalingMessage>;
}

enum Route {
    /// Everything goes to the linked endpoint
    Direct(broadcast::Sender<SignalingMessage>),
    /// Delivered to the endpoint registered under `to_peer_id`
    Hub(ChannelHub),
}

/// In-memory transport endpoint
///
/// Outbound messages take a JSON round trip so tests see exactly what a
/// socket would carry.
pub struct ChannelTransport {
    inbound: broadcast::Sender<SignalingMessage>,
    route: Route,
}

impl ChannelTransport {
    /// Two endpoints wired back to back
    ///
    /// ```
    /// use meshcall_webrtc::signaling::{
    ///     ChannelTransport, SignalingBody, SignalingMessage, SignalingTransport,
    /// };
    ///
    /// # tokio_test::block_on(async {
    /// let (alice, bob) = ChannelTransport::pair();
    /// let mut inbound = bob.subscribe();
    ///
    /// alice
    ///     .send(SignalingMessage::new("c1", "alice", "bob", SignalingBody::CallAccept))
    ///     .await
    ///     .unwrap();
    /// assert_eq!(inbound.recv().await.unwrap().action(), "call_accept");
    /// # });
    /// ```
    pub fn pair() -> (Self, Self) {
        Self::pair_with_capacity(DEFAULT_CAPACITY)
    }

    pub fn pair_with_capacity(capacity: usize) -> (Self, Self) {
        let (a_tx, _) = broadcast::channel(capacity);
        let (b_tx, _) = broadcast::channel(capacity);

        let a = Self {
            inbound: a_tx.clone(),
            route: Route::Direct(b_tx.clone()),
        };
        let b = Self {
            inbound: b_tx,
            route: Route::Direct(a_tx),
        };
        (a, b)
    }
}

#[async_trait]
impl SignalingTransport for ChannelTransport {
    async fn send(&self, message: SignalingMessage) -> Result<()> {
        let wire = SignalingMessage::from_json(&message.to_json()?)?;

        match &self.route {
            Route::Direct(peer) => {
                if peer.send(wire).is_err() {
                    debug!("Signaling peer endpoint has no subscribers");
                }
                Ok(())
            }
            Route::Hub(hub) => hub.deliver(wire),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingMessage> {
        self.inbound.subscribe()
    }
}

/// In-memory signaling server routing by `to_peer_id`
///
/// Used to run several [`crate::CallOrchestrator`]s in one process.
#[derive(Clone, Default)]
pub struct ChannelHub {
    endpoints: Arc<RwLock<HashMap<String, broadcast::Sender<SignalingMessage>>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer and return its endpoint
    pub fn connect(&self, peer_id: &str) -> ChannelTransport {
        let (tx, _) = broadcast::channel(DEFAULT_CAPACITY);
        self.endpoints.write().insert(peer_id.to_string(), tx.clone());

        ChannelTransport {
            inbound: tx,
            route: Route::Hub(self.clone()),
        }
    }

    /// Drop a peer's registration
    pub fn disconnect(&self, peer_id: &str) {
        self.endpoints.write().remove(peer_id);
    }

    fn deliver(&self, message: SignalingMessage) -> Result<()> {
        let endpoint = self.endpoints.read().get(&message.to_peer_id).cloned();

        match endpoint {
            Some(tx) => {
                if tx.send(message).is_err() {
                    debug!("Hub endpoint has no subscribers");
                }
                Ok(())
            }
            None => Err(Error::Signaling(format!(
                "peer {} is not connected",
                message.to_peer_id
            ))),
        }
    }
}
