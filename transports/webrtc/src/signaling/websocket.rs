//! WebSocket signaling transport

use super::protocol::SignalingMessage;
use super::transport::SignalingTransport;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Signaling transport over a WebSocket connection
///
/// Frames are JSON text; one frame carries one [`SignalingMessage`].
/// Reconnection is left to the caller.
pub struct WebSocketTransport {
    /// Signaling server URL
    url: String,

    /// Outgoing frame sender
    tx: mpsc::UnboundedSender<Message>,

    /// Parsed inbound messages
    inbound: broadcast::Sender<SignalingMessage>,

    sender: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

impl WebSocketTransport {
    /// Connect to the signaling server
    ///
    /// Establishes the WebSocket connection and starts background tasks for
    /// sending and receiving frames.
    pub async fn connect(url: &str, capacity: usize) -> Result<Self> {
        info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::WebSocket(format!("Failed to connect: {}", e)))?;

        info!("Connected to signaling server");

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let (inbound, _) = broadcast::channel(capacity);

        let sender = tokio::spawn(Self::sender_task(write, rx));
        let receiver = tokio::spawn(Self::receiver_task(read, inbound.clone()));

        Ok(Self {
            url: url.to_string(),
            tx,
            inbound,
            sender,
            receiver,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send a close frame; background tasks stop once the server answers
    pub fn close(&self) {
        if self.tx.send(Message::Close(None)).is_err() {
            debug!("WebSocket already closed");
        }
    }

    async fn sender_task(
        mut write: futures::stream::SplitSink<WsStream, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }

        debug!("Sender task terminated");
    }

    async fn receiver_task(
        mut read: futures::stream::SplitStream<WsStream>,
        inbound: broadcast::Sender<SignalingMessage>,
    ) {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match SignalingMessage::from_json(&text) {
                    Ok(message) => {
                        debug!(action = message.action(), from = %message.from_peer_id, "Signaling message received");
                        // no subscribers yet is not an error
                        let _ = inbound.send(message);
                    }
                    Err(e) => warn!("Dropping malformed signaling frame: {}", e),
                },
                Ok(Message::Close(_)) => {
                    info!("WebSocket connection closed");
                    break;
                }
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
                _ => {}
            }
        }

        debug!("Receiver task terminated");
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn send(&self, message: SignalingMessage) -> Result<()> {
        let text = message.to_json()?;
        debug!(action = message.action(), to = %message.to_peer_id, "Sending signaling message");

        self.tx
            .send(Message::Text(text))
            .map_err(|_| Error::Signaling("signaling connection closed".to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalingMessage> {
        self.inbound.subscribe()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.sender.abort();
        self.receiver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::protocol::SignalingBody;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_refused() {
        let result = WebSocketTransport::connect("ws://127.0.0.1:1", 16).await;
        assert!(matches!(result, Err(Error::WebSocket(_))));
    }

    #[tokio::test]
    async fn test_round_trip_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // echo server that also pushes one garbage frame first
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text("not json".to_string())).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_text() {
                    ws.send(msg).await.unwrap();
                }
            }
        });

        let transport = WebSocketTransport::connect(&format!("ws://{}", addr), 16)
            .await
            .unwrap();
        let mut rx = transport.subscribe();

        let message = SignalingMessage::new("c1", "a", "b", SignalingBody::CallAccept);
        transport.send(message.clone()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), message);
    }
}
