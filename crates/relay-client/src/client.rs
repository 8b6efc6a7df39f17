//! Relay control-channel client
//!
//! Handles the WebSocket connection to the relay for room membership and
//! session-description / candidate exchange.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use shared_protocol::{
    ClientMessage, HEARTBEAT_INTERVAL_SECS, IceCandidate, PeerId, RelayMessage, RoomId,
    SessionDescription,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::{RelayError, RelayResult};

/// Relay client configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// WebSocket URL of the relay
    pub url: String,
    pub room_id: RoomId,
    pub peer_id: PeerId,
    /// Interval between `ping` messages
    pub heartbeat_interval: Duration,
    /// Capacity of the outgoing and incoming queues
    pub channel_capacity: usize,
}

impl RelayConfig {
    pub fn new(url: impl Into<String>, room_id: RoomId, peer_id: PeerId) -> Self {
        Self {
            url: url.into(),
            room_id,
            peer_id,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            channel_capacity: 100,
        }
    }
}

/// Something the relay told us
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Joined {
        room_id: RoomId,
    },
    PeerJoined {
        peer_id: PeerId,
    },
    Offer {
        from: PeerId,
        description: SessionDescription,
    },
    Answer {
        from: PeerId,
        description: SessionDescription,
    },
    IceCandidate {
        from: PeerId,
        candidate: IceCandidate,
    },
    Error {
        message: String,
    },
    /// The control channel closed
    Disconnected,
}

impl RelayEvent {
    /// Map a relay message to an event. Liveness replies and unknown
    /// message types produce nothing.
    pub fn from_message(message: RelayMessage) -> Option<Self> {
        match message {
            RelayMessage::Joined { room_id } => Some(RelayEvent::Joined { room_id }),
            RelayMessage::PeerJoined { peer_id } => Some(RelayEvent::PeerJoined { peer_id }),
            RelayMessage::Offer { from, payload } => Some(RelayEvent::Offer {
                from,
                description: payload,
            }),
            RelayMessage::Answer { from, payload } => Some(RelayEvent::Answer {
                from,
                description: payload,
            }),
            RelayMessage::IceCandidate { from, payload } => Some(RelayEvent::IceCandidate {
                from,
                candidate: payload,
            }),
            RelayMessage::Error { message } => Some(RelayEvent::Error { message }),
            RelayMessage::Pong => None,
            RelayMessage::Unknown => {
                warn!("Unknown relay message type");
                None
            }
        }
    }
}

/// Cloneable sending half of a relay connection
#[derive(Debug, Clone)]
pub struct RelayHandle {
    room_id: RoomId,
    peer_id: PeerId,
    tx: mpsc::Sender<ClientMessage>,
    connected: Arc<AtomicBool>,
}

impl RelayHandle {
    /// A handle whose messages land in the returned receiver instead of a
    /// socket. Used for in-process relays.
    pub fn detached(
        room_id: RoomId,
        peer_id: PeerId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ClientMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            room_id,
            peer_id,
            tx,
            connected: Arc::new(AtomicBool::new(true)),
        };
        (handle, rx)
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, message: ClientMessage) -> RelayResult<()> {
        if !self.is_connected() {
            warn!("Relay not connected, dropping outgoing message");
            return Err(RelayError::NotConnected);
        }
        self.tx.send(message).await.map_err(|_| RelayError::Channel)
    }

    /// Announce ourselves in the room
    pub async fn join(&self) -> RelayResult<()> {
        self.send(ClientMessage::Join {
            room_id: self.room_id.clone(),
            peer_id: self.peer_id.clone(),
        })
        .await
    }

    pub async fn send_offer(&self, offer: SessionDescription) -> RelayResult<()> {
        self.send(ClientMessage::Offer {
            room_id: self.room_id.clone(),
            peer_id: self.peer_id.clone(),
            payload: offer,
        })
        .await
    }

    pub async fn send_answer(&self, answer: SessionDescription) -> RelayResult<()> {
        self.send(ClientMessage::Answer {
            room_id: self.room_id.clone(),
            peer_id: self.peer_id.clone(),
            payload: answer,
        })
        .await
    }

    pub async fn send_ice_candidate(&self, candidate: IceCandidate) -> RelayResult<()> {
        self.send(ClientMessage::IceCandidate {
            room_id: self.room_id.clone(),
            peer_id: self.peer_id.clone(),
            payload: candidate,
        })
        .await
    }
}

/// Relay client
pub struct RelayClient {
    config: RelayConfig,
    connected: Arc<AtomicBool>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl RelayClient {
    /// Create a new relay client
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            connected: Arc::new(AtomicBool::new(false)),
            shutdown: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connect to the relay and join the configured room.
    ///
    /// Returns the sending handle and the ordered stream of relay events.
    pub async fn connect(&self) -> RelayResult<(RelayHandle, mpsc::Receiver<RelayEvent>)> {
        info!("Connecting to relay: {}", self.config.url);

        let (ws_stream, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| RelayError::Connection(e.to_string()))?;

        info!("WebSocket connected");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        // Application -> relay
        let (send_tx, mut send_rx) = mpsc::channel::<ClientMessage>(self.config.channel_capacity);
        // Relay -> application
        let (recv_tx, recv_rx) = mpsc::channel::<RelayEvent>(self.config.channel_capacity);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        *self.shutdown.lock() = Some(shutdown_tx);

        self.connected.store(true, Ordering::SeqCst);

        let handle = RelayHandle {
            room_id: self.config.room_id.clone(),
            peer_id: self.config.peer_id.clone(),
            tx: send_tx,
            connected: self.connected.clone(),
        };

        // Join before anything else can be queued
        handle.join().await?;

        let connected = self.connected.clone();
        let period = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut heartbeat = interval_at(Instant::now() + period, period);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!("Relay shutdown requested");
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }

                    // Outgoing: application -> relay
                    Some(msg) = send_rx.recv() => {
                        let json = match msg.to_json() {
                            Ok(j) => j,
                            Err(e) => {
                                error!("Failed to serialize outgoing message: {}", e);
                                continue;
                            }
                        };

                        if let Err(e) = ws_tx.send(Message::Text(json.into())).await {
                            error!("Failed to send WebSocket message: {}", e);
                            break;
                        }
                    }

                    _ = heartbeat.tick() => {
                        let json = match ClientMessage::Ping.to_json() {
                            Ok(j) => j,
                            Err(e) => {
                                error!("Failed to serialize heartbeat: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = ws_tx.send(Message::Text(json.into())).await {
                            error!("Failed to send heartbeat: {}", e);
                            break;
                        }
                    }

                    // Incoming: relay -> application
                    msg = ws_rx.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match RelayMessage::from_json(&text) {
                                    Ok(parsed) => {
                                        let Some(event) = RelayEvent::from_message(parsed) else {
                                            continue;
                                        };
                                        if let Err(e) = recv_tx.send(event).await {
                                            warn!("Failed to forward incoming message: {}", e);
                                            break;
                                        }
                                    }
                                    Err(e) => warn!("Failed to parse incoming message: {}", e),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                info!("Relay closed connection");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!("WebSocket receive error: {}", e);
                                break;
                            }
                        }
                    }
                }
            }

            connected.store(false, Ordering::SeqCst);
            let _ = recv_tx.send(RelayEvent::Disconnected).await;
            info!("Relay loop ended");
        });

        Ok((handle, recv_rx))
    }

    /// Close the control channel
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use super::*;

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    async fn relay_server() -> (String, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (format!("ws://{}", addr), listener)
    }

    #[tokio::test]
    async fn test_join_and_receive_events() {
        let (url, listener) = relay_server().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            let join = next_json(&mut ws).await;
            assert_eq!(
                join,
                json!({"type": "join", "roomId": "room-test", "peerId": "peer-a"})
            );

            ws.send(Message::Text(
                r#"{"type":"joined","roomId":"room-test"}"#.into(),
            ))
            .await
            .unwrap();
            ws.send(Message::Text(r#"{"type":"pong"}"#.into()))
                .await
                .unwrap();
            ws.send(Message::Text(
                r#"{"type":"peer-joined","peerId":"peer-b"}"#.into(),
            ))
            .await
            .unwrap();

            let offer = next_json(&mut ws).await;
            assert_eq!(offer["type"], "offer");
            assert_eq!(offer["peerId"], "peer-a");
            assert_eq!(offer["payload"]["sdp"], "v=0");

            ws.close(None).await.unwrap();
        });

        let client = RelayClient::new(RelayConfig::new(
            url,
            RoomId::from("room-test"),
            PeerId::from("peer-a"),
        ));
        let (handle, mut events) = client.connect().await.unwrap();
        assert!(client.is_connected());

        assert_eq!(
            events.recv().await.unwrap(),
            RelayEvent::Joined {
                room_id: RoomId::from("room-test")
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            RelayEvent::PeerJoined {
                peer_id: PeerId::from("peer-b")
            }
        );

        handle
            .send_offer(SessionDescription::offer("v=0"))
            .await
            .unwrap();

        assert_eq!(events.recv().await.unwrap(), RelayEvent::Disconnected);
        assert!(!client.is_connected());
        assert!(matches!(
            handle.send_answer(SessionDescription::answer("v=0")).await,
            Err(RelayError::NotConnected)
        ));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat() {
        let (url, listener) = relay_server().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            assert_eq!(next_json(&mut ws).await["type"], "join");
            assert_eq!(next_json(&mut ws).await, json!({"type": "ping"}));
            assert_eq!(next_json(&mut ws).await, json!({"type": "ping"}));
        });

        let mut config = RelayConfig::new(url, RoomId::from("room-hb"), PeerId::from("peer-a"));
        config.heartbeat_interval = Duration::from_millis(20);
        let client = RelayClient::new(config);
        let (_handle, _events) = client.connect().await.unwrap();

        server.await.unwrap();
        client.disconnect();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_detached_handle() {
        let (handle, mut rx) = RelayHandle::detached(
            RoomId::from("room-x"),
            PeerId::from("peer-x"),
            8,
        );
        handle
            .send_ice_candidate(IceCandidate::new("candidate:0"))
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            ClientMessage::IceCandidate {
                room_id: RoomId::from("room-x"),
                peer_id: PeerId::from("peer-x"),
                payload: IceCandidate::new("candidate:0"),
            }
        );
    }

    #[test]
    fn test_event_mapping() {
        assert_eq!(RelayEvent::from_message(RelayMessage::Pong), None);
        assert_eq!(RelayEvent::from_message(RelayMessage::Unknown), None);
        assert_eq!(
            RelayEvent::from_message(RelayMessage::Error {
                message: "room full".into()
            }),
            Some(RelayEvent::Error {
                message: "room full".into()
            })
        );
    }
}
