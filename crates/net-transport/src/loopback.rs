//! In-process transport connecting peers that share a [`LoopbackNetwork`]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use shared_protocol::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    EVENT_CHANNEL_CAPACITY, Transport, TransportError, TransportEvent, TransportResult,
};

const SDP_PREFIX: &str = "loopback:";

/// Registry of loopback endpoints, keyed by endpoint id
#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    endpoints: DashMap<String, mpsc::Sender<TransportEvent>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of registered endpoints
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    fn lookup(&self, id: &str) -> Option<mpsc::Sender<TransportEvent>> {
        self.endpoints.get(id).map(|tx| tx.value().clone())
    }
}

#[derive(Debug, Default)]
struct LoopbackState {
    remote: Option<String>,
    open: bool,
    closed: bool,
}

/// One side of an in-process channel
pub struct LoopbackTransport {
    id: String,
    network: Arc<LoopbackNetwork>,
    events: mpsc::Sender<TransportEvent>,
    state: Mutex<LoopbackState>,
}

impl LoopbackTransport {
    /// Create a transport attached to `network`
    pub fn new(network: Arc<LoopbackNetwork>) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Self {
            id: Uuid::new_v4().simple().to_string(),
            network,
            events,
            state: Mutex::new(LoopbackState::default()),
        };
        (transport, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn register(&self) -> TransportResult<()> {
        if self.state.lock().closed {
            return Err(TransportError::ConnectionClosed("transport closed".to_string()));
        }
        self.network
            .endpoints
            .insert(self.id.clone(), self.events.clone());
        Ok(())
    }

    fn parse_remote(description: &SessionDescription) -> TransportResult<String> {
        description
            .sdp
            .strip_prefix(SDP_PREFIX)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                TransportError::NegotiationFailed(format!(
                    "not a loopback description: {:?}",
                    description.sdp
                ))
            })
    }

    async fn emit(&self, event: TransportEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Loopback event receiver dropped");
        }
    }

    async fn announce_candidate(&self) {
        self.emit(TransportEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:loopback {}", self.id),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }))
        .await;
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn create_offer(&self) -> TransportResult<SessionDescription> {
        self.register()?;
        self.announce_candidate().await;
        Ok(SessionDescription::offer(format!("{}{}", SDP_PREFIX, self.id)))
    }

    async fn accept_offer(
        &self,
        offer: &SessionDescription,
    ) -> TransportResult<SessionDescription> {
        let remote = Self::parse_remote(offer)?;
        if self.network.lookup(&remote).is_none() {
            return Err(TransportError::NegotiationFailed(format!(
                "unknown loopback endpoint {}",
                remote
            )));
        }

        self.register()?;
        self.state.lock().remote = Some(remote);
        self.announce_candidate().await;

        Ok(SessionDescription::answer(format!("{}{}", SDP_PREFIX, self.id)))
    }

    async fn accept_answer(&self, answer: &SessionDescription) -> TransportResult<()> {
        let remote = Self::parse_remote(answer)?;
        let Some(remote_tx) = self.network.lookup(&remote) else {
            return Err(TransportError::NegotiationFailed(format!(
                "unknown loopback endpoint {}",
                remote
            )));
        };

        {
            let mut state = self.state.lock();
            state.remote = Some(remote.clone());
            state.open = true;
        }

        info!("Loopback channel {} <-> {} open", self.id, remote);

        // The answering side counts as open from here as well
        if remote_tx.send(TransportEvent::ChannelOpen).await.is_err() {
            warn!("Loopback peer {} went away before open", remote);
        }
        self.emit(TransportEvent::ChannelOpen).await;
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> TransportResult<()> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(TransportError::InvalidCandidate(candidate.candidate.clone()));
        }
        debug!("Loopback ignoring candidate {}", candidate.candidate);
        Ok(())
    }

    async fn send(&self, data: Bytes) -> TransportResult<()> {
        let remote = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(TransportError::NotConnected);
            }
            // The answering side learns it is open from the peer's event
            state.open = true;
            state.remote.clone()
        };

        let remote = remote.ok_or(TransportError::NotConnected)?;
        let tx = self
            .network
            .lookup(&remote)
            .ok_or(TransportError::NotConnected)?;

        tx.send(TransportEvent::Message(data))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&self) {
        let remote = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.open = false;
            state.remote.take()
        };

        self.network.endpoints.remove(&self.id);

        if let Some(tx) = remote.and_then(|id| self.network.lookup(&id)) {
            let _ = tx.send(TransportEvent::ChannelClosed).await;
        }
        debug!("Loopback transport {} closed", self.id);
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.network.endpoints.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn negotiate(
        network: &Arc<LoopbackNetwork>,
    ) -> (
        LoopbackTransport,
        mpsc::Receiver<TransportEvent>,
        LoopbackTransport,
        mpsc::Receiver<TransportEvent>,
    ) {
        let (a, mut a_rx) = LoopbackTransport::new(network.clone());
        let (b, mut b_rx) = LoopbackTransport::new(network.clone());

        let offer = a.create_offer().await.unwrap();
        assert!(matches!(
            a_rx.recv().await.unwrap(),
            TransportEvent::LocalCandidate(_)
        ));

        let answer = b.accept_offer(&offer).await.unwrap();
        assert!(matches!(
            b_rx.recv().await.unwrap(),
            TransportEvent::LocalCandidate(_)
        ));

        a.accept_answer(&answer).await.unwrap();
        assert_eq!(a_rx.recv().await.unwrap(), TransportEvent::ChannelOpen);
        assert_eq!(b_rx.recv().await.unwrap(), TransportEvent::ChannelOpen);

        (a, a_rx, b, b_rx)
    }

    #[tokio::test]
    async fn test_negotiate_and_exchange() {
        let network = LoopbackNetwork::new();
        let (a, mut a_rx, b, mut b_rx) = negotiate(&network).await;
        assert!(a.is_open());

        a.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(
            b_rx.recv().await.unwrap(),
            TransportEvent::Message(Bytes::from_static(b"ping"))
        );

        b.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(
            a_rx.recv().await.unwrap(),
            TransportEvent::Message(Bytes::from_static(b"pong"))
        );
    }

    #[tokio::test]
    async fn test_unknown_offer_fails() {
        let network = LoopbackNetwork::new();
        let (b, _b_rx) = LoopbackTransport::new(network.clone());

        let bogus = SessionDescription::offer("loopback:nobody");
        assert!(matches!(
            b.accept_offer(&bogus).await,
            Err(TransportError::NegotiationFailed(_))
        ));

        let garbage = SessionDescription::offer("v=0");
        assert!(matches!(
            b.accept_offer(&garbage).await,
            Err(TransportError::NegotiationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_send_before_negotiation() {
        let network = LoopbackNetwork::new();
        let (a, _rx) = LoopbackTransport::new(network);
        assert!(matches!(
            a.send(Bytes::from_static(b"x")).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_close_notifies_peer() {
        let network = LoopbackNetwork::new();
        let (a, _a_rx, b, mut b_rx) = negotiate(&network).await;

        a.close().await;
        a.close().await;
        assert_eq!(b_rx.recv().await.unwrap(), TransportEvent::ChannelClosed);
        assert!(matches!(
            a.send(Bytes::from_static(b"x")).await,
            Err(TransportError::NotConnected)
        ));

        drop(b);
        assert_eq!(network.endpoint_count(), 0);
    }
}
