//! Session management - handshake and encrypted messaging
//!
//! All state sits behind one `parking_lot::Mutex` that is never held
//! across an `.await`. Encryption and decryption run under that lock, so
//! `panic()` drops the shared key before any later frame can use it.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use crypto_session::{Fingerprint, Identity, RemotePublicKey, SharedKey};
use net_transport::{Transport, TransportEvent};
use parking_lot::Mutex;
use relay_client::{RelayEvent, RelayHandle};
use shared_protocol::{
    ChatEnvelope, EncryptedFrame, HandshakePhase, HandshakeSignal, IceCandidate, PeerId, Role,
    SessionDescription, resolve_role,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{OutgoingMessage, SessionConfig, SessionError, SessionEvent, SessionResult};

/// Mutable session state
struct SessionState {
    phase: HandshakePhase,
    /// Ordered relay signals, input to role resolution
    signals: Vec<HandshakeSignal>,
    remote_peer: Option<PeerId>,
    remote_key: Option<RemotePublicKey>,
    shared_key: Option<SharedKey>,
    /// Local candidates produced by the transport
    pending_candidates: Vec<IceCandidate>,
    /// Transport reported ready before the key was bound
    channel_ready_pending: bool,
    /// Frames that arrived before `ChannelOpen`
    early_frames: VecDeque<Bytes>,
    /// Frames sealed under keys this session has held
    frames_sealed: u64,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: HandshakePhase::Idle,
            signals: Vec::new(),
            remote_peer: None,
            remote_key: None,
            shared_key: None,
            pending_candidates: Vec::new(),
            channel_ready_pending: false,
            early_frames: VecDeque::new(),
            frames_sealed: 0,
        }
    }

    /// Move to `next`, or report why not
    fn advance(&mut self, next: HandshakePhase) -> bool {
        match self.phase.transition(next) {
            Ok(phase) => {
                debug!("Session phase {} -> {}", self.phase, phase);
                self.phase = phase;
                true
            }
            Err(e) => {
                warn!("Rejected phase change: {}", e);
                false
            }
        }
    }

    /// Drop every secret and buffered item
    fn wipe(&mut self) {
        if let Some(key) = self.shared_key.take() {
            self.frames_sealed += key.frames_sealed();
        }
        self.remote_key = None;
        self.early_frames.clear();
        self.pending_candidates.clear();
        self.channel_ready_pending = false;
    }
}

/// Outcome of applying a peer's stamped description
struct KeyBinding {
    fingerprint: Fingerprint,
}

/// One end-to-end encrypted conversation with a single peer
pub struct SecureSession<T: Transport + ?Sized> {
    identity: Arc<Identity>,
    transport: Arc<T>,
    relay: RelayHandle,
    config: SessionConfig,
    events: mpsc::Sender<SessionEvent>,
    state: Mutex<SessionState>,
}

impl<T: Transport + ?Sized> SecureSession<T> {
    /// Create a new idle session
    pub fn new(
        identity: Arc<Identity>,
        transport: Arc<T>,
        relay: RelayHandle,
        config: SessionConfig,
    ) -> (Arc<Self>, mpsc::Receiver<SessionEvent>) {
        let (events, rx) = mpsc::channel(config.event_capacity);
        let session = Arc::new(Self {
            identity,
            transport,
            relay,
            config,
            events,
            state: Mutex::new(SessionState::new()),
        });
        (session, rx)
    }

    /// Get current handshake phase
    pub fn phase(&self) -> HandshakePhase {
        self.state.lock().phase
    }

    /// Role, once elected
    pub fn role(&self) -> Option<Role> {
        resolve_role(&self.state.lock().signals)
    }

    pub fn remote_peer(&self) -> Option<PeerId> {
        self.state.lock().remote_peer.clone()
    }

    /// Fingerprint of the bound peer key
    pub fn remote_fingerprint(&self) -> Option<Fingerprint> {
        self.state
            .lock()
            .remote_key
            .as_ref()
            .map(RemotePublicKey::fingerprint)
    }

    /// Identifier of the shared key, for comparing both ends
    pub fn key_id(&self) -> Option<String> {
        self.state.lock().shared_key.as_ref().map(SharedKey::key_id)
    }

    /// Number of frames encrypted by this session
    pub fn frames_sealed(&self) -> u64 {
        let state = self.state.lock();
        state.frames_sealed
            + state
                .shared_key
                .as_ref()
                .map(SharedKey::frames_sealed)
                .unwrap_or(0)
    }

    /// Local candidates the transport produced so far
    pub fn local_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().pending_candidates.clone()
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Session event receiver dropped");
        }
    }

    async fn status(&self, message: impl Into<String>) {
        self.emit(SessionEvent::Status(message.into())).await;
    }

    /// Drive the session from relay and transport events until it closes.
    ///
    /// The handshake must reach `ChannelOpen` within
    /// [`SessionConfig::handshake_timeout`].
    pub async fn run(
        self: Arc<Self>,
        mut relay_rx: mpsc::Receiver<RelayEvent>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
    ) {
        let deadline = tokio::time::sleep(self.config.handshake_timeout);
        tokio::pin!(deadline);

        loop {
            let phase = self.phase();
            if phase.is_closed() {
                break;
            }

            tokio::select! {
                Some(event) = relay_rx.recv() => self.handle_relay_event(event).await,
                Some(event) = transport_rx.recv() => self.handle_transport_event(event).await,
                _ = &mut deadline, if !phase.is_open() => {
                    warn!("Handshake did not complete within {:?}", self.config.handshake_timeout);
                    self.fail(SessionError::HandshakeTimeout).await;
                }
                else => break,
            }
        }

        debug!("Session loop ended");
    }

    /// Apply one relay event
    pub async fn handle_relay_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::Joined { room_id } => {
                self.status(format!("Joined room {}", room_id)).await;
            }
            RelayEvent::PeerJoined { peer_id } => self.on_peer_joined(peer_id).await,
            RelayEvent::Offer { from, description } => self.on_offer(from, description).await,
            RelayEvent::Answer { from, description } => self.on_answer(from, description).await,
            RelayEvent::IceCandidate { candidate, .. } => self.on_remote_candidate(candidate).await,
            RelayEvent::Error { message } => {
                warn!("Relay reported: {}", message);
                self.status(format!("Relay error: {}", message)).await;
            }
            RelayEvent::Disconnected => {
                // A pending dial may still open the channel without the
                // relay; the handshake deadline covers real stalls
                let phase = self.phase();
                if phase.is_closed() {
                    return;
                }
                info!("Relay disconnected in phase {}", phase);
                self.status("Relay disconnected").await;
            }
        }
    }

    /// Apply one transport event
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                {
                    let mut state = self.state.lock();
                    if state.phase.is_closed() {
                        return;
                    }
                    state.pending_candidates.push(candidate.clone());
                }
                if let Err(e) = self.relay.send_ice_candidate(candidate).await {
                    warn!("Failed to forward local candidate: {}", e);
                }
            }
            TransportEvent::ChannelOpen => self.on_channel_ready().await,
            TransportEvent::Message(data) => self.on_frame(data).await,
            TransportEvent::ChannelClosed => {
                if !self.phase().is_closed() {
                    self.close("channel closed by peer").await;
                }
            }
            TransportEvent::Failed(reason) => {
                self.fail(SessionError::TransportNegotiationFailed(reason))
                    .await;
            }
        }
    }

    /// Record a signal and leave `Idle`, unless this is a duplicate
    fn begin(&self, signal: HandshakeSignal, peer: &PeerId) -> Option<Role> {
        let mut state = self.state.lock();
        if state.phase != HandshakePhase::Idle {
            warn!(
                "Ignoring {:?} from {} in phase {}",
                signal, peer, state.phase
            );
            return None;
        }

        state.signals.push(signal);
        let role = resolve_role(&state.signals)?;
        if !state.advance(HandshakePhase::Negotiating(role)) {
            return None;
        }
        state.remote_peer = Some(peer.clone());
        Some(role)
    }

    async fn on_peer_joined(&self, peer_id: PeerId) {
        let Some(role) = self.begin(HandshakeSignal::PeerJoined, &peer_id) else {
            self.status(format!("Unexpected peer {} ignored", peer_id.short()))
                .await;
            return;
        };
        self.emit(SessionEvent::PhaseChanged(HandshakePhase::Negotiating(role)))
            .await;
        self.status(format!("Peer {} joined, sending offer", peer_id.short()))
            .await;

        let offer = match self.transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                self.fail(SessionError::TransportNegotiationFailed(e.to_string()))
                    .await;
                return;
            }
        };

        let offer = match self.stamp(offer) {
            Ok(offer) => offer,
            Err(e) => return self.fail(e).await,
        };

        if self.phase().is_closed() {
            return;
        }
        if let Err(e) = self.relay.send_offer(offer).await {
            self.fail(SessionError::Relay(e.to_string())).await;
        }
    }

    async fn on_offer(&self, from: PeerId, description: SessionDescription) {
        let Some(role) = self.begin(HandshakeSignal::OfferReceived, &from) else {
            self.status(format!("Unexpected offer from {} ignored", from.short()))
                .await;
            return;
        };
        self.emit(SessionEvent::PhaseChanged(HandshakePhase::Negotiating(role)))
            .await;

        // Identity is bound before the transport sees the offer
        let binding = match self.bind_peer_key(&description) {
            Ok(binding) => binding,
            Err(e) => return self.fail(e).await,
        };
        self.announce_binding(&from, &binding).await;

        let answer = match self.transport.accept_offer(&description).await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail(SessionError::TransportNegotiationFailed(e.to_string()))
                    .await;
                return;
            }
        };

        let answer = match self.stamp(answer) {
            Ok(answer) => answer,
            Err(e) => return self.fail(e).await,
        };

        if self.phase().is_closed() {
            return;
        }
        if let Err(e) = self.relay.send_answer(answer).await {
            self.fail(SessionError::Relay(e.to_string())).await;
            return;
        }

        self.promote_pending_channel().await;
    }

    async fn on_answer(&self, from: PeerId, description: SessionDescription) {
        let expected = {
            let mut state = self.state.lock();
            state.signals.push(HandshakeSignal::AnswerReceived);
            if state.phase != HandshakePhase::Negotiating(Role::Initiator) {
                warn!("Ignoring answer from {} in phase {}", from, state.phase);
                false
            } else {
                true
            }
        };
        if !expected {
            self.status(format!("Unexpected answer from {} ignored", from.short()))
                .await;
            return;
        }

        let binding = match self.bind_peer_key(&description) {
            Ok(binding) => binding,
            Err(e) => return self.fail(e).await,
        };
        self.announce_binding(&from, &binding).await;

        if let Err(e) = self.transport.accept_answer(&description).await {
            self.fail(SessionError::TransportNegotiationFailed(e.to_string()))
                .await;
            return;
        }

        self.promote_pending_channel().await;
    }

    async fn on_remote_candidate(&self, candidate: IceCandidate) {
        {
            let mut state = self.state.lock();
            if state.phase.is_closed() {
                return;
            }
            state.signals.push(HandshakeSignal::CandidateReceived);
        }

        if let Err(e) = self.transport.add_candidate(&candidate).await {
            warn!("Failed to add remote candidate: {}", e);
        }
    }

    /// Attach our public key to an outgoing description
    fn stamp(&self, description: SessionDescription) -> SessionResult<SessionDescription> {
        description
            .stamped(&self.identity.export_public_key())
            .map_err(|e| SessionError::InvalidKeyEncoding(e.to_string()))
    }

    /// Import the peer key from a description, derive the shared key and
    /// move to `KeyBound`, all under one lock.
    fn bind_peer_key(&self, description: &SessionDescription) -> SessionResult<KeyBinding> {
        let value = description
            .pub_key
            .as_ref()
            .ok_or(SessionError::MissingPeerKey)?;
        let remote = RemotePublicKey::import(value)?;

        let mut state = self.state.lock();
        if !matches!(state.phase, HandshakePhase::Negotiating(_)) {
            return Err(SessionError::Closed);
        }

        let shared = self.identity.derive_shared_key(&remote)?;
        let fingerprint = remote.fingerprint();

        state.shared_key = Some(shared);
        state.remote_key = Some(remote);
        if !state.advance(HandshakePhase::KeyBound) {
            state.wipe();
            return Err(SessionError::Closed);
        }

        Ok(KeyBinding { fingerprint })
    }

    async fn announce_binding(&self, peer: &PeerId, binding: &KeyBinding) {
        info!("Shared key bound with {} ({})", peer, binding.fingerprint);
        self.emit(SessionEvent::PhaseChanged(HandshakePhase::KeyBound))
            .await;
        self.status(format!(
            "Key exchanged with {}, fingerprint {}",
            peer.short(),
            binding.fingerprint
        ))
        .await;
    }

    async fn on_channel_ready(&self) {
        let early = {
            let mut state = self.state.lock();
            match state.phase {
                HandshakePhase::KeyBound => {
                    if !state.advance(HandshakePhase::ChannelOpen) {
                        return;
                    }
                    state.channel_ready_pending = false;
                    std::mem::take(&mut state.early_frames)
                }
                HandshakePhase::Idle | HandshakePhase::Negotiating(_) => {
                    debug!("Channel ready before key binding, deferring");
                    state.channel_ready_pending = true;
                    return;
                }
                HandshakePhase::ChannelOpen | HandshakePhase::Closed => return,
            }
        };

        info!("Secure channel open");
        self.emit(SessionEvent::PhaseChanged(HandshakePhase::ChannelOpen))
            .await;
        self.status("Secure channel open").await;

        for frame in early {
            self.on_frame(frame).await;
        }
    }

    async fn promote_pending_channel(&self) {
        let pending = {
            let state = self.state.lock();
            state.channel_ready_pending && state.phase == HandshakePhase::KeyBound
        };
        if pending {
            self.on_channel_ready().await;
        }
    }

    /// Encrypt and send one message over the open channel
    pub async fn send(&self, message: OutgoingMessage) -> SessionResult<EncryptedFrame> {
        message.validate()?;
        let plaintext = message
            .into_envelope()
            .to_bytes()
            .map_err(|e| SessionError::InvalidPayload(e.to_string()))?;

        let payload = {
            let mut state = self.state.lock();
            match state.phase {
                HandshakePhase::ChannelOpen => {}
                HandshakePhase::Closed => return Err(SessionError::Closed),
                phase => return Err(SessionError::NotOpen(phase)),
            }
            let key = state.shared_key.as_mut().ok_or(SessionError::Closed)?;
            key.encrypt(&plaintext)?
        };

        let frame = EncryptedFrame::new(payload);
        let bytes = frame
            .to_bytes()
            .map_err(|e| SessionError::InvalidPayload(e.to_string()))?;

        self.transport
            .send(Bytes::from(bytes))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        Ok(frame)
    }

    /// Handle one frame received from the transport.
    ///
    /// Undecryptable frames are dropped with an error event; the channel
    /// stays open.
    pub async fn on_frame(&self, data: Bytes) {
        let opened = {
            let mut state = self.state.lock();
            match state.phase {
                HandshakePhase::ChannelOpen => {}
                HandshakePhase::Closed => return,
                _ => {
                    if state.early_frames.len() >= self.config.early_frame_capacity {
                        warn!("Early frame queue full, dropping oldest");
                        state.early_frames.pop_front();
                    }
                    state.early_frames.push_back(data);
                    return;
                }
            }

            let Some(key) = state.shared_key.as_ref() else {
                return;
            };
            open_frame(key, &data)
        };

        match opened {
            Ok((ChatEnvelope::Text { text }, timestamp)) => {
                self.emit(SessionEvent::Text { text, timestamp }).await;
            }
            Ok((ChatEnvelope::Image { image }, timestamp)) => {
                self.emit(SessionEvent::Image { image, timestamp }).await;
            }
            Err(e) => {
                warn!("Dropping frame: {}", e);
                self.emit(SessionEvent::Error(e)).await;
            }
        }
    }

    /// Report a fatal error and close
    async fn fail(&self, err: SessionError) {
        if self.phase().is_closed() {
            return;
        }
        error!("Session failed: {}", err);
        self.emit(SessionEvent::Error(err.clone())).await;
        self.close(&err.to_string()).await;
    }

    /// Close the session and its transport
    pub async fn close(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if state.phase.is_closed() {
                return;
            }
            state.advance(HandshakePhase::Closed);
            state.wipe();
        }

        self.transport.close().await;
        info!("Session closed: {}", reason);
        self.emit(SessionEvent::PhaseChanged(HandshakePhase::Closed))
            .await;
        self.emit(SessionEvent::Closed {
            reason: reason.to_string(),
        })
        .await;
    }

    /// Destroy key material immediately and tear the transport down.
    ///
    /// The key is gone when the lock is released; nothing sent or received
    /// afterwards can be encrypted or decrypted by this session.
    pub async fn panic(&self) {
        {
            let mut state = self.state.lock();
            state.phase = HandshakePhase::Closed;
            state.wipe();
            state.remote_peer = None;
            state.signals.clear();
        }
        warn!("Session panic: key material destroyed");

        self.transport.close().await;
        self.emit(SessionEvent::Closed {
            reason: "panic".to_string(),
        })
        .await;
    }
}

/// Parse, decrypt and unwrap one frame
fn open_frame(key: &SharedKey, data: &[u8]) -> SessionResult<(ChatEnvelope, u64)> {
    let frame = EncryptedFrame::from_bytes(data).map_err(|_| SessionError::DecryptionFailed)?;
    let plaintext = key.decrypt(&frame.payload)?;
    Ok((ChatEnvelope::from_plaintext(&plaintext), frame.timestamp))
}
