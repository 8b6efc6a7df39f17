//! Two sessions negotiating through an in-process relay and loopback transport

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use crypto_session::Identity;
use net_transport::{LoopbackNetwork, LoopbackTransport};
use relay_client::{RelayEvent, RelayHandle};
use secure_session::{OutgoingMessage, SecureSession, SessionConfig, SessionError, SessionEvent};
use shared_protocol::{ClientMessage, HandshakePhase, MAX_TEXT_CHARS, PeerId, RelayMessage, RoomId};
use tokio::sync::mpsc;
use tokio::time::timeout;

type Session = Arc<SecureSession<LoopbackTransport>>;

struct Peer {
    session: Session,
    events: mpsc::Receiver<SessionEvent>,
    relay_in: mpsc::Sender<RelayEvent>,
}

/// Forward one peer's outgoing relay messages to the other, as the relay
/// would. `rewrite` may alter each forwarded message.
fn route<F>(mut from: mpsc::Receiver<ClientMessage>, to: mpsc::Sender<RelayEvent>, rewrite: F)
where
    F: Fn(RelayMessage) -> RelayMessage + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = from.recv().await {
            let Some(forwarded) = message.forwarded() else {
                continue;
            };
            if let Some(event) = RelayEvent::from_message(rewrite(forwarded)) {
                if to.send(event).await.is_err() {
                    break;
                }
            }
        }
    });
}

fn peer(
    network: &Arc<LoopbackNetwork>,
    id: &str,
) -> (Peer, mpsc::Receiver<ClientMessage>) {
    let (transport, transport_rx) = LoopbackTransport::new(network.clone());
    let (relay, relay_out) = RelayHandle::detached(RoomId::from("room-e2e"), PeerId::from(id), 64);
    let (relay_in, relay_rx) = mpsc::channel(64);

    let identity = Arc::new(Identity::generate().unwrap());
    let (session, events) =
        SecureSession::new(identity, Arc::new(transport), relay, SessionConfig::default());
    tokio::spawn(session.clone().run(relay_rx, transport_rx));

    (
        Peer {
            session,
            events,
            relay_in,
        },
        relay_out,
    )
}

fn pair<F>(rewrite: F) -> (Peer, Peer)
where
    F: Fn(RelayMessage) -> RelayMessage + Send + Clone + 'static,
{
    let network = LoopbackNetwork::new();
    let (a, a_out) = peer(&network, "peer-initiator");
    let (b, b_out) = peer(&network, "peer-responder");
    route(a_out, b.relay_in.clone(), rewrite.clone());
    route(b_out, a.relay_in.clone(), rewrite);
    (a, b)
}

async fn wait_for<P>(events: &mut mpsc::Receiver<SessionEvent>, mut pred: P) -> Vec<SessionEvent>
where
    P: FnMut(&SessionEvent) -> bool,
{
    let mut seen = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("session event stream ended");
        let done = pred(&event);
        seen.push(event);
        if done {
            return seen;
        }
    }
}

async fn open_pair() -> (Peer, Peer) {
    let (mut a, mut b) = pair(|m| m);

    a.relay_in
        .send(RelayEvent::PeerJoined {
            peer_id: PeerId::from("peer-responder"),
        })
        .await
        .unwrap();

    let open = |e: &SessionEvent| *e == SessionEvent::PhaseChanged(HandshakePhase::ChannelOpen);
    wait_for(&mut a.events, open).await;
    wait_for(&mut b.events, open).await;
    (a, b)
}

#[tokio::test]
async fn test_end_to_end_hello() {
    let (a, mut b) = open_pair().await;

    assert_eq!(a.session.phase(), HandshakePhase::ChannelOpen);
    assert_eq!(b.session.phase(), HandshakePhase::ChannelOpen);
    assert!(a.session.key_id().is_some());
    assert_eq!(a.session.key_id(), b.session.key_id());

    a.session
        .send(OutgoingMessage::Text("hello".into()))
        .await
        .unwrap();

    let seen = wait_for(&mut b.events, |e| matches!(e, SessionEvent::Text { .. })).await;
    let Some(SessionEvent::Text { text, timestamp }) = seen.last() else {
        unreachable!();
    };
    assert_eq!(text, "hello");
    assert!(*timestamp > 0);

    // Exactly once
    assert!(timeout(Duration::from_millis(200), b.events.recv()).await.is_err());
}

#[tokio::test]
async fn test_images_and_replies() {
    let (mut a, mut b) = open_pair().await;

    let image = "data:image/png;base64,iVBORw0KGgo=".to_string();
    a.session
        .send(OutgoingMessage::Image(image.clone()))
        .await
        .unwrap();
    let seen = wait_for(&mut b.events, |e| matches!(e, SessionEvent::Image { .. })).await;
    assert!(matches!(seen.last(), Some(SessionEvent::Image { image: got, .. }) if *got == image));

    b.session
        .send(OutgoingMessage::Text("got it".into()))
        .await
        .unwrap();
    let seen = wait_for(&mut a.events, |e| matches!(e, SessionEvent::Text { .. })).await;
    assert!(matches!(seen.last(), Some(SessionEvent::Text { text, .. }) if text == "got it"));
}

#[tokio::test]
async fn test_oversized_text_rejected_before_encryption() {
    let (a, _b) = open_pair().await;
    let before = a.session.frames_sealed();

    let result = a
        .session
        .send(OutgoingMessage::Text("x".repeat(MAX_TEXT_CHARS + 1)))
        .await;

    assert_eq!(
        result,
        Err(SessionError::PayloadTooLarge {
            size: MAX_TEXT_CHARS + 1,
            max: MAX_TEXT_CHARS
        })
    );
    assert_eq!(a.session.frames_sealed(), before);
    assert_eq!(a.session.phase(), HandshakePhase::ChannelOpen);
}

#[tokio::test]
async fn test_forged_frame_dropped() {
    let (a, mut b) = open_pair().await;

    let mut frame = a
        .session
        .send(OutgoingMessage::Text("original".into()))
        .await
        .unwrap();
    wait_for(&mut b.events, |e| matches!(e, SessionEvent::Text { .. })).await;

    // Flip one base64 character of the ciphertext
    let mut chars: Vec<char> = frame.payload.chars().collect();
    let idx = chars.len() / 2;
    chars[idx] = if chars[idx] == 'A' { 'B' } else { 'A' };
    frame.payload = chars.into_iter().collect();
    b.session
        .on_frame(Bytes::from(frame.to_bytes().unwrap()))
        .await;
    b.session.on_frame(Bytes::from_static(b"not json")).await;

    for _ in 0..2 {
        let seen = wait_for(&mut b.events, |e| matches!(e, SessionEvent::Error(_))).await;
        assert_eq!(
            seen.last(),
            Some(&SessionEvent::Error(SessionError::DecryptionFailed))
        );
    }
    assert_eq!(b.session.phase(), HandshakePhase::ChannelOpen);

    a.session
        .send(OutgoingMessage::Text("still here".into()))
        .await
        .unwrap();
    let seen = wait_for(&mut b.events, |e| matches!(e, SessionEvent::Text { .. })).await;
    assert!(matches!(seen.last(), Some(SessionEvent::Text { text, .. }) if text == "still here"));
}

#[tokio::test]
async fn test_offer_without_key_never_binds() {
    let strip = |message: RelayMessage| match message {
        RelayMessage::Offer { from, mut payload } => {
            payload.pub_key = None;
            RelayMessage::Offer { from, payload }
        }
        other => other,
    };
    let (a, mut b) = pair(strip);

    a.relay_in
        .send(RelayEvent::PeerJoined {
            peer_id: PeerId::from("peer-responder"),
        })
        .await
        .unwrap();

    let seen = wait_for(&mut b.events, |e| matches!(e, SessionEvent::Closed { .. })).await;
    assert!(seen.contains(&SessionEvent::Error(SessionError::MissingPeerKey)));
    assert!(!seen.contains(&SessionEvent::PhaseChanged(HandshakePhase::KeyBound)));
    assert_eq!(b.session.phase(), HandshakePhase::Closed);
    assert!(b.session.key_id().is_none());
}

#[tokio::test]
async fn test_panic_closes_both_ends() {
    let (mut a, mut b) = open_pair().await;

    a.session.panic().await;
    assert_eq!(a.session.phase(), HandshakePhase::Closed);
    assert!(a.session.key_id().is_none());
    wait_for(&mut a.events, |e| matches!(e, SessionEvent::Closed { .. })).await;

    let seen = wait_for(&mut b.events, |e| matches!(e, SessionEvent::Closed { .. })).await;
    assert!(seen.contains(&SessionEvent::PhaseChanged(HandshakePhase::Closed)));
    assert!(b.session.key_id().is_none());

    assert_eq!(
        a.session
            .send(OutgoingMessage::Text("after".into()))
            .await,
        Err(SessionError::Closed)
    );
}
