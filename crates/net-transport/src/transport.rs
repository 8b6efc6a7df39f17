//! Transport abstraction driven by the secure session

use async_trait::async_trait;
use bytes::Bytes;
use shared_protocol::{IceCandidate, SessionDescription};

use crate::TransportResult;

/// Something the transport reports back to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A local candidate that must be forwarded to the peer
    LocalCandidate(IceCandidate),
    /// The messaging channel is open and `send` may be used
    ChannelOpen,
    /// One frame received on the messaging channel
    Message(Bytes),
    /// The channel closed, locally or remotely
    ChannelClosed,
    /// Negotiation or the connection failed irrecoverably
    Failed(String),
}

/// Peer-to-peer messaging channel negotiated through the relay.
///
/// The initiator calls [`Transport::create_offer`] and later
/// [`Transport::accept_answer`]; the responder calls
/// [`Transport::accept_offer`]. Both sides feed remote candidates through
/// [`Transport::add_candidate`]. Progress is reported as
/// [`TransportEvent`]s on the receiver handed out at construction.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start negotiation and produce the local offer
    async fn create_offer(&self) -> TransportResult<SessionDescription>;

    /// Apply a remote offer and produce the local answer
    async fn accept_offer(&self, offer: &SessionDescription)
    -> TransportResult<SessionDescription>;

    /// Apply the remote answer to a previously created offer
    async fn accept_answer(&self, answer: &SessionDescription) -> TransportResult<()>;

    /// Apply one remote candidate
    async fn add_candidate(&self, candidate: &IceCandidate) -> TransportResult<()>;

    /// Send one frame over the open channel
    async fn send(&self, data: Bytes) -> TransportResult<()>;

    /// Tear the channel down. Idempotent.
    async fn close(&self);
}
