//! Session identifiers and the handshake state machine types

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{ProtocolError, ProtocolResult};

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Peer identifier announced to the relay
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a random `peer-xxxxxxxxx` identifier
    pub fn generate() -> Self {
        Self(format!("peer-{}", random_suffix(9)))
    }

    /// Shortened form for status lines
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Relay room identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(pub String);

impl RoomId {
    /// Generate a random `room-xxxxxxxxxxxx` identifier
    pub fn generate() -> Self {
        Self(format!("room-{}", random_suffix(12)))
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Handshake role, fixed once chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Saw the other peer join and sent the offer
    Initiator,
    /// Received the offer first
    Responder,
}

/// Handshake phase of a secure session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakePhase {
    /// No remote activity handled yet
    Idle,
    /// Transport negotiation in progress
    Negotiating(Role),
    /// Peer key imported and shared key derived
    KeyBound,
    /// Encrypted channel usable
    ChannelOpen,
    /// Terminal state
    Closed,
}

impl HandshakePhase {
    /// Whether `next` is a legal successor of this phase
    pub fn can_transition_to(self, next: HandshakePhase) -> bool {
        use HandshakePhase::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Negotiating(_)) => true,
            (Negotiating(_), KeyBound) => true,
            (KeyBound, ChannelOpen) => true,
            _ => false,
        }
    }

    /// Validate and return the next phase
    pub fn transition(self, next: HandshakePhase) -> ProtocolResult<HandshakePhase> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ProtocolError::InvalidStateTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_closed(self) -> bool {
        matches!(self, HandshakePhase::Closed)
    }

    pub fn is_open(self) -> bool {
        matches!(self, HandshakePhase::ChannelOpen)
    }
}

impl std::fmt::Display for HandshakePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakePhase::Idle => f.write_str("idle"),
            HandshakePhase::Negotiating(Role::Initiator) => f.write_str("negotiating (initiator)"),
            HandshakePhase::Negotiating(Role::Responder) => f.write_str("negotiating (responder)"),
            HandshakePhase::KeyBound => f.write_str("key bound"),
            HandshakePhase::ChannelOpen => f.write_str("channel open"),
            HandshakePhase::Closed => f.write_str("closed"),
        }
    }
}

/// Relay-level signal relevant to role selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeSignal {
    PeerJoined,
    OfferReceived,
    AnswerReceived,
    CandidateReceived,
}

/// Decide the local role from the ordered log of handshake signals.
///
/// The first `PeerJoined` or `OfferReceived` wins; answers and candidates
/// never elect a role. Returns `None` while undecided.
pub fn resolve_role(log: &[HandshakeSignal]) -> Option<Role> {
    log.iter().find_map(|signal| match signal {
        HandshakeSignal::PeerJoined => Some(Role::Initiator),
        HandshakeSignal::OfferReceived => Some(Role::Responder),
        HandshakeSignal::AnswerReceived | HandshakeSignal::CandidateReceived => None,
    })
}
