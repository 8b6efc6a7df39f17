//! Relay control-channel messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{PeerId, PortablePublicKey, ProtocolResult, RoomId};

/// Kind of transport session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Transport session description, optionally stamped with the sender's key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
    /// Sender's portable public key. Kept as raw JSON so that a malformed
    /// key reaches the importer instead of failing the whole message.
    #[serde(rename = "pubKey", default, skip_serializing_if = "Option::is_none")]
    pub pub_key: Option<Value>,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
            pub_key: None,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
            pub_key: None,
        }
    }

    /// Attach the local public key to this description
    pub fn stamped(mut self, key: &PortablePublicKey) -> ProtocolResult<Self> {
        self.pub_key = Some(serde_json::to_value(key)?);
        Ok(self)
    }
}

/// Transport negotiation hint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        }
    }
}

/// Client -> relay messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Join {
        room_id: RoomId,
        peer_id: PeerId,
    },
    Offer {
        room_id: RoomId,
        peer_id: PeerId,
        payload: SessionDescription,
    },
    Answer {
        room_id: RoomId,
        peer_id: PeerId,
        payload: SessionDescription,
    },
    IceCandidate {
        room_id: RoomId,
        peer_id: PeerId,
        payload: IceCandidate,
    },
    Ping,
}

/// Relay -> client messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum RelayMessage {
    Joined {
        room_id: RoomId,
    },
    PeerJoined {
        peer_id: PeerId,
    },
    Offer {
        from: PeerId,
        payload: SessionDescription,
    },
    Answer {
        from: PeerId,
        payload: SessionDescription,
    },
    IceCandidate {
        from: PeerId,
        payload: IceCandidate,
    },
    Error {
        message: String,
    },
    Pong,
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The relay's view of this message as delivered to the other peer.
    /// `None` for messages the relay does not forward.
    pub fn forwarded(self) -> Option<RelayMessage> {
        match self {
            ClientMessage::Offer {
                peer_id, payload, ..
            } => Some(RelayMessage::Offer {
                from: peer_id,
                payload,
            }),
            ClientMessage::Answer {
                peer_id, payload, ..
            } => Some(RelayMessage::Answer {
                from: peer_id,
                payload,
            }),
            ClientMessage::IceCandidate {
                peer_id, payload, ..
            } => Some(RelayMessage::IceCandidate {
                from: peer_id,
                payload,
            }),
            ClientMessage::Join { .. } | ClientMessage::Ping => None,
        }
    }
}

impl RelayMessage {
    pub fn from_json(text: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
