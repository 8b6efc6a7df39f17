//! Messaging-channel packets

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, ProtocolResult};

/// Maximum size of a serialized frame accepted from the transport.
///
/// A full-size image grows by a third through base64 twice over
/// (data URI, then frame payload), plus envelope overhead.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Encrypted unit carried over the peer-to-peer channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedFrame {
    /// base64(nonce || ciphertext || tag)
    pub payload: String,
    /// Sender clock, epoch milliseconds
    pub timestamp: u64,
}

impl EncryptedFrame {
    pub fn new(payload: String) -> Self {
        Self {
            payload,
            timestamp: now_millis(),
        }
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from wire bytes
    pub fn from_bytes(data: &[u8]) -> ProtocolResult<Self> {
        if data.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: data.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(serde_json::from_slice(data)?)
    }
}

/// Decrypted plaintext envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChatEnvelope {
    Text { text: String },
    Image { image: String },
}

impl ChatEnvelope {
    pub fn to_bytes(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Interpret decrypted plaintext. Anything that is not a recognised
    /// envelope is a plain text message.
    pub fn from_plaintext(plaintext: &[u8]) -> Self {
        match serde_json::from_slice::<ChatEnvelope>(plaintext) {
            Ok(envelope) => envelope,
            Err(_) => ChatEnvelope::Text {
                text: String::from_utf8_lossy(plaintext).into_owned(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_shape() {
        let frame = EncryptedFrame {
            payload: "AAAA".to_string(),
            timestamp: 1700000000000,
        };
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(
            String::from_utf8(bytes.clone()).unwrap(),
            r#"{"payload":"AAAA","timestamp":1700000000000}"#
        );
        assert_eq!(EncryptedFrame::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_frame_rejects_garbage() {
        assert!(matches!(
            EncryptedFrame::from_bytes(b"not json"),
            Err(ProtocolError::Serialization(_))
        ));
    }

    #[test]
    fn test_envelope_variants() {
        let image = ChatEnvelope::Image {
            image: "data:image/png;base64,AAAA".to_string(),
        };
        let bytes = image.to_bytes().unwrap();
        assert_eq!(
            String::from_utf8(bytes.clone()).unwrap(),
            r#"{"type":"image","image":"data:image/png;base64,AAAA"}"#
        );
        assert_eq!(ChatEnvelope::from_plaintext(&bytes), image);

        assert_eq!(
            ChatEnvelope::from_plaintext(b"just words"),
            ChatEnvelope::Text {
                text: "just words".to_string()
            }
        );
    }
}
