//! Session configuration, outgoing messages and session events

use std::time::Duration;

use shared_protocol::{ChatEnvelope, HandshakePhase, MAX_IMAGE_BYTES, MAX_TEXT_CHARS};

use crate::{DEFAULT_HANDSHAKE_TIMEOUT_SECS, EARLY_FRAME_CAPACITY, SessionError, SessionResult};

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Time allowed to reach `ChannelOpen` after the session starts running
    pub handshake_timeout: Duration,
    /// Frames held while the channel is still opening
    pub early_frame_capacity: usize,
    /// Capacity of the session event queue
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(DEFAULT_HANDSHAKE_TIMEOUT_SECS),
            early_frame_capacity: EARLY_FRAME_CAPACITY,
            event_capacity: 256,
        }
    }
}

/// A message the user wants to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingMessage {
    Text(String),
    /// `data:` URI of an encoded image
    Image(String),
}

impl OutgoingMessage {
    /// Check size and shape. Runs before any crypto or network work.
    pub fn validate(&self) -> SessionResult<()> {
        match self {
            OutgoingMessage::Text(text) => {
                if text.is_empty() {
                    return Err(SessionError::InvalidPayload("empty text".to_string()));
                }
                let chars = text.chars().count();
                if chars > MAX_TEXT_CHARS {
                    return Err(SessionError::PayloadTooLarge {
                        size: chars,
                        max: MAX_TEXT_CHARS,
                    });
                }
            }
            OutgoingMessage::Image(uri) => {
                if uri.len() > MAX_IMAGE_BYTES {
                    return Err(SessionError::PayloadTooLarge {
                        size: uri.len(),
                        max: MAX_IMAGE_BYTES,
                    });
                }
                if !uri.starts_with("data:") {
                    return Err(SessionError::InvalidPayload(
                        "image is not a data URI".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn into_envelope(self) -> ChatEnvelope {
        match self {
            OutgoingMessage::Text(text) => ChatEnvelope::Text { text },
            OutgoingMessage::Image(image) => ChatEnvelope::Image { image },
        }
    }
}

/// Events delivered to the application, in order
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Short human-readable status line
    Status(String),
    PhaseChanged(HandshakePhase),
    Text {
        text: String,
        /// Sender clock, epoch milliseconds
        timestamp: u64,
    },
    Image {
        image: String,
        timestamp: u64,
    },
    Error(SessionError),
    /// Terminal; nothing follows
    Closed {
        reason: String,
    },
}
