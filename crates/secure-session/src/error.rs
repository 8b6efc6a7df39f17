//! Session error taxonomy

use crypto_session::CryptoError;
use shared_protocol::HandshakePhase;
use thiserror::Error;

/// Session error. Messages never carry key material.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Secure random source or cipher unavailable")]
    CryptoUnavailable,

    #[error("Peer key rejected: {0}")]
    InvalidKeyEncoding(String),

    #[error("Peer did not present a public key")]
    MissingPeerKey,

    #[error("Could not decrypt message")]
    DecryptionFailed,

    #[error("Payload too large: {size} (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Transport negotiation failed: {0}")]
    TransportNegotiationFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Channel not open ({0})")]
    NotOpen(HandshakePhase),

    #[error("Session closed")]
    Closed,

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Relay error: {0}")]
    Relay(String),
}

impl SessionError {
    /// Whether this error ends the session
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::CryptoUnavailable
                | SessionError::InvalidKeyEncoding(_)
                | SessionError::MissingPeerKey
                | SessionError::TransportNegotiationFailed(_)
                | SessionError::HandshakeTimeout
                | SessionError::Relay(_)
        )
    }
}

impl From<CryptoError> for SessionError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::CryptoUnavailable | CryptoError::NonceExhausted => {
                SessionError::CryptoUnavailable
            }
            CryptoError::DecryptionFailed => SessionError::DecryptionFailed,
            CryptoError::InvalidKeyEncoding(msg) => SessionError::InvalidKeyEncoding(msg),
            CryptoError::InvalidKeyLength { expected, actual } => SessionError::InvalidKeyEncoding(
                format!("expected {} key bytes, got {}", expected, actual),
            ),
            CryptoError::KeyDerivation(msg) | CryptoError::Encryption(msg) => {
                tracing::error!("Cipher failure: {}", msg);
                SessionError::CryptoUnavailable
            }
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
