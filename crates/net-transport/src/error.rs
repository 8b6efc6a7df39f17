//! Transport error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("Send error: {0}")]
    Send(String),

    #[error("Not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type TransportResult<T> = Result<T, TransportError>;
