//! Error types for the protocol

use thiserror::Error;

use crate::HandshakePhase;

/// Protocol error
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Packet too large: {size} bytes (max: {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: HandshakePhase,
        to: HandshakePhase,
    },
}

/// Result type alias for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
