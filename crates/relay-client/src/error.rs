//! Relay client error types

use shared_protocol::ProtocolError;
use thiserror::Error;

/// Relay client error
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Relay not connected")]
    NotConnected,

    #[error("Channel error")]
    Channel,
}

pub type RelayResult<T> = Result<T, RelayError>;
