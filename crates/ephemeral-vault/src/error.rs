//! Vault error types

use crypto_session::CryptoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Vault has been destroyed by panic")]
    Sealed,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type VaultResult<T> = Result<T, VaultError>;
