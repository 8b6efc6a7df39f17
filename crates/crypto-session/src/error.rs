//! Crypto session error types

use thiserror::Error;

/// Cryptographic operation error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("Secure random source unavailable")]
    CryptoUnavailable,

    #[error("Invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Could not draw an unused nonce")]
    NonceExhausted,
}

pub type CryptoResult<T> = Result<T, CryptoError>;
