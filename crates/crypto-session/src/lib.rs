//! Crypto Session - End-to-End Encryption for Hushlink
//!
//! Provides X25519 identities, HKDF-SHA256 key derivation and
//! ChaCha20Poly1305 frame encryption.

mod error;
mod identity;
mod session;

pub use error::*;
pub use identity::*;
pub use session::*;

/// Nonce size for ChaCha20Poly1305 (96 bits / 12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits / 16 bytes)
pub const TAG_SIZE: usize = 16;

/// Public key size (256 bits / 32 bytes)
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Symmetric key size (256 bits / 32 bytes)
pub const KEY_SIZE: usize = 32;

/// Number of digest bytes kept in a fingerprint
pub const FINGERPRINT_BYTES: usize = 8;
