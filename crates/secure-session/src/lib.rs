//! Secure Session - handshake state machine and encrypted messaging
//!
//! A [`SecureSession`] binds one peer's identity to a transport channel:
//! it drives offer/answer exchange over the relay, derives the shared key
//! from the peer's stamped public key, and encrypts every message that
//! crosses the channel.

mod error;
mod message;
mod session;

pub use error::*;
pub use message::*;
pub use session::*;

/// Default handshake deadline, in seconds
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 45;

/// Frames held while the channel opens
pub const EARLY_FRAME_CAPACITY: usize = 64;
