//! Shared Protocol Definitions for Hushlink
//!
//! This crate contains the relay control messages, the messaging-channel
//! frame format and the handshake state types shared by every other
//! Hushlink crate.

mod error;
mod identity;
mod packets;
mod session;
mod signaling;

pub use error::*;
pub use identity::*;
pub use packets::*;
pub use session::*;
pub use signaling::*;

/// Maximum length of a text message, in characters
pub const MAX_TEXT_CHARS: usize = 1000;

/// Maximum size of an encoded image (data URI), in bytes
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// Interval between relay heartbeats, in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
