//! Network Transport - peer-to-peer messaging channel for Hushlink
//!
//! The secure session drives a [`Transport`] through offer/answer and
//! candidate exchange. Once the channel is open, opaque frames travel
//! over it in both directions.
//!
//! Two implementations ship here: a QUIC transport for real peers and an
//! in-process loopback used by tests and local demos.

mod error;
mod loopback;
mod quic;
mod transport;

pub use error::*;
pub use loopback::*;
pub use quic::*;
pub use transport::*;

/// Default QUIC port (0 lets the OS pick)
pub const DEFAULT_QUIC_PORT: u16 = 0;

/// ALPN token negotiated on QUIC connections
pub const ALPN_PROTOCOL: &[u8] = b"hushlink/1";

/// Capacity of the transport event queue
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
