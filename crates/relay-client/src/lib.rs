//! Relay client for Hushlink
//!
//! Keeps the WebSocket control channel to the rendezvous relay open,
//! joins a room, sends heartbeats and turns relay traffic into an
//! ordered stream of [`RelayEvent`]s.

mod client;
mod error;

pub use client::*;
pub use error::*;
