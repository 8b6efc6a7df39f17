//! Ephemeral Vault - encrypted-at-rest scratch storage for Hushlink
//!
//! Records live in a randomly named namespace that belongs to a single
//! run of the process. The whole namespace can be destroyed at any time,
//! and `panic` seals the vault for good.

mod error;
mod storage;
mod vault;

pub use error::*;
pub use storage::*;
pub use vault::*;

/// Default namespace prefix; a random suffix is appended per run
pub const DEFAULT_NAMESPACE_PREFIX: &str = "hushlink_vault";
