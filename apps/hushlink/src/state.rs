//! Application state management

use std::sync::Arc;

use crypto_session::{Identity, hash_string};
use ephemeral_vault::{EphemeralVault, MemoryStorage, VaultConfig};
use net_transport::QuicTransport;
use parking_lot::RwLock;
use secure_session::SecureSession;
use serde::{Deserialize, Serialize};
use shared_protocol::{PeerId, RoomId};

/// Vault key of this run's identity record
pub const KEYPAIR_RECORD: &str = "keypair";

pub type ActiveSession = Arc<SecureSession<QuicTransport>>;

/// Non-secret identity summary kept in the vault
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeypairRecord {
    pub peer_id: PeerId,
    /// SHA-256 of the exported public key
    pub pub_key_hash: String,
}

/// Application-wide state
pub struct AppState {
    pub identity: Arc<Identity>,
    pub peer_id: PeerId,
    pub room_id: RoomId,
    pub vault: EphemeralVault<MemoryStorage>,
    /// At most one session at a time
    session: RwLock<Option<ActiveSession>>,
}

impl AppState {
    pub fn new(identity: Identity, room_id: Option<RoomId>) -> anyhow::Result<Self> {
        let vault = EphemeralVault::new(Arc::new(MemoryStorage::new()), VaultConfig::default())?;

        Ok(Self {
            identity: Arc::new(identity),
            peer_id: PeerId::generate(),
            room_id: room_id.unwrap_or_else(RoomId::generate),
            vault,
            session: RwLock::new(None),
        })
    }

    /// Record our identity summary under [`KEYPAIR_RECORD`]
    pub fn store_keypair_record(&self) -> anyhow::Result<KeypairRecord> {
        let exported = serde_json::to_string(&self.identity.export_public_key())?;
        let record = KeypairRecord {
            peer_id: self.peer_id.clone(),
            pub_key_hash: hash_string(&exported),
        };
        self.vault.save(KEYPAIR_RECORD, &record)?;
        Ok(record)
    }

    pub fn session(&self) -> Option<ActiveSession> {
        self.session.read().clone()
    }

    pub fn set_session(&self, session: ActiveSession) {
        *self.session.write() = Some(session);
    }

    pub fn take_session(&self) -> Option<ActiveSession> {
        self.session.write().take()
    }
}
