//! The ephemeral vault

use std::sync::Arc;

use crypto_session::SharedKey;
use hkdf::Hkdf;
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use serde::{de::DeserializeOwned, Serialize};
use shared_protocol::now_millis;
use sha2::Sha256;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::{
    MemoryStorage, StorageBackend, VaultError, VaultRecord, VaultResult, DEFAULT_NAMESPACE_PREFIX,
};

/// How per-record encryption keys are obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VaultKeying {
    /// Key is the lookup key itself, padded to 32 bytes. Obfuscation only:
    /// anyone who can read the record can decrypt it.
    #[default]
    LookupKey,
    /// Key is derived from a random secret that only lives in this
    /// process's memory, so stored records are unreadable after exit.
    ProcessSecret,
}

/// Vault configuration
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Namespace prefix; a random suffix is added per vault
    pub namespace_prefix: String,
    pub keying: VaultKeying,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
            keying: VaultKeying::LookupKey,
        }
    }
}

/// Lookup key and insertion time of a stored record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultEntry {
    pub key: String,
    pub timestamp: u64,
}

struct VaultState {
    namespace: String,
    /// Namespace has been created in the backend
    opened: bool,
    /// Set by `panic`; never cleared
    sealed: bool,
}

/// Encrypted-at-rest key/value store scoped to one run of the process
pub struct EphemeralVault<S: StorageBackend = MemoryStorage> {
    storage: Arc<S>,
    keying: VaultKeying,
    process_secret: Zeroizing<[u8; 32]>,
    state: Mutex<VaultState>,
}

impl<S: StorageBackend> EphemeralVault<S> {
    /// Create a vault in a fresh random namespace of `storage`.
    ///
    /// Nothing touches the backend until the first operation.
    pub fn new(storage: Arc<S>, config: VaultConfig) -> VaultResult<Self> {
        let mut process_secret = Zeroizing::new([0u8; 32]);
        OsRng
            .try_fill_bytes(&mut process_secret[..])
            .map_err(|_| crypto_session::CryptoError::CryptoUnavailable)?;

        let namespace = format!("{}_{}", config.namespace_prefix, Uuid::new_v4().simple());
        debug!("Vault namespace: {}", namespace);

        Ok(Self {
            storage,
            keying: config.keying,
            process_secret,
            state: Mutex::new(VaultState {
                namespace,
                opened: false,
                sealed: false,
            }),
        })
    }

    /// Current namespace name
    pub fn namespace(&self) -> String {
        self.state.lock().namespace.clone()
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Whether `panic` has run
    pub fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    fn ensure_open(&self, state: &mut VaultState) -> VaultResult<()> {
        if !state.opened {
            self.storage.create(&state.namespace)?;
            state.opened = true;
            info!("Vault initialized");
        }
        Ok(())
    }

    fn record_key(&self, key: &str) -> VaultResult<SharedKey> {
        match self.keying {
            VaultKeying::LookupKey => Ok(SharedKey::from_padded_secret(key)),
            VaultKeying::ProcessSecret => {
                let hk = Hkdf::<Sha256>::new(None, &self.process_secret[..]);
                let mut okm = Zeroizing::new([0u8; 32]);
                let info = format!("hushlink/v1/vault/{}", key);
                hk.expand(info.as_bytes(), &mut okm[..]).map_err(|e| {
                    crypto_session::CryptoError::KeyDerivation(e.to_string())
                })?;
                Ok(SharedKey::from_bytes(&okm[..])?)
            }
        }
    }

    /// Encrypt and store `value` under `key`. Earlier records with the same
    /// key are kept; retrieval returns the newest.
    pub fn save<V: Serialize + ?Sized>(&self, key: &str, value: &V) -> VaultResult<()> {
        let mut state = self.state.lock();
        if state.sealed {
            return Err(VaultError::Sealed);
        }
        self.ensure_open(&mut state)?;

        let plaintext = Zeroizing::new(serde_json::to_vec(value)?);
        let encrypted = self.record_key(key)?.encrypt(&plaintext)?;

        self.storage.append(
            &state.namespace,
            VaultRecord {
                key: key.to_string(),
                encrypted,
                timestamp: now_millis(),
            },
        )?;
        debug!("Saved vault record {:?}", key);
        Ok(())
    }

    /// Decrypt the newest record stored under `key`
    pub fn retrieve<V: DeserializeOwned>(&self, key: &str) -> VaultResult<Option<V>> {
        let mut state = self.state.lock();
        if state.sealed {
            return Ok(None);
        }
        self.ensure_open(&mut state)?;

        let records = self.storage.records(&state.namespace)?;
        // max_by_key keeps the last of equal timestamps, i.e. the latest insert
        let Some(record) = records
            .iter()
            .filter(|r| r.key == key)
            .max_by_key(|r| r.timestamp)
        else {
            return Ok(None);
        };

        let plaintext = Zeroizing::new(self.record_key(key)?.decrypt(&record.encrypted)?);
        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    /// Keys and timestamps of every stored record, in insertion order
    pub fn list_entries(&self) -> VaultResult<Vec<VaultEntry>> {
        let mut state = self.state.lock();
        if state.sealed {
            return Ok(Vec::new());
        }
        self.ensure_open(&mut state)?;

        Ok(self
            .storage
            .records(&state.namespace)?
            .into_iter()
            .map(|r| VaultEntry {
                key: r.key,
                timestamp: r.timestamp,
            })
            .collect())
    }

    /// Remove every record, keeping the namespace
    pub fn clear(&self) -> VaultResult<()> {
        let mut state = self.state.lock();
        if state.sealed {
            return Ok(());
        }
        self.ensure_open(&mut state)?;
        self.storage.clear(&state.namespace)
    }

    /// Delete the namespace. The next operation starts over with an empty
    /// store under the same name.
    pub fn destroy(&self) -> VaultResult<()> {
        let mut state = self.state.lock();
        self.storage.delete(&state.namespace)?;
        state.opened = false;
        info!("Vault destroyed");
        Ok(())
    }

    /// Delete the namespace and seal the vault for the rest of its life.
    ///
    /// Operations that were waiting on the lock observe the sealed vault:
    /// saves fail, reads come back empty, nothing is written again.
    pub fn panic(&self) -> VaultResult<()> {
        let mut state = self.state.lock();
        warn!("Destroying vault immediately");
        state.sealed = true;
        state.opened = false;
        self.storage.delete(&state.namespace)
    }
}

impl<S: StorageBackend> Drop for EphemeralVault<S> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.sealed {
            return;
        }
        if let Err(e) = self.storage.delete(&state.namespace) {
            warn!("Failed to remove vault namespace on drop: {}", e);
        }
    }
}
