//! Symmetric frame encryption with ChaCha20Poly1305

use std::collections::{HashSet, VecDeque};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::{CryptoError, CryptoResult, KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// Attempts at drawing a nonce that has not been issued under this key
const NONCE_DRAW_ATTEMPTS: usize = 8;

/// Recent nonces remembered for collision checks. Random 96-bit nonces
/// make collisions negligible, so the check is best-effort over this window.
pub const NONCE_HISTORY: usize = 4096;

/// 256-bit symmetric key owned by exactly one session.
///
/// Not `Clone`: the key must stay inside the scope that derived it.
/// The key bytes are wiped when the value is dropped.
pub struct SharedKey {
    key: Zeroizing<[u8; KEY_SIZE]>,
    /// The most recent nonces this key has sealed with
    issued_nonces: HashSet<[u8; NONCE_SIZE]>,
    /// Issue order of `issued_nonces`, oldest first
    nonce_order: VecDeque<[u8; NONCE_SIZE]>,
    nonce_history: usize,
    /// Number of frames encrypted
    sealed: u64,
}

impl SharedKey {
    pub(crate) fn from_key(key: Zeroizing<[u8; KEY_SIZE]>) -> Self {
        Self::with_nonce_history(key, NONCE_HISTORY)
    }

    fn with_nonce_history(key: Zeroizing<[u8; KEY_SIZE]>, nonce_history: usize) -> Self {
        Self {
            key,
            issued_nonces: HashSet::new(),
            nonce_order: VecDeque::new(),
            nonce_history: nonce_history.max(1),
            sealed: 0,
        }
    }

    /// Create a key from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: bytes.len(),
            });
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(bytes);
        Ok(Self::from_key(key))
    }

    /// Key taken directly from a non-secret string: right-padded with
    /// `'0'` and truncated to the key length. Obfuscation only.
    pub fn from_padded_secret(secret: &str) -> Self {
        let mut key = Zeroizing::new([b'0'; KEY_SIZE]);
        let bytes = secret.as_bytes();
        let len = bytes.len().min(KEY_SIZE);
        key[..len].copy_from_slice(&bytes[..len]);
        Self::from_key(key)
    }

    fn fresh_nonce(&mut self) -> CryptoResult<[u8; NONCE_SIZE]> {
        for _ in 0..NONCE_DRAW_ATTEMPTS {
            let mut nonce = [0u8; NONCE_SIZE];
            OsRng
                .try_fill_bytes(&mut nonce)
                .map_err(|_| CryptoError::CryptoUnavailable)?;

            if self.issued_nonces.insert(nonce) {
                self.nonce_order.push_back(nonce);
                if self.nonce_order.len() > self.nonce_history {
                    if let Some(oldest) = self.nonce_order.pop_front() {
                        self.issued_nonces.remove(&oldest);
                    }
                }
                return Ok(nonce);
            }
            tracing::warn!("Random nonce collided with an issued one, redrawing");
        }
        Err(CryptoError::NonceExhausted)
    }

    /// Encrypt data with authentication
    ///
    /// Returns: base64(nonce || ciphertext || tag)
    pub fn encrypt(&mut self, plaintext: &[u8]) -> CryptoResult<String> {
        let nonce_bytes = self.fresh_nonce()?;
        let cipher = ChaCha20Poly1305::new((&*self.key).into());

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|e| CryptoError::Encryption(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        self.sealed += 1;

        Ok(BASE64.encode(combined))
    }

    /// Decrypt and verify a payload produced by [`SharedKey::encrypt`]
    pub fn decrypt(&self, payload: &str) -> CryptoResult<Vec<u8>> {
        let combined = BASE64
            .decode(payload.as_bytes())
            .map_err(|_| CryptoError::DecryptionFailed)?;

        if combined.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        let (nonce, ciphertext) = combined.split_at(NONCE_SIZE);
        let cipher = ChaCha20Poly1305::new((&*self.key).into());

        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Number of frames encrypted under this key
    pub fn frames_sealed(&self) -> u64 {
        self.sealed
    }

    /// Non-secret identifier for comparing keys without exposing them
    pub fn key_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"hushlink/v1/key-id");
        hasher.update(&*self.key);
        hex::encode(&hasher.finalize()[..8])
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedKey")
            .field("key_id", &self.key_id())
            .field("sealed", &self.sealed)
            .finish()
    }
}
