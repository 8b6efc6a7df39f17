//! Process identity and peer public keys

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use serde_json::Value;
use sha2::{Digest, Sha256};
use shared_protocol::{PortablePublicKey, CURVE_X25519, KEY_TYPE_OKP};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::{CryptoError, CryptoResult, SharedKey, FINGERPRINT_BYTES, KEY_SIZE, PUBLIC_KEY_SIZE};

/// HKDF info string binding derived keys to this protocol
const HKDF_INFO: &[u8] = b"hushlink/v1/shared-key";

/// Short hex digest of a public key, for humans only
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 over the canonical key serialization, truncated to 8 bytes
pub fn fingerprint(key: &PortablePublicKey) -> Fingerprint {
    let digest = Sha256::digest(key.canonical_bytes());
    Fingerprint(hex::encode(&digest[..FINGERPRINT_BYTES]))
}

/// Full SHA-256 of a string, hex-encoded
pub fn hash_string(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Long-lived key-agreement identity for this process.
///
/// Generated once at startup and never persisted.
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
    portable: PortablePublicKey,
    fingerprint: Fingerprint,
}

impl Identity {
    /// Generate a new identity from the OS random source
    pub fn generate() -> CryptoResult<Self> {
        let mut seed = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng
            .try_fill_bytes(&mut seed[..])
            .map_err(|_| CryptoError::CryptoUnavailable)?;

        let secret = StaticSecret::from(*seed);
        let public = PublicKey::from(&secret);
        let portable = PortablePublicKey::x25519(URL_SAFE_NO_PAD.encode(public.as_bytes()));
        let fingerprint = fingerprint(&portable);

        tracing::debug!("Generated identity {}", fingerprint);

        Ok(Self {
            secret,
            public,
            portable,
            fingerprint,
        })
    }

    /// Get the raw public key bytes
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    /// Export the public key in portable form
    pub fn export_public_key(&self) -> PortablePublicKey {
        self.portable.clone()
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Run X25519 against the peer key and expand the result with
    /// HKDF-SHA256. Both peers arrive at the same key independently.
    pub fn derive_shared_key(&self, remote: &RemotePublicKey) -> CryptoResult<SharedKey> {
        let shared = self.secret.diffie_hellman(&remote.key);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidKeyEncoding(
                "peer key is a low-order point".to_string(),
            ));
        }

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = Zeroizing::new([0u8; KEY_SIZE]);
        hk.expand(HKDF_INFO, &mut okm[..])
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        Ok(SharedKey::from_key(okm))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Imported peer public key
#[derive(Debug, Clone)]
pub struct RemotePublicKey {
    key: PublicKey,
    portable: PortablePublicKey,
}

impl RemotePublicKey {
    /// Import a key received as raw JSON (the `pubKey` field of an offer or answer)
    pub fn import(value: &Value) -> CryptoResult<Self> {
        let portable: PortablePublicKey = serde_json::from_value(value.clone())
            .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
        Self::from_portable(&portable)
    }

    /// Import a key from its portable form
    pub fn from_portable(portable: &PortablePublicKey) -> CryptoResult<Self> {
        if portable.kty != KEY_TYPE_OKP {
            return Err(CryptoError::InvalidKeyEncoding(format!(
                "unsupported key type {:?}",
                portable.kty
            )));
        }
        if portable.crv != CURVE_X25519 {
            return Err(CryptoError::InvalidKeyEncoding(format!(
                "unsupported curve {:?}",
                portable.crv
            )));
        }

        let raw = URL_SAFE_NO_PAD
            .decode(portable.x.as_bytes())
            .map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
        let bytes: [u8; PUBLIC_KEY_SIZE] = raw.as_slice().try_into().map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: PUBLIC_KEY_SIZE,
                actual: raw.len(),
            }
        })?;

        Ok(Self {
            key: PublicKey::from(bytes),
            portable: portable.clone(),
        })
    }

    pub fn portable(&self) -> &PortablePublicKey {
        &self.portable
    }

    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint(&self.portable)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_agreement_symmetry() {
        for _ in 0..8 {
            let alice = Identity::generate().unwrap();
            let bob = Identity::generate().unwrap();

            let bob_pub = RemotePublicKey::from_portable(&bob.export_public_key()).unwrap();
            let alice_pub = RemotePublicKey::from_portable(&alice.export_public_key()).unwrap();

            let k1 = alice.derive_shared_key(&bob_pub).unwrap();
            let k2 = bob.derive_shared_key(&alice_pub).unwrap();
            assert_eq!(k1.key_id(), k2.key_id());
        }
    }

    #[test]
    fn test_export_import_roundtrip() {
        let id = Identity::generate().unwrap();
        let value = serde_json::to_value(id.export_public_key()).unwrap();
        let imported = RemotePublicKey::import(&value).unwrap();
        assert_eq!(imported.portable(), &id.export_public_key());
        assert_eq!(&imported.fingerprint(), id.fingerprint());
    }

    #[test]
    fn test_fingerprint_shape() {
        let id = Identity::generate().unwrap();
        let fp = id.fingerprint().as_str();
        assert_eq!(fp.len(), 16);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        let expected = hex::encode(&Sha256::digest(id.export_public_key().canonical_bytes())[..8]);
        assert_eq!(fp, expected);
    }

    #[test]
    fn test_import_rejects_malformed_keys() {
        let cases = [
            json!("not an object"),
            json!({"kty": "EC", "crv": "X25519", "x": "AAAA"}),
            json!({"kty": "OKP", "crv": "P-256", "x": "AAAA"}),
            json!({"kty": "OKP", "crv": "X25519", "x": "!!!"}),
            json!({"kty": "OKP", "crv": "X25519", "x": "AAAA"}),
            json!({"kty": "OKP", "crv": "X25519"}),
        ];
        for case in cases {
            assert!(RemotePublicKey::import(&case).is_err(), "accepted {case}");
        }
    }

    #[test]
    fn test_low_order_point_rejected() {
        let id = Identity::generate().unwrap();
        let zero = PortablePublicKey::x25519(URL_SAFE_NO_PAD.encode([0u8; 32]));
        let remote = RemotePublicKey::from_portable(&zero).unwrap();
        assert!(matches!(
            id.derive_shared_key(&remote),
            Err(CryptoError::InvalidKeyEncoding(_))
        ));
    }

    #[test]
    fn test_hash_string() {
        assert_eq!(
            hash_string("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_debug_hides_secret() {
        let id = Identity::generate().unwrap();
        let debug = format!("{:?}", id);
        assert!(debug.contains(id.fingerprint().as_str()));
        assert!(!debug.contains("secret"));
    }
}
