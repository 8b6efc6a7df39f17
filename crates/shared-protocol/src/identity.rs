//! Portable public key representation

use serde::{Deserialize, Serialize};

/// JWK key type for octet key pairs
pub const KEY_TYPE_OKP: &str = "OKP";

/// JWK curve name for X25519
pub const CURVE_X25519: &str = "X25519";

/// Public key in a JWK-like shape that any peer can reconstruct.
///
/// Field order is fixed, so `serde_json::to_vec` yields the canonical
/// serialization that fingerprints are computed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortablePublicKey {
    /// Key type, always `OKP`
    pub kty: String,
    /// Curve name, always `X25519`
    pub crv: String,
    /// Base64url (unpadded) public key bytes
    pub x: String,
}

impl PortablePublicKey {
    /// Build an X25519 portable key from its encoded `x` coordinate
    pub fn x25519(x: impl Into<String>) -> Self {
        Self {
            kty: KEY_TYPE_OKP.to_string(),
            crv: CURVE_X25519.to_string(),
            x: x.into(),
        }
    }

    /// Canonical byte serialization
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // Three string fields: serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_field_order() {
        let key = PortablePublicKey::x25519("abc");
        let json = String::from_utf8(key.canonical_bytes()).unwrap();
        assert_eq!(json, r#"{"kty":"OKP","crv":"X25519","x":"abc"}"#);
    }
}
