//! BLS12-381 keys for validator signing
//!
//! Uses the min_pk variant (48-byte public keys, 96-byte signatures) with the
//! proof-of-possession ciphersuite, matching Ethereum consensus.

use crate::errors::{KeyManagerError, Result};
use blst::min_pk::{
    PublicKey as BlstPublicKey, SecretKey as BlstSecretKey, Signature as BlstSignature,
};
use blst::BLST_ERROR;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Compressed public key length
pub const PUBLIC_KEY_LEN: usize = 48;

/// Secret scalar length
pub const SECRET_KEY_LEN: usize = 32;

/// Compressed signature length
pub const SIGNATURE_LEN: usize = 96;

/// Domain separation tag of the Ethereum proof-of-possession ciphersuite
pub const DST_POP: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Validator public key, identified by its canonical `0x` hex form
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    /// Parse compressed bytes, rejecting anything that is not a valid G1 point
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(KeyManagerError::InvalidPublicKey(format!(
                "expected {} bytes, got {}",
                PUBLIC_KEY_LEN,
                bytes.len()
            )));
        }

        BlstPublicKey::key_validate(bytes).map_err(|e| {
            KeyManagerError::InvalidPublicKey(format!("not a valid BLS public key: {:?}", e))
        })?;

        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    /// Parse a hex string, with or without `0x`
    pub fn from_hex(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        let bytes = hex::decode(digits)?;
        Self::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    /// Canonical `0x`-prefixed lowercase hex
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// File-name-safe identity (hex without prefix)
    pub fn file_stem(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify a signature over `message`
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(pk) = BlstPublicKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(sig) = BlstSignature::from_bytes(&signature.0) else {
            return false;
        };
        sig.verify(true, message, DST_POP, &[], &pk, true) == BLST_ERROR::BLST_SUCCESS
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(0x{})", hex::encode(&self.0[..8]))
    }
}

impl FromStr for PublicKey {
    type Err = KeyManagerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Exclusively owned BLS secret key
///
/// Not `Clone`. The underlying scalar is zeroized when the handle drops.
pub struct SecretHandle {
    key: BlstSecretKey,
}

impl SecretHandle {
    /// Load from a 32-byte big-endian scalar
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SECRET_KEY_LEN {
            return Err(KeyManagerError::InvalidSecretKey(format!(
                "expected {} bytes, got {}",
                SECRET_KEY_LEN,
                bytes.len()
            )));
        }
        BlstSecretKey::from_bytes(bytes)
            .map(|key| Self { key })
            .map_err(|e| KeyManagerError::InvalidSecretKey(format!("{:?}", e)))
    }

    /// Derive a key from input key material (EIP-2333 KeyGen)
    #[cfg(test)]
    pub(crate) fn from_seed(ikm: &[u8; 32]) -> Result<Self> {
        BlstSecretKey::key_gen(ikm, &[])
            .map(|key| Self { key })
            .map_err(|e| KeyManagerError::InvalidSecretKey(format!("{:?}", e)))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.key.sk_to_pk().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.key.sign(message, DST_POP, &[]).to_bytes())
    }

    /// Raw scalar, for re-encryption at rest
    pub(crate) fn to_bytes(&self) -> Zeroizing<[u8; SECRET_KEY_LEN]> {
        Zeroizing::new(self.key.to_bytes())
    }
}

impl fmt::Debug for SecretHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretHandle")
            .field("public_key", &self.public_key())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Compressed BLS signature
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_LEN]);

impl Signature {
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(0x{}..)", hex::encode(&self.0[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_hex_forms() {
        let sk = SecretHandle::from_seed(&[7u8; 32]).unwrap();
        let pk = sk.public_key();

        let canonical = pk.to_hex();
        assert!(canonical.starts_with("0x"));
        assert_eq!(canonical.len(), 2 + 2 * PUBLIC_KEY_LEN);

        let upper = canonical[2..].to_uppercase();
        assert_eq!(PublicKey::from_hex(&upper).unwrap(), pk);
        assert_eq!(canonical.parse::<PublicKey>().unwrap(), pk);
    }

    #[test]
    fn test_invalid_public_keys() {
        assert!(PublicKey::from_hex("0x1234").is_err());
        assert!(PublicKey::from_hex("zz").is_err());
        // Right length, not a curve point
        assert!(PublicKey::from_bytes(&[0xffu8; PUBLIC_KEY_LEN]).is_err());
    }

    #[test]
    fn test_secret_roundtrip_and_sign() {
        let sk = SecretHandle::from_seed(&[9u8; 32]).unwrap();
        let bytes = sk.to_bytes();
        let restored = SecretHandle::from_bytes(bytes.as_ref()).unwrap();
        assert_eq!(restored.public_key(), sk.public_key());

        let sig = restored.sign(b"block root");
        assert!(sk.public_key().verify(b"block root", &sig));
        assert!(!sk.public_key().verify(b"other root", &sig));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let sk = SecretHandle::from_seed(&[3u8; 32]).unwrap();
        let dbg = format!("{:?}", sk);
        assert!(dbg.contains("REDACTED"));
    }

    #[test]
    fn test_serde_public_key() {
        let pk = SecretHandle::from_seed(&[4u8; 32]).unwrap().public_key();
        let json = serde_json::to_string(&pk).unwrap();
        assert_eq!(json, format!("\"{}\"", pk.to_hex()));
        let parsed: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, pk);
    }
}
