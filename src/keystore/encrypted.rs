//! At-rest encryption of active keys
//!
//! Imported secrets are re-encrypted under the node's master password using
//! AES-256-GCM with Argon2id key derivation, one document per validator.

use crate::crypto::{PublicKey, SecretHandle};
use crate::errors::{KeyManagerError, Result};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Salt size for Argon2
const SALT_SIZE: usize = 16;

/// Nonce size for AES-GCM
const NONCE_SIZE: usize = 12;

/// Current document format
const FORMAT_VERSION: u32 = 1;

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfCost {
    pub memory_kib: u32,
    pub iterations: u32,
    pub lanes: u32,
}

impl Default for KdfCost {
    fn default() -> Self {
        Self {
            memory_kib: 65536, // 64 MB
            iterations: 3,
            lanes: 4,
        }
    }
}

impl KdfCost {
    /// Minimal cost for tests
    pub fn insecure_for_tests() -> Self {
        Self {
            memory_kib: 8,
            iterations: 1,
            lanes: 1,
        }
    }
}

/// Encrypted key file format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKeyFile {
    /// Version of the encryption format
    pub version: u32,

    /// Validator public key
    pub pubkey: PublicKey,

    /// EIP-2334 derivation path from the imported keystore
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_path: Option<String>,

    /// Argon2id parameters used for this file
    pub kdf: KdfCost,

    /// Salt for key derivation (base64)
    pub salt: String,

    /// Nonce for AES-GCM (base64)
    pub nonce: String,

    /// Encrypted secret scalar (base64)
    pub ciphertext: String,

    /// Import timestamp
    pub created_at: i64,
}

impl EncryptedKeyFile {
    /// Encrypt `secret` under `password`
    pub fn seal(
        secret: &SecretHandle,
        derivation_path: Option<String>,
        password: &str,
        kdf: KdfCost,
    ) -> Result<Self> {
        let mut salt_bytes = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt_bytes);

        let encryption_key = derive_key(password, &salt_bytes, kdf)?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let cipher = Aes256Gcm::new_from_slice(encryption_key.as_ref())
            .map_err(|e| KeyManagerError::Encryption(e.to_string()))?;

        let plaintext = secret.to_bytes();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_ref())
            .map_err(|e| KeyManagerError::Encryption(e.to_string()))?;

        Ok(Self {
            version: FORMAT_VERSION,
            pubkey: secret.public_key(),
            derivation_path,
            kdf,
            salt: BASE64.encode(salt_bytes),
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
            created_at: chrono::Utc::now().timestamp(),
        })
    }

    /// Decrypt and check the secret against the recorded public key
    pub fn open(&self, password: &str) -> Result<SecretHandle> {
        if self.version != FORMAT_VERSION {
            return Err(KeyManagerError::Decryption(format!(
                "unsupported key file version {}",
                self.version
            )));
        }

        let salt_bytes = BASE64
            .decode(&self.salt)
            .map_err(|e| KeyManagerError::Decryption(format!("Invalid salt: {}", e)))?;
        let nonce_bytes = BASE64
            .decode(&self.nonce)
            .map_err(|e| KeyManagerError::Decryption(format!("Invalid nonce: {}", e)))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(KeyManagerError::Decryption("Invalid nonce length".to_string()));
        }
        let ciphertext = BASE64
            .decode(&self.ciphertext)
            .map_err(|e| KeyManagerError::Decryption(format!("Invalid ciphertext: {}", e)))?;

        let decryption_key = derive_key(password, &salt_bytes, self.kdf)?;
        let cipher = Aes256Gcm::new_from_slice(decryption_key.as_ref())
            .map_err(|e| KeyManagerError::Decryption(e.to_string()))?;

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
                .map_err(|_| {
                    KeyManagerError::Decryption("Decryption failed - wrong password?".to_string())
                })?,
        );

        let secret = SecretHandle::from_bytes(&plaintext)?;
        if secret.public_key() != self.pubkey {
            return Err(KeyManagerError::Decryption(format!(
                "key file for {} holds a different key",
                self.pubkey
            )));
        }
        Ok(secret)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Derive an encryption key from a password using Argon2id
fn derive_key(password: &str, salt: &[u8], cost: KdfCost) -> Result<Zeroizing<[u8; 32]>> {
    let params = Params::new(cost.memory_kib, cost.iterations, cost.lanes, Some(32))
        .map_err(|e| KeyManagerError::Encryption(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(password.as_bytes(), salt, output.as_mut())
        .map_err(|e| KeyManagerError::Encryption(e.to_string()))?;

    Ok(output)
}
