//! EIP-2335 keystores
//!
//! The JSON format validators are distributed in:
//!
//! - scrypt key derivation
//! - SHA-256 checksum over `dk[16..32] || ciphertext`
//! - AES-128-CTR encryption keyed by `dk[0..16]`
//!
//! Only the scrypt KDF is supported. Keystores using pbkdf2 are rejected with
//! [`KeystoreError::UnsupportedKdf`].

use crate::crypto::constant_time_eq;
use aes::Aes128;
use cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use rand::RngCore;
use secrecy::SecretVec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Keystore format version
pub const KEYSTORE_VERSION: u32 = 4;

/// scrypt N used for new keystores (2^18)
pub const DEFAULT_SCRYPT_N: u32 = 262_144;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const DKLEN: u32 = 32;
/// Largest derived key accepted from a keystore
const MAX_DKLEN: u32 = 64;
/// Ceiling on scrypt memory (`128 * r * n` bytes); the standard cost uses exactly this
const MAX_SCRYPT_MEMORY: u64 = 256 * 1024 * 1024;
/// Ceiling on scrypt parallelization
const MAX_SCRYPT_P: u32 = 16;

const SALT_LEN: usize = 32;
const IV_LEN: usize = 16;

type Aes128Ctr = Ctr128BE<Aes128>;

/// Errors decoding or decrypting a keystore
#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("invalid keystore JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported keystore version: {0}")]
    UnsupportedVersion(u32),

    #[error("unsupported KDF function: {0}")]
    UnsupportedKdf(String),

    #[error("unsupported cipher function: {0}")]
    UnsupportedCipher(String),

    #[error("unsupported checksum function: {0}")]
    UnsupportedChecksum(String),

    #[error("invalid KDF parameters: {0}")]
    InvalidKdfParams(String),

    #[error("invalid cipher parameters: {0}")]
    InvalidCipherParams(String),

    #[error("invalid hex in {field}: {reason}")]
    Hex { field: &'static str, reason: String },

    #[error("invalid password: checksum verification failed")]
    InvalidPassword,

    #[error("invalid secret key: {0}")]
    InvalidSecret(String),

    #[error("keystore pubkey {declared} does not match decrypted key {derived}")]
    PublicKeyMismatch { declared: String, derived: String },
}

pub type KeystoreResult<T> = std::result::Result<T, KeystoreError>;

/// An EIP-2335 keystore document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keystore {
    pub crypto: CryptoModule,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub pubkey: String,
    #[serde(default)]
    pub path: String,
    pub uuid: String,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoModule {
    pub kdf: Module,
    pub checksum: Module,
    pub cipher: Module,
}

/// A `{function, params, message}` block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub function: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScryptParams {
    dklen: u32,
    n: u32,
    r: u32,
    p: u32,
    salt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CipherParams {
    iv: String,
}

impl Keystore {
    pub fn from_json(json: &str) -> KeystoreResult<Self> {
        let keystore: Self = serde_json::from_str(json)?;
        if keystore.version != KEYSTORE_VERSION {
            return Err(KeystoreError::UnsupportedVersion(keystore.version));
        }
        Ok(keystore)
    }

    pub fn to_json(&self) -> KeystoreResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Derivation path, if the keystore declares one
    pub fn derivation_path(&self) -> Option<&str> {
        if self.path.is_empty() {
            None
        } else {
            Some(&self.path)
        }
    }

    /// Declared public key, if present
    pub fn declared_pubkey(&self) -> Option<&str> {
        if self.pubkey.is_empty() {
            None
        } else {
            Some(&self.pubkey)
        }
    }

    /// Decrypt the secret
    pub fn decrypt(&self, password: &str) -> KeystoreResult<SecretVec<u8>> {
        let derived_key = self.derive_key(password)?;

        if self.crypto.checksum.function != "sha256" {
            return Err(KeystoreError::UnsupportedChecksum(
                self.crypto.checksum.function.clone(),
            ));
        }
        if self.crypto.cipher.function != "aes-128-ctr" {
            return Err(KeystoreError::UnsupportedCipher(
                self.crypto.cipher.function.clone(),
            ));
        }

        let ciphertext = decode_hex("cipher.message", &self.crypto.cipher.message)?;
        let expected = decode_hex("checksum.message", &self.crypto.checksum.message)?;
        let computed = checksum(&derived_key, &ciphertext);
        if !constant_time_eq(&expected, &computed) {
            return Err(KeystoreError::InvalidPassword);
        }

        let params: CipherParams = serde_json::from_value(self.crypto.cipher.params.clone())
            .map_err(|e| KeystoreError::InvalidCipherParams(e.to_string()))?;
        let iv = decode_hex("cipher.params.iv", &params.iv)?;
        if iv.len() != IV_LEN {
            return Err(KeystoreError::InvalidCipherParams(format!(
                "IV must be {} bytes, got {}",
                IV_LEN,
                iv.len()
            )));
        }

        let mut plaintext = ciphertext;
        apply_aes_ctr(&derived_key[..16], &iv, &mut plaintext)?;
        Ok(SecretVec::new(plaintext))
    }

    fn derive_key(&self, password: &str) -> KeystoreResult<Zeroizing<Vec<u8>>> {
        let kdf = &self.crypto.kdf;
        if kdf.function != "scrypt" {
            return Err(KeystoreError::UnsupportedKdf(kdf.function.clone()));
        }

        let params: ScryptParams = serde_json::from_value(kdf.params.clone())
            .map_err(|e| KeystoreError::InvalidKdfParams(e.to_string()))?;
        if params.dklen < DKLEN || params.dklen > MAX_DKLEN {
            return Err(KeystoreError::InvalidKdfParams(format!(
                "dklen must be between {} and {}",
                DKLEN, MAX_DKLEN
            )));
        }
        if params.n < 2 || !params.n.is_power_of_two() {
            return Err(KeystoreError::InvalidKdfParams(
                "n must be a power of 2".to_string(),
            ));
        }
        let memory = 128 * u64::from(params.r) * u64::from(params.n);
        if params.r == 0 || memory > MAX_SCRYPT_MEMORY {
            return Err(KeystoreError::InvalidKdfParams(format!(
                "scrypt n={} r={} needs {} bytes, limit is {}",
                params.n, params.r, memory, MAX_SCRYPT_MEMORY
            )));
        }
        if params.p == 0 || params.p > MAX_SCRYPT_P {
            return Err(KeystoreError::InvalidKdfParams(format!(
                "scrypt p must be between 1 and {}",
                MAX_SCRYPT_P
            )));
        }
        let salt = decode_hex("kdf.params.salt", &params.salt)?;

        let log_n = params.n.trailing_zeros() as u8;
        let scrypt_params =
            scrypt::Params::new(log_n, params.r, params.p, params.dklen as usize)
                .map_err(|e| KeystoreError::InvalidKdfParams(e.to_string()))?;

        let password = normalize_password(password);
        let mut output = Zeroizing::new(vec![0u8; params.dklen as usize]);
        scrypt::scrypt(password.as_bytes(), &salt, &scrypt_params, &mut output)
            .map_err(|e| KeystoreError::InvalidKdfParams(e.to_string()))?;
        Ok(output)
    }
}

/// Builds keystores around an existing secret
pub struct KeystoreBuilder<'a> {
    secret: &'a [u8],
    password: &'a str,
    pubkey: String,
    path: String,
    scrypt_n: u32,
}

impl<'a> KeystoreBuilder<'a> {
    pub fn new(secret: &'a [u8], password: &'a str) -> Self {
        Self {
            secret,
            password,
            pubkey: String::new(),
            path: String::new(),
            scrypt_n: DEFAULT_SCRYPT_N,
        }
    }

    pub fn pubkey(mut self, pubkey: &str) -> Self {
        self.pubkey = pubkey.trim_start_matches("0x").to_string();
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = path.to_string();
        self
    }


    /// Override the scrypt cost (must be a power of two)
    pub fn scrypt_n(mut self, n: u32) -> Self {
        self.scrypt_n = n;
        self
    }

    pub fn build(self) -> KeystoreResult<Keystore> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut iv);

        let kdf = Module {
            function: "scrypt".to_string(),
            params: serde_json::to_value(ScryptParams {
                dklen: DKLEN,
                n: self.scrypt_n,
                r: SCRYPT_R,
                p: SCRYPT_P,
                salt: hex::encode(salt),
            })?,
            message: String::new(),
        };

        let mut keystore = Keystore {
            crypto: CryptoModule {
                kdf,
                checksum: Module {
                    function: "sha256".to_string(),
                    params: serde_json::json!({}),
                    message: String::new(),
                },
                cipher: Module {
                    function: "aes-128-ctr".to_string(),
                    params: serde_json::to_value(CipherParams { iv: hex::encode(iv) })?,
                    message: String::new(),
                },
            },
            description: None,
            pubkey: self.pubkey,
            path: self.path,
            uuid: Uuid::new_v4().to_string(),
            version: KEYSTORE_VERSION,
        };

        let derived_key = keystore.derive_key(self.password)?;
        let mut ciphertext = self.secret.to_vec();
        apply_aes_ctr(&derived_key[..16], &iv, &mut ciphertext)?;

        keystore.crypto.checksum.message = hex::encode(checksum(&derived_key, &ciphertext));
        keystore.crypto.cipher.message = hex::encode(&ciphertext);
        Ok(keystore)
    }
}

fn checksum(derived_key: &[u8], ciphertext: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(&derived_key[16..32]);
    hasher.update(ciphertext);
    hasher.finalize().to_vec()
}

fn apply_aes_ctr(key: &[u8], iv: &[u8], buf: &mut [u8]) -> KeystoreResult<()> {
    let mut cipher = Aes128Ctr::new_from_slices(key, iv)
        .map_err(|e| KeystoreError::InvalidCipherParams(e.to_string()))?;
    cipher.apply_keystream(buf);
    Ok(())
}

fn decode_hex(field: &'static str, value: &str) -> KeystoreResult<Vec<u8>> {
    hex::decode(value.trim_start_matches("0x")).map_err(|e| KeystoreError::Hex {
        field,
        reason: e.to_string(),
    })
}

/// Strip C0, C1 and DEL control codes, as EIP-2335 requires
fn normalize_password(password: &str) -> Zeroizing<String> {
    Zeroizing::new(
        password
            .chars()
            .filter(|c| {
                let cp = *c as u32;
                !(cp <= 0x1f || (0x7f..=0x9f).contains(&cp))
            })
            .collect(),
    )
}

// Keep tests cheap: scrypt at 2^4
#[cfg(test)]
pub(crate) const TEST_SCRYPT_N: u32 = 16;
