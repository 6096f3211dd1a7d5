//! Keystore decryption
//!
//! The import path only sees keystores through [`Decryptor`], so the
//! encryption scheme can be swapped without touching the coordinators.

use crate::crypto::{PublicKey, SecretHandle};
use crate::keystore::eip2335::{Keystore, KeystoreError, KeystoreResult};
use secrecy::ExposeSecret;

/// Output of a successful decryption
#[derive(Debug)]
pub struct DecryptedKey {
    pub secret: SecretHandle,
    pub derivation_path: Option<String>,
}

impl DecryptedKey {
    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }
}

/// Turns a keystore document and its password into key material
pub trait Decryptor: Send + Sync {
    fn decrypt(&self, keystore_json: &str, password: &str) -> KeystoreResult<DecryptedKey>;
}

/// EIP-2335 decryptor for BLS12-381 validator keys
#[derive(Debug, Default, Clone, Copy)]
pub struct Eip2335Decryptor;

impl Decryptor for Eip2335Decryptor {
    fn decrypt(&self, keystore_json: &str, password: &str) -> KeystoreResult<DecryptedKey> {
        let keystore = Keystore::from_json(keystore_json)?;
        let plaintext = keystore.decrypt(password)?;

        let secret = SecretHandle::from_bytes(plaintext.expose_secret())
            .map_err(|e| KeystoreError::InvalidSecret(e.to_string()))?;

        if let Some(declared) = keystore.declared_pubkey() {
            let derived = secret.public_key();
            match PublicKey::from_hex(declared) {
                Ok(pk) if pk == derived => {}
                _ => {
                    return Err(KeystoreError::PublicKeyMismatch {
                        declared: declared.to_string(),
                        derived: derived.to_hex(),
                    })
                }
            }
        }

        Ok(DecryptedKey {
            secret,
            derivation_path: keystore.derivation_path().map(str::to_string),
        })
    }
}
