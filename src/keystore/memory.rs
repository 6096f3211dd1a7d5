//! Active key store
//!
//! Holds the decrypted keys that are allowed to sign. Every non-readonly key
//! is backed by an encrypted document; the document is written before the key
//! becomes visible and removed before the key is dropped.

use crate::crypto::{PublicKey, SecretHandle};
use crate::errors::{KeyManagerError, Result};
use crate::keystore::encrypted::{EncryptedKeyFile, KdfCost};
use crate::locks::PubkeyLocks;
use crate::persistence::Persistence;
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Metadata about an active key. Never carries secret material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub pubkey: PublicKey,
    pub derivation_path: Option<String>,
    pub readonly: bool,
    pub created_at: i64,
}

/// A loaded key in memory
struct ActiveKey {
    info: KeyInfo,
    secret: SecretHandle,
}

#[derive(Default)]
struct Entries {
    keys: HashMap<PublicKey, ActiveKey>,
    /// Insertion order
    order: Vec<PublicKey>,
}

/// Authoritative map of signing-capable keys
pub struct KeyStore {
    persistence: Arc<dyn Persistence>,
    master_password: SecretString,
    kdf: KdfCost,
    locks: PubkeyLocks,
    entries: RwLock<Entries>,
}

impl KeyStore {
    /// Create an empty key store over `persistence`
    pub fn new(
        persistence: Arc<dyn Persistence>,
        master_password: SecretString,
        kdf: KdfCost,
    ) -> Self {
        Self {
            persistence,
            master_password,
            kdf,
            locks: PubkeyLocks::new(),
            entries: RwLock::new(Entries::default()),
        }
    }

    /// Durably add a key. Fails with `DuplicateKey` if already active.
    pub fn add(&self, secret: SecretHandle, derivation_path: Option<String>) -> Result<KeyInfo> {
        let pubkey = secret.public_key();
        let _guard = self.locks.lock(&pubkey);

        if self.contains(&pubkey) {
            return Err(KeyManagerError::DuplicateKey(pubkey.to_hex()));
        }

        let file = EncryptedKeyFile::seal(
            &secret,
            derivation_path.clone(),
            self.master_password.expose_secret(),
            self.kdf,
        )?;
        let stem = pubkey.file_stem();
        if let Err(e) = self.persistence.put(&stem, &file.to_bytes()?) {
            // The document may be in place even though the write failed
            match self.persistence.delete(&stem) {
                Ok(()) | Err(KeyManagerError::KeyNotFound(_)) => {}
                Err(cleanup) => {
                    warn!("Could not remove partial key document {}: {}", stem, cleanup)
                }
            }
            return Err(e);
        }

        let info = KeyInfo {
            pubkey,
            derivation_path,
            readonly: false,
            created_at: file.created_at,
        };
        self.insert(info.clone(), secret);

        info!("Activated key {}", pubkey);
        Ok(info)
    }

    /// Add an operator-supplied key that may not be deleted. Not persisted.
    pub fn add_readonly(
        &self,
        secret: SecretHandle,
        derivation_path: Option<String>,
    ) -> Result<KeyInfo> {
        let pubkey = secret.public_key();
        let _guard = self.locks.lock(&pubkey);

        if self.contains(&pubkey) {
            return Err(KeyManagerError::DuplicateKey(pubkey.to_hex()));
        }

        let info = KeyInfo {
            pubkey,
            derivation_path,
            readonly: true,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.insert(info.clone(), secret);

        info!("Activated readonly key {}", pubkey);
        Ok(info)
    }

    /// Reactivate a key from its persisted document
    pub(crate) fn restore(&self, file: &EncryptedKeyFile) -> Result<KeyInfo> {
        let secret = file.open(self.master_password.expose_secret())?;
        let pubkey = secret.public_key();
        let _guard = self.locks.lock(&pubkey);

        if self.contains(&pubkey) {
            return Err(KeyManagerError::DuplicateKey(pubkey.to_hex()));
        }

        let info = KeyInfo {
            pubkey,
            derivation_path: file.derivation_path.clone(),
            readonly: false,
            created_at: file.created_at,
        };
        self.insert(info.clone(), secret);

        debug!("Restored key {}", pubkey);
        Ok(info)
    }

    /// Revoke a key. The persisted document is removed first; if that fails
    /// the key stays active.
    pub fn remove(&self, pubkey: &PublicKey) -> Result<KeyInfo> {
        let _guard = self.locks.lock(pubkey);

        let info = self
            .get(pubkey)
            .ok_or_else(|| KeyManagerError::KeyNotFound(pubkey.to_hex()))?;

        if info.readonly {
            return Err(KeyManagerError::ReadOnlyKey(pubkey.to_hex()));
        }

        match self.persistence.delete(&pubkey.file_stem()) {
            Ok(()) | Err(KeyManagerError::KeyNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let removed = {
            let mut entries = self.entries.write();
            entries.order.retain(|pk| pk != pubkey);
            entries.keys.remove(pubkey)
        };
        // Dropping the handle zeroizes the scalar
        drop(removed);

        info!("Revoked key {}", pubkey);
        Ok(info)
    }

    /// Get key info
    pub fn get(&self, pubkey: &PublicKey) -> Option<KeyInfo> {
        self.entries.read().keys.get(pubkey).map(|k| k.info.clone())
    }

    /// Check if a key is active
    pub fn contains(&self, pubkey: &PublicKey) -> bool {
        self.entries.read().keys.contains_key(pubkey)
    }

    /// List active keys in insertion order
    pub fn list(&self) -> Vec<KeyInfo> {
        let entries = self.entries.read();
        entries
            .order
            .iter()
            .filter_map(|pk| entries.keys.get(pk))
            .map(|k| k.info.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` with the key's secret.
    ///
    /// The store's read side is held for the duration of `f`, so `remove`
    /// cannot complete while a signature is in flight.
    pub fn with_secret<T>(
        &self,
        pubkey: &PublicKey,
        f: impl FnOnce(&SecretHandle) -> Result<T>,
    ) -> Result<T> {
        let entries = self.entries.read();
        let key = entries
            .keys
            .get(pubkey)
            .ok_or_else(|| KeyManagerError::KeyNotFound(pubkey.to_hex()))?;
        f(&key.secret)
    }

    fn insert(&self, info: KeyInfo, secret: SecretHandle) {
        let mut entries = self.entries.write();
        entries.order.push(info.pubkey);
        entries.keys.insert(info.pubkey, ActiveKey { info, secret });
    }
}
