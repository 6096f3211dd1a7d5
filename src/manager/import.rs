//! Batch keystore import
//!
//! Keystores are decrypted in parallel, then applied one at a time in input
//! order. For each new key the slashing protection record is written before
//! the key is activated, so no key can sign without a protection baseline.

use crate::crypto::PublicKey;
use crate::errors::{KeyManagerError, Result};
use crate::keystore::{DecryptedKey, Decryptor, KeyStore, KeystoreError, KeystoreResult};
use crate::locks::PubkeyLocks;
use crate::manager::status::ImportStatus;
use crate::slashing::{Interchange, SlashingProtectionStore};
use secrecy::{ExposeSecret, SecretString};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct ImportCoordinator {
    key_store: Arc<KeyStore>,
    slashing: Arc<SlashingProtectionStore>,
    decryptor: Arc<dyn Decryptor>,
    locks: Arc<PubkeyLocks>,
}

impl ImportCoordinator {
    pub fn new(
        key_store: Arc<KeyStore>,
        slashing: Arc<SlashingProtectionStore>,
        decryptor: Arc<dyn Decryptor>,
        locks: Arc<PubkeyLocks>,
    ) -> Self {
        Self {
            key_store,
            slashing,
            decryptor,
            locks,
        }
    }

    /// Import a batch of keystores, returning one status per keystore.
    ///
    /// Fails as a whole only when the request itself is malformed: mismatched
    /// lengths, or a protection payload that does not parse or belongs to
    /// another chain. Nothing is mutated in that case.
    pub fn import_keystores(
        &self,
        keystores: &[String],
        passwords: &[SecretString],
        slashing_protection: Option<&str>,
    ) -> Result<Vec<ImportStatus>> {
        if keystores.len() != passwords.len() {
            return Err(KeyManagerError::BadRequest(format!(
                "{} keystores but {} passwords",
                keystores.len(),
                passwords.len()
            )));
        }

        let interchange = self.parse_protection(slashing_protection)?;

        let decrypted = self.decrypt_all(keystores, passwords);

        let statuses: Vec<ImportStatus> = decrypted
            .into_iter()
            .enumerate()
            .map(|(index, result)| match result {
                Ok(key) => self.import_one(key, interchange.as_ref()),
                Err(e) => {
                    warn!("Keystore {} could not be decrypted: {}", index, e);
                    ImportStatus::Error(e.to_string())
                }
            })
            .collect();

        let imported = statuses
            .iter()
            .filter(|s| **s == ImportStatus::Imported)
            .count();
        info!("Imported {}/{} keystores", imported, statuses.len());

        Ok(statuses)
    }

    fn parse_protection(&self, payload: Option<&str>) -> Result<Option<Interchange>> {
        let Some(payload) = payload.filter(|p| !p.trim().is_empty()) else {
            return Ok(None);
        };

        let interchange = Interchange::from_json(payload)?;
        let expected = self.slashing.genesis_validators_root();
        if interchange.genesis_validators_root() != expected {
            return Err(KeyManagerError::GenesisRootMismatch {
                expected: expected.to_hex(),
                found: interchange.genesis_validators_root().to_hex(),
            });
        }
        Ok(Some(interchange))
    }

    /// Decrypt every keystore, spreading the work over a few threads.
    /// Results are in input order.
    fn decrypt_all(
        &self,
        keystores: &[String],
        passwords: &[SecretString],
    ) -> Vec<KeystoreResult<DecryptedKey>> {
        if keystores.is_empty() {
            return Vec::new();
        }

        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(keystores.len());
        let chunk_size = keystores.len().div_ceil(workers);
        let decryptor = self.decryptor.as_ref();

        thread::scope(|scope| {
            let handles: Vec<_> = keystores
                .chunks(chunk_size)
                .zip(passwords.chunks(chunk_size))
                .map(|(keystores, passwords)| {
                    let len = keystores.len();
                    let handle = scope.spawn(move || {
                        keystores
                            .iter()
                            .zip(passwords)
                            .map(|(json, password)| {
                                decryptor.decrypt(json, password.expose_secret())
                            })
                            .collect::<Vec<_>>()
                    });
                    (len, handle)
                })
                .collect();

            handles
                .into_iter()
                .flat_map(|(len, handle)| {
                    handle.join().unwrap_or_else(|_| {
                        (0..len)
                            .map(|_| {
                                Err(KeystoreError::InvalidSecret(
                                    "decryption worker panicked".to_string(),
                                ))
                            })
                            .collect()
                    })
                })
                .collect()
        })
    }

    fn import_one(&self, key: DecryptedKey, interchange: Option<&Interchange>) -> ImportStatus {
        let pubkey = key.public_key();
        let _guard = self.locks.lock(&pubkey);

        if self.key_store.contains(&pubkey) {
            debug!("Key {} is already active", pubkey);
            return ImportStatus::Duplicate;
        }

        // Step 1: protection history, durably
        if let Err(e) = self.record_protection(&pubkey, interchange) {
            warn!("Failed to record slashing protection for {}: {}", pubkey, e);
            return ImportStatus::Error(e.to_string());
        }

        // Step 2: activation
        match self.key_store.add(key.secret, key.derivation_path) {
            Ok(_) => ImportStatus::Imported,
            Err(KeyManagerError::DuplicateKey(_)) => ImportStatus::Duplicate,
            Err(e) => {
                warn!("Failed to activate {}: {}", pubkey, e);
                ImportStatus::Error(e.to_string())
            }
        }
    }

    fn record_protection(&self, pubkey: &PublicKey, interchange: Option<&Interchange>) -> Result<()> {
        match interchange {
            Some(interchange) => self.slashing.merge_for(pubkey, interchange),
            None => self.slashing.register(pubkey),
        }
    }
}
