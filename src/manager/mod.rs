//! Key lifecycle service
//!
//! [`KeyManager`] owns both stores and the per-key lock table shared by the
//! import and deletion coordinators. Mutations of one public key from
//! concurrent requests are serialized; unrelated keys proceed in parallel.

pub mod delete;
pub mod import;
pub mod status;

pub use delete::{DeleteOutcome, DeletionCoordinator};
pub use import::ImportCoordinator;
pub use status::{DeletionStatus, ImportStatus};

use crate::errors::{KeyManagerError, Result};
use crate::keystore::{Decryptor, KeyInfo, KeyStore};
use crate::locks::PubkeyLocks;
use crate::slashing::SlashingProtectionStore;
use secrecy::SecretString;
use std::sync::Arc;

/// Owning service for the key store and slashing protection store
pub struct KeyManager {
    key_store: Arc<KeyStore>,
    slashing: Arc<SlashingProtectionStore>,
    importer: ImportCoordinator,
    deleter: DeletionCoordinator,
}

impl KeyManager {
    pub fn new(
        key_store: Arc<KeyStore>,
        slashing: Arc<SlashingProtectionStore>,
        decryptor: Arc<dyn Decryptor>,
    ) -> Self {
        let locks = Arc::new(PubkeyLocks::new());
        let importer = ImportCoordinator::new(
            key_store.clone(),
            slashing.clone(),
            decryptor,
            locks.clone(),
        );
        let deleter = DeletionCoordinator::new(key_store.clone(), slashing.clone(), locks);

        Self {
            key_store,
            slashing,
            importer,
            deleter,
        }
    }

    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.key_store
    }

    pub fn slashing(&self) -> &Arc<SlashingProtectionStore> {
        &self.slashing
    }

    pub fn importer(&self) -> &ImportCoordinator {
        &self.importer
    }

    pub fn deleter(&self) -> &DeletionCoordinator {
        &self.deleter
    }

    /// Active keys in activation order
    pub fn list_keys(&self) -> Vec<KeyInfo> {
        self.key_store.list()
    }

    /// Import a batch on the blocking pool
    pub async fn import_keystores(
        &self,
        keystores: Vec<String>,
        passwords: Vec<SecretString>,
        slashing_protection: Option<String>,
    ) -> Result<Vec<ImportStatus>> {
        let importer = self.importer.clone();
        tokio::task::spawn_blocking(move || {
            importer.import_keystores(&keystores, &passwords, slashing_protection.as_deref())
        })
        .await
        .map_err(|e| KeyManagerError::InternalError(format!("import task failed: {}", e)))?
    }

    /// Delete a batch on the blocking pool
    pub async fn delete_keystores(&self, pubkeys: Vec<String>) -> Result<DeleteOutcome> {
        let deleter = self.deleter.clone();
        tokio::task::spawn_blocking(move || deleter.delete_keystores(&pubkeys))
            .await
            .map_err(|e| KeyManagerError::InternalError(format!("delete task failed: {}", e)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for coordinator tests

    use super::*;
    use crate::crypto::{PublicKey, Root, SecretHandle};
    use crate::keystore::eip2335::{KeystoreBuilder, TEST_SCRYPT_N};
    use crate::keystore::{Eip2335Decryptor, KdfCost};
    use crate::persistence::testing::FaultyStore;

    pub struct Fixture {
        pub keys: Arc<FaultyStore>,
        pub records: Arc<FaultyStore>,
        pub key_store: Arc<KeyStore>,
        pub slashing: Arc<SlashingProtectionStore>,
        pub manager: KeyManager,
    }

    impl Fixture {
        pub fn new() -> Self {
            let keys = Arc::new(FaultyStore::new());
            let records = Arc::new(FaultyStore::new());
            let key_store = Arc::new(KeyStore::new(
                keys.clone(),
                SecretString::new("master".to_string()),
                KdfCost::insecure_for_tests(),
            ));
            let slashing = Arc::new(
                SlashingProtectionStore::open(records.clone(), Root::new([0x11; 32])).unwrap(),
            );
            let manager = KeyManager::new(
                key_store.clone(),
                slashing.clone(),
                Arc::new(Eip2335Decryptor),
            );

            Self {
                keys,
                records,
                key_store,
                slashing,
                manager,
            }
        }

        pub fn importer(&self) -> &ImportCoordinator {
            self.manager.importer()
        }

        pub fn deleter(&self) -> &DeletionCoordinator {
            self.manager.deleter()
        }
    }

    /// EIP-2335 keystore for a deterministic key
    pub fn keystore_json(seed: u8, password: &str) -> (String, PublicKey) {
        let sk = SecretHandle::from_seed(&[seed; 32]).unwrap();
        let pk = sk.public_key();
        let json = KeystoreBuilder::new(sk.to_bytes().as_ref(), password)
            .pubkey(&pk.file_stem())
            .path(&format!("m/12381/3600/{}/0/0", seed))
            .scrypt_n(TEST_SCRYPT_N)
            .build()
            .unwrap()
            .to_json()
            .unwrap();
        (json, pk)
    }

    pub fn password(s: &str) -> SecretString {
        SecretString::new(s.to_string())
    }
}
