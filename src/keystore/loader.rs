//! Key loader
//!
//! Restores keys into the active store at startup: keys imported earlier are
//! read back from encrypted storage, and operator keystores are loaded
//! readonly. A key is only activated once it has a slashing protection record.

use crate::crypto::PublicKey;
use crate::errors::{KeyManagerError, Result};
use crate::keystore::decryptor::Decryptor;
use crate::keystore::eip2335::Keystore;
use crate::keystore::encrypted::EncryptedKeyFile;
use crate::keystore::memory::{KeyInfo, KeyStore};
use crate::persistence::Persistence;
use crate::slashing::SlashingProtectionStore;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Loads persisted and operator-supplied keys into a [`KeyStore`]
pub struct KeyLoader {
    persistence: Arc<dyn Persistence>,
    key_store: Arc<KeyStore>,
    slashing: Arc<SlashingProtectionStore>,
    decryptor: Arc<dyn Decryptor>,
}

impl KeyLoader {
    /// Create a new key loader. `persistence` must be the key store's backing store.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        key_store: Arc<KeyStore>,
        slashing: Arc<SlashingProtectionStore>,
        decryptor: Arc<dyn Decryptor>,
    ) -> Self {
        Self {
            persistence,
            key_store,
            slashing,
            decryptor,
        }
    }

    /// Reactivate every key persisted by earlier imports
    pub fn load_persisted(&self) -> Result<Vec<KeyInfo>> {
        let names = self.persistence.list()?;
        let mut loaded = Vec::new();
        let mut failed = Vec::new();

        info!("Found {} encrypted keys to load", names.len());

        for name in &names {
            match self.load_persisted_key(name) {
                Ok(info) => loaded.push(info),
                Err(e) => {
                    error!("Failed to load key {}: {}", name, e);
                    failed.push(name.clone());
                }
            }
        }

        if !failed.is_empty() {
            warn!("Failed to load {} keys: {:?}", failed.len(), failed);
        }

        info!("Successfully loaded {}/{} keys", loaded.len(), names.len());
        Ok(loaded)
    }

    fn load_persisted_key(&self, name: &str) -> Result<KeyInfo> {
        debug!("Loading key: {}", name);

        let bytes = self
            .persistence
            .get(name)?
            .ok_or_else(|| KeyManagerError::KeyNotFound(name.to_string()))?;
        let file = EncryptedKeyFile::from_bytes(&bytes)?;

        if file.pubkey.file_stem() != name {
            return Err(KeyManagerError::Decryption(format!(
                "document {} holds key {}",
                name, file.pubkey
            )));
        }

        // Never activate a key without a protection record
        if !self.slashing.has_record(&file.pubkey) {
            warn!("No slashing protection record for {}, creating one", file.pubkey);
            self.slashing.register(&file.pubkey)?;
        }

        self.key_store.restore(&file)
    }

    /// Load operator keystores from `keystores_dir` as readonly keys.
    ///
    /// Each keystore's password is read from `secrets_dir/<pubkey>`.
    pub fn load_readonly(
        &self,
        keystores_dir: impl AsRef<Path>,
        secrets_dir: impl AsRef<Path>,
    ) -> Result<Vec<KeyInfo>> {
        let keystores_dir = keystores_dir.as_ref();
        let secrets_dir = secrets_dir.as_ref();
        let mut loaded = Vec::new();
        let mut found = 0usize;

        let mut paths: Vec<_> = fs::read_dir(keystores_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |ext| ext == "json"))
            .collect();
        paths.sort();

        for path in &paths {
            found += 1;
            match self.load_readonly_key(path, secrets_dir) {
                Ok(info) => loaded.push(info),
                Err(e) => error!("Failed to load readonly keystore {:?}: {}", path, e),
            }
        }

        info!(
            "Loaded {}/{} readonly keystores from {:?}",
            loaded.len(),
            found,
            keystores_dir
        );
        Ok(loaded)
    }

    fn load_readonly_key(&self, path: &Path, secrets_dir: &Path) -> Result<KeyInfo> {
        let json = Zeroizing::new(fs::read_to_string(path)?);

        let declared = Keystore::from_json(&json)?
            .declared_pubkey()
            .map(PublicKey::from_hex)
            .transpose()?
            .ok_or_else(|| {
                KeyManagerError::InvalidPublicKey(format!("{:?} declares no pubkey", path))
            })?;

        let password_path = secrets_dir.join(declared.to_hex());
        let password = Zeroizing::new(fs::read_to_string(&password_path).map_err(|e| {
            KeyManagerError::ConfigError(format!(
                "cannot read password {:?}: {}",
                password_path, e
            ))
        })?);
        let password = password.trim_end_matches(['\n', '\r']);

        let key = self.decryptor.decrypt(&json, password)?;
        let pubkey = key.public_key();

        if !self.slashing.has_record(&pubkey) {
            self.slashing.register(&pubkey)?;
        }

        self.key_store.add_readonly(key.secret, key.derivation_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Root, SecretHandle};
    use crate::keystore::decryptor::Eip2335Decryptor;
    use crate::keystore::eip2335::{KeystoreBuilder, TEST_SCRYPT_N};
    use crate::keystore::encrypted::KdfCost;
    use crate::persistence::testing::FaultyStore;
    use crate::persistence::FileStore;
    use secrecy::SecretString;
    use tempfile::tempdir;

    struct Fixture {
        keys: Arc<dyn Persistence>,
        key_store: Arc<KeyStore>,
        slashing: Arc<SlashingProtectionStore>,
    }

    impl Fixture {
        fn new(keys: Arc<dyn Persistence>, slashing: Arc<dyn Persistence>) -> Self {
            let key_store = Arc::new(KeyStore::new(
                keys.clone(),
                SecretString::new("master".to_string()),
                KdfCost::insecure_for_tests(),
            ));
            let slashing =
                Arc::new(SlashingProtectionStore::open(slashing, Root::new([1u8; 32])).unwrap());
            Self {
                keys,
                key_store,
                slashing,
            }
        }

        fn loader(&self) -> KeyLoader {
            KeyLoader::new(
                self.keys.clone(),
                self.key_store.clone(),
                self.slashing.clone(),
                Arc::new(Eip2335Decryptor),
            )
        }
    }

    #[test]
    fn test_reload_keys() {
        let dir = tempdir().unwrap();
        let keys_dir = dir.path().join("keys");
        let slashing_dir = dir.path().join("slashing");

        let (a, b) = {
            let fx = Fixture::new(
                Arc::new(FileStore::open(&keys_dir).unwrap()),
                Arc::new(FileStore::open(&slashing_dir).unwrap()),
            );
            let sk_a = SecretHandle::from_seed(&[1u8; 32]).unwrap();
            let sk_b = SecretHandle::from_seed(&[2u8; 32]).unwrap();
            let (a, b) = (sk_a.public_key(), sk_b.public_key());
            fx.slashing.register(&a).unwrap();
            fx.slashing.register(&b).unwrap();
            fx.key_store.add(sk_a, None).unwrap();
            fx.key_store.add(sk_b, Some("m/1".to_string())).unwrap();
            (a, b)
        };

        // Simulating restart
        let fx = Fixture::new(
            Arc::new(FileStore::open(&keys_dir).unwrap()),
            Arc::new(FileStore::open(&slashing_dir).unwrap()),
        );
        let loaded = fx.loader().load_persisted().unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(fx.key_store.contains(&a));
        assert_eq!(
            fx.key_store.get(&b).unwrap().derivation_path.as_deref(),
            Some("m/1")
        );
    }

    #[test]
    fn test_corrupt_document_is_skipped() {
        let keys = Arc::new(FaultyStore::new());
        let fx = Fixture::new(keys.clone(), Arc::new(FaultyStore::new()));
        keys.put("garbage", b"not json").unwrap();

        let loaded = fx.loader().load_persisted().unwrap();
        assert!(loaded.is_empty());
        assert!(fx.key_store.is_empty());
    }

    #[test]
    fn test_missing_record_is_created_before_activation() {
        let keys = Arc::new(FaultyStore::new());
        let sk = SecretHandle::from_seed(&[3u8; 32]).unwrap();
        let pk = sk.public_key();
        let file =
            EncryptedKeyFile::seal(&sk, None, "master", KdfCost::insecure_for_tests()).unwrap();
        keys.put(&pk.file_stem(), &file.to_bytes().unwrap()).unwrap();

        let fx = Fixture::new(keys, Arc::new(FaultyStore::new()));
        fx.loader().load_persisted().unwrap();
        assert!(fx.slashing.has_record(&pk));
        assert!(fx.key_store.contains(&pk));
    }

    #[test]
    fn test_failed_add_is_not_reactivated() {
        let keys = Arc::new(FaultyStore::new());
        let sk = SecretHandle::from_seed(&[5u8; 32]).unwrap();
        let pk = sk.public_key();
        {
            let fx = Fixture::new(keys.clone(), Arc::new(FaultyStore::new()));
            keys.set_fail_after_put(true);
            assert!(fx.key_store.add(sk, None).is_err());
            keys.set_fail_after_put(false);
        }

        let fx = Fixture::new(keys, Arc::new(FaultyStore::new()));
        let loaded = fx.loader().load_persisted().unwrap();
        assert!(loaded.is_empty());
        assert!(!fx.key_store.contains(&pk));
    }

    #[test]
    fn test_load_readonly() {
        let dir = tempdir().unwrap();
        let keystores = dir.path().join("keystores");
        let secrets = dir.path().join("secrets");
        fs::create_dir_all(&keystores).unwrap();
        fs::create_dir_all(&secrets).unwrap();

        let sk = SecretHandle::from_seed(&[4u8; 32]).unwrap();
        let pk = sk.public_key();
        let json = KeystoreBuilder::new(sk.to_bytes().as_ref(), "operator")
            .pubkey(&pk.file_stem())
            .scrypt_n(TEST_SCRYPT_N)
            .build()
            .unwrap()
            .to_json()
            .unwrap();
        fs::write(keystores.join("keystore-0.json"), json).unwrap();
        fs::write(secrets.join(pk.to_hex()), "operator\n").unwrap();

        let fx = Fixture::new(Arc::new(FaultyStore::new()), Arc::new(FaultyStore::new()));
        let loaded = fx.loader().load_readonly(&keystores, &secrets).unwrap();

        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].readonly);
        assert!(fx.slashing.has_record(&pk));
        assert!(matches!(
            fx.key_store.remove(&pk),
            Err(KeyManagerError::ReadOnlyKey(_))
        ));
    }
}
