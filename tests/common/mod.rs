//! Shared helpers for integration tests

#![allow(dead_code)]

use keymanager::crypto::{PublicKey, Root};
use keymanager::keystore::{Eip2335Decryptor, KdfCost, KeyLoader, KeyStore, KeystoreBuilder};
use keymanager::persistence::FileStore;
use keymanager::slashing::SlashingProtectionStore;
use keymanager::KeyManager;
use secrecy::SecretString;
use std::path::Path;
use std::sync::Arc;

pub const GENESIS_ROOT: [u8; 32] = [0x42; 32];

/// Low scrypt cost so keystores decrypt quickly
pub const SCRYPT_N: u32 = 16;

/// EIP-2335 keystore for the key derived from `seed`
pub fn keystore(seed: u8, password: &str) -> (String, PublicKey) {
    let sk = blst::min_pk::SecretKey::key_gen(&[seed; 32], &[]).unwrap();
    let pubkey = PublicKey::from_bytes(&sk.sk_to_pk().to_bytes()).unwrap();
    let json = KeystoreBuilder::new(&sk.to_bytes(), password)
        .pubkey(&pubkey.file_stem())
        .path(&format!("m/12381/3600/{}/0/0", seed))
        .scrypt_n(SCRYPT_N)
        .build()
        .unwrap()
        .to_json()
        .unwrap();
    (json, pubkey)
}

pub fn secret(s: &str) -> SecretString {
    SecretString::new(s.to_string())
}

/// A manager backed by real files under `dir`, restoring anything persisted
/// there by an earlier instance
pub fn open_manager(dir: &Path) -> KeyManager {
    let key_files = Arc::new(FileStore::open(dir.join("keys")).unwrap());
    let record_files = Arc::new(FileStore::open(dir.join("slashing")).unwrap());

    let slashing =
        Arc::new(SlashingProtectionStore::open(record_files, Root::new(GENESIS_ROOT)).unwrap());
    let key_store = Arc::new(KeyStore::new(
        key_files.clone(),
        secret("master password"),
        KdfCost::insecure_for_tests(),
    ));
    let decryptor = Arc::new(Eip2335Decryptor);

    KeyLoader::new(key_files, key_store.clone(), slashing.clone(), decryptor.clone())
        .load_persisted()
        .unwrap();

    KeyManager::new(key_store, slashing, decryptor)
}
