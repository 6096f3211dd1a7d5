//! Key storage and management
//!
//! This module provides:
//! - EIP-2335 keystore decoding and decryption
//! - Encrypted storage of active keys at rest
//! - The in-memory store of signing-capable keys
//! - Startup loading of persisted and readonly keys

pub mod decryptor;
pub mod eip2335;
pub mod encrypted;
pub mod loader;
pub mod memory;

pub use decryptor::{DecryptedKey, Decryptor, Eip2335Decryptor};
pub use eip2335::{Keystore, KeystoreBuilder, KeystoreError, KeystoreResult};
pub use encrypted::{EncryptedKeyFile, KdfCost};
pub use loader::KeyLoader;
pub use memory::{KeyInfo, KeyStore};
