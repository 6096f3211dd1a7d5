//! keymanager - validator key lifecycle service
//!
//! Holds BLS validator keys for a consensus client and manages them through
//! the standard keymanager REST API:
//! - Imports EIP-2335 keystores together with EIP-3076 slashing protection
//! - Deletes keys and returns their slashing protection history
//! - Keeps every imported key encrypted at rest
//!
//! A key that was reported deleted is never used to sign again, and a key is
//! only activated once its slashing protection record is durable.

pub mod api;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod keystore;
pub mod locks;
pub mod manager;
pub mod persistence;
pub mod security;
pub mod signer;
pub mod slashing;

pub use errors::{KeyManagerError, Result};
pub use manager::KeyManager;
