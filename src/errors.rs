//! Error types for keymanager

use thiserror::Error;

/// Main error type for keymanager operations
#[derive(Error, Debug)]
pub enum KeyManagerError {
    // Key management errors
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Key already exists: {0}")]
    DuplicateKey(String),

    #[error("Key is readonly: {0}")]
    ReadOnlyKey(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid secret key: {0}")]
    InvalidSecretKey(String),

    // Cryptographic errors
    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    // Slashing protection errors
    #[error("Invalid slashing protection data: {0}")]
    Parse(String),

    #[error("Genesis validators root mismatch: expected {expected}, got {found}")]
    GenesisRootMismatch { expected: String, found: String },

    #[error("Refusing to sign slashable block: {0}")]
    SlashableBlock(String),

    #[error("Refusing to sign slashable attestation: {0}")]
    SlashableAttestation(String),

    // Storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    // Request errors
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl KeyManagerError {
    /// True for errors that reject a whole request rather than a single item
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            KeyManagerError::BadRequest(_)
                | KeyManagerError::Parse(_)
                | KeyManagerError::GenesisRootMismatch { .. }
        )
    }
}

impl From<std::io::Error> for KeyManagerError {
    fn from(err: std::io::Error) -> Self {
        KeyManagerError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for KeyManagerError {
    fn from(err: serde_json::Error) -> Self {
        KeyManagerError::Persistence(format!("JSON error: {}", err))
    }
}

impl From<hex::FromHexError> for KeyManagerError {
    fn from(err: hex::FromHexError) -> Self {
        KeyManagerError::InvalidPublicKey(format!("Hex decode error: {}", err))
    }
}

impl From<crate::keystore::KeystoreError> for KeyManagerError {
    fn from(err: crate::keystore::KeystoreError) -> Self {
        KeyManagerError::Decryption(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KeyManagerError>;
