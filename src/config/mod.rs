//! Configuration management for keymanager
//!
//! Supports loading configuration from:
//! - Environment variables (KEYMANAGER__*)
//! - Config file (keymanager.toml)
//! - Command line (`--config`)

use crate::crypto::Root;
use crate::errors::{KeyManagerError, Result};
use crate::keystore::KdfCost;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Environment variable holding the master password
pub const MASTER_PASSWORD_ENV: &str = "KEYMANAGER_MASTER_PASSWORD";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Slashing protection configuration
    pub slashing: SlashingConfig,

    /// API authentication
    pub auth: AuthConfig,

    /// Operator-managed readonly keystores
    pub readonly: ReadonlyConfig,

    /// Security configuration
    pub security: SecurityConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server (HTTP) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for TCP
    pub listen_addr: String,

    /// Port number
    pub port: u16,

    /// Largest accepted request body
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1".to_string(),
            port: 5062,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Encrypted active keys, one document per validator
    pub keys_dir: PathBuf,

    /// Slashing protection records
    pub slashing_dir: PathBuf,

    /// Argon2id memory cost in KiB
    pub kdf_memory_kib: u32,

    /// Argon2id passes
    pub kdf_iterations: u32,

    /// Argon2id parallelism
    pub kdf_lanes: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let kdf = KdfCost::default();
        Self {
            keys_dir: PathBuf::from("./data/keys"),
            slashing_dir: PathBuf::from("./data/slashing-protection"),
            kdf_memory_kib: kdf.memory_kib,
            kdf_iterations: kdf.iterations,
            kdf_lanes: kdf.lanes,
        }
    }
}

/// Slashing protection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlashingConfig {
    /// Genesis validators root of the chain this node signs for
    pub genesis_validators_root: String,
}

impl Default for SlashingConfig {
    fn default() -> Self {
        Self {
            // Ethereum mainnet
            genesis_validators_root:
                "0x4b363db94e286120d76eb905340fdd4e54bfe9f06bf33ff6cf5ad27f511bfe95".to_string(),
        }
    }
}

/// API authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Require a bearer token
    pub enabled: bool,

    /// Token file; generated on first start if missing
    pub token_path: PathBuf,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token_path: PathBuf::from("./data/api-token.txt"),
        }
    }
}

/// Readonly keystores loaded at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadonlyConfig {
    /// Directory of EIP-2335 keystores
    pub keystores_dir: Option<PathBuf>,

    /// Directory of password files named by pubkey
    pub secrets_dir: Option<PathBuf>,
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Disable core dumps
    pub disable_core_dumps: bool,

    /// File holding the master password, used when the environment does not
    /// provide one
    pub master_password_file: Option<PathBuf>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            disable_core_dumps: true,
            master_password_file: None,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = config::Config::try_from(&Config::default())
            .map_err(|e| KeyManagerError::ConfigError(e.to_string()))?;

        let mut builder = config::Config::builder().add_source(defaults);

        // Load from file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        } else {
            // Try default locations
            builder = builder
                .add_source(config::File::with_name("keymanager").required(false))
                .add_source(config::File::with_name("/etc/keymanager/config").required(false));
        }

        // Load from environment (KEYMANAGER__SERVER__PORT, etc.)
        builder = builder.add_source(
            config::Environment::with_prefix("KEYMANAGER")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| KeyManagerError::ConfigError(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| KeyManagerError::ConfigError(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.max_body_bytes == 0 {
            return Err(KeyManagerError::ConfigError(
                "server.max_body_bytes must be positive".to_string(),
            ));
        }

        self.genesis_validators_root()?;

        if self.readonly.keystores_dir.is_some() != self.readonly.secrets_dir.is_some() {
            return Err(KeyManagerError::ConfigError(
                "readonly.keystores_dir and readonly.secrets_dir must be set together".to_string(),
            ));
        }

        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(KeyManagerError::ConfigError(format!(
                "unknown logging.format {:?}",
                self.logging.format
            )));
        }

        if self.storage.keys_dir == self.storage.slashing_dir {
            return Err(KeyManagerError::ConfigError(
                "storage.keys_dir and storage.slashing_dir must differ".to_string(),
            ));
        }

        if !self.storage.keys_dir.exists() {
            info!(
                "Key directory does not exist, will create: {:?}",
                self.storage.keys_dir
            );
        }

        Ok(())
    }

    /// Get the server address string
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.listen_addr, self.server.port)
    }

    pub fn genesis_validators_root(&self) -> Result<Root> {
        Root::from_hex(&self.slashing.genesis_validators_root).map_err(|e| {
            KeyManagerError::ConfigError(format!("slashing.genesis_validators_root: {}", e))
        })
    }

    pub fn kdf_cost(&self) -> KdfCost {
        KdfCost {
            memory_kib: self.storage.kdf_memory_kib,
            iterations: self.storage.kdf_iterations,
            lanes: self.storage.kdf_lanes,
        }
    }

    /// Master password protecting keys at rest: the environment first, then
    /// `security.master_password_file`
    pub fn master_password(&self) -> Result<SecretString> {
        if let Ok(password) = std::env::var(MASTER_PASSWORD_ENV) {
            if !password.is_empty() {
                return Ok(SecretString::new(password));
            }
        }

        let path = self.security.master_password_file.as_ref().ok_or_else(|| {
            KeyManagerError::ConfigError(format!(
                "set {} or security.master_password_file",
                MASTER_PASSWORD_ENV
            ))
        })?;

        let contents = std::fs::read_to_string(path).map_err(|e| {
            KeyManagerError::ConfigError(format!("cannot read {:?}: {}", path, e))
        })?;
        let password = contents.trim_end_matches(['\n', '\r']);
        if password.is_empty() {
            return Err(KeyManagerError::ConfigError(format!(
                "master password file {:?} is empty",
                path
            )));
        }
        Ok(SecretString::new(password.to_string()))
    }
}
