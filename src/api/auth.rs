//! Authentication for the REST API
//!
//! Provides:
//! - Bearer token validation
//! - Token file loading and first-run generation

use crate::crypto::constant_time_eq;
use crate::errors::{KeyManagerError, Result};
use axum::http::{header, HeaderMap};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

/// Length of generated tokens in bytes
const TOKEN_BYTES: usize = 32;

/// Authentication service
pub struct AuthService {
    /// Expected bearer token; `None` disables authentication
    token: Option<SecretString>,
}

impl AuthService {
    /// Require `token` on every request
    pub fn new(token: SecretString) -> Self {
        Self { token: Some(token) }
    }

    /// Accept every request
    pub fn disabled() -> Self {
        Self { token: None }
    }

    /// Read the token from `path`, generating and writing one if the file
    /// does not exist yet
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let contents = fs::read_to_string(path)?;
            let token = contents.trim();
            if token.is_empty() {
                return Err(KeyManagerError::ConfigError(format!(
                    "API token file {:?} is empty",
                    path
                )));
            }
            debug!("Loaded API token from {:?}", path);
            return Ok(Self::new(SecretString::new(token.to_string())));
        }

        let mut bytes = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = format!("api-token-0x{}", hex::encode(bytes));

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(token.as_bytes())?;
        file.sync_all()?;

        info!("Generated API token at {:?}", path);
        Ok(Self::new(SecretString::new(token)))
    }

    /// Check the `Authorization` header of a request
    pub fn validate_headers(&self, headers: &HeaderMap) -> Result<()> {
        let Some(expected) = &self.token else {
            return Ok(());
        };

        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                KeyManagerError::Unauthorized("Missing authorization header".to_string())
            })?;

        let provided = provided.strip_prefix("Bearer ").ok_or_else(|| {
            KeyManagerError::Unauthorized("Expected a bearer token".to_string())
        })?;

        if constant_time_eq(provided.trim().as_bytes(), expected.expose_secret().as_bytes()) {
            Ok(())
        } else {
            Err(KeyManagerError::Unauthorized("Invalid API token".to_string()))
        }
    }

    /// Is auth required?
    pub fn is_auth_required(&self) -> bool {
        self.token.is_some()
    }
}

impl Default for AuthService {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use tempfile::tempdir;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_auth_disabled() {
        let auth = AuthService::disabled();
        assert!(auth.validate_headers(&HeaderMap::new()).is_ok());
        assert!(!auth.is_auth_required());
    }

    #[test]
    fn test_bearer_token() {
        let auth = AuthService::new(SecretString::new("s3cret".to_string()));

        assert!(auth.validate_headers(&headers("Bearer s3cret")).is_ok());
        assert!(matches!(
            auth.validate_headers(&headers("Bearer wrong")),
            Err(KeyManagerError::Unauthorized(_))
        ));
        assert!(matches!(
            auth.validate_headers(&headers("s3cret")),
            Err(KeyManagerError::Unauthorized(_))
        ));
        assert!(matches!(
            auth.validate_headers(&HeaderMap::new()),
            Err(KeyManagerError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_token_file_is_generated_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("auth").join("api-token.txt");

        AuthService::load_or_create(&path).unwrap();
        let token = fs::read_to_string(&path).unwrap();
        assert!(token.starts_with("api-token-0x"));

        let reloaded = AuthService::load_or_create(&path).unwrap();
        assert!(reloaded
            .validate_headers(&headers(&format!("Bearer {}", token)))
            .is_ok());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
