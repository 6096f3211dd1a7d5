//! Request and response bodies of the keymanager API

use crate::crypto::PublicKey;
use crate::keystore::KeyInfo;
use crate::manager::{DeletionStatus, ImportStatus};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Serialize)]
pub struct ListKeystoresResponse {
    pub data: Vec<KeystoreEntry>,
}

#[derive(Debug, Serialize)]
pub struct KeystoreEntry {
    pub validating_pubkey: PublicKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub derivation_path: Option<String>,
    pub readonly: bool,
}

impl From<KeyInfo> for KeystoreEntry {
    fn from(info: KeyInfo) -> Self {
        Self {
            validating_pubkey: info.pubkey,
            derivation_path: info.derivation_path,
            readonly: info.readonly,
        }
    }
}

#[derive(Deserialize)]
pub struct ImportKeystoresRequest {
    #[serde(deserialize_with = "keystore_documents")]
    pub keystores: Vec<String>,
    pub passwords: Vec<String>,
    #[serde(default, alias = "slashingProtection")]
    pub slashing_protection: Option<String>,
}

impl ImportKeystoresRequest {
    /// Split into keystores, wrapped passwords and the protection payload
    pub fn into_parts(self) -> (Vec<String>, Vec<SecretString>, Option<String>) {
        let passwords = self.passwords.into_iter().map(SecretString::new).collect();
        (self.keystores, passwords, self.slashing_protection)
    }
}

/// Keystores arrive as JSON-encoded strings; some clients send the objects
/// themselves.
fn keystore_documents<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<String>, D::Error> {
    let values = Vec::<serde_json::Value>::deserialize(deserializer)?;
    values
        .into_iter()
        .map(|value| match value {
            serde_json::Value::String(s) => Ok(s),
            serde_json::Value::Object(_) => Ok(value.to_string()),
            other => Err(serde::de::Error::custom(format!(
                "keystore must be a string or object, got {}",
                other
            ))),
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct ImportKeystoresResponse {
    pub data: Vec<StatusEntry>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteKeystoresRequest {
    pub pubkeys: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DeleteKeystoresResponse {
    pub data: Vec<StatusEntry>,
    pub slashing_protection: String,
}

/// One per-item outcome
#[derive(Debug, Serialize)]
pub struct StatusEntry {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&ImportStatus> for StatusEntry {
    fn from(status: &ImportStatus) -> Self {
        Self {
            status: status.as_str(),
            message: status.message().map(str::to_string),
        }
    }
}

impl From<&DeletionStatus> for StatusEntry {
    fn from(status: &DeletionStatus) -> Self {
        Self {
            status: status.as_str(),
            message: status.message().map(str::to_string),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub keys_loaded: usize,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_request_aliases_and_objects() {
        let body = r#"{
            "keystores": ["{\"version\":4}", {"version": 4}],
            "passwords": ["a", "b"],
            "slashingProtection": "{}"
        }"#;
        let request: ImportKeystoresRequest = serde_json::from_str(body).unwrap();
        assert_eq!(request.keystores.len(), 2);
        assert_eq!(request.keystores[1], r#"{"version":4}"#);

        let (_, passwords, protection) = request.into_parts();
        assert_eq!(passwords.len(), 2);
        assert_eq!(protection.as_deref(), Some("{}"));
    }

    #[test]
    fn test_status_entry_omits_empty_message() {
        let json = serde_json::to_value(StatusEntry::from(&DeletionStatus::NotActive)).unwrap();
        assert_eq!(json, serde_json::json!({"status": "not_active"}));

        let json =
            serde_json::to_value(StatusEntry::from(&ImportStatus::Error("boom".into()))).unwrap();
        assert_eq!(json, serde_json::json!({"status": "error", "message": "boom"}));
    }
}
