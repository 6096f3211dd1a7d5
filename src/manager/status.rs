//! Per-item outcomes of batch operations

use std::fmt;

/// Outcome of importing one keystore
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportStatus {
    Imported,
    Duplicate,
    Error(String),
}

/// Outcome of deleting one public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionStatus {
    Deleted,
    NotActive,
    NotFound,
    Error(String),
}

impl ImportStatus {
    /// Wire name of the variant
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Imported => "imported",
            ImportStatus::Duplicate => "duplicate",
            ImportStatus::Error(_) => "error",
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            ImportStatus::Error(msg) => Some(msg),
            _ => None,
        }
    }
}

impl DeletionStatus {
    /// Wire name of the variant
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionStatus::Deleted => "deleted",
            DeletionStatus::NotActive => "not_active",
            DeletionStatus::NotFound => "not_found",
            DeletionStatus::Error(_) => "error",
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            DeletionStatus::Error(msg) => Some(msg),
            _ => None,
        }
    }

    /// Whether this key's protection history belongs in the export
    pub fn is_exported(&self) -> bool {
        matches!(self, DeletionStatus::Deleted | DeletionStatus::NotActive)
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{}: {}", self.as_str(), msg),
            None => f.write_str(self.as_str()),
        }
    }
}

impl fmt::Display for DeletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{}: {}", self.as_str(), msg),
            None => f.write_str(self.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(DeletionStatus::NotActive.as_str(), "not_active");
        assert_eq!(DeletionStatus::NotFound.to_string(), "not_found");
        assert_eq!(
            ImportStatus::Error("bad password".into()).to_string(),
            "error: bad password"
        );
        assert!(DeletionStatus::NotActive.is_exported());
        assert!(!DeletionStatus::Error("io".into()).is_exported());
    }
}
