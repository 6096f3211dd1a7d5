//! Batch key deletion
//!
//! Every key in the batch is revoked (its encrypted document removed and the
//! removal flushed) before the protection export is collated, so a client
//! never receives history for a key that can still sign.

use crate::crypto::PublicKey;
use crate::errors::KeyManagerError;
use crate::keystore::KeyStore;
use crate::locks::PubkeyLocks;
use crate::manager::status::DeletionStatus;
use crate::slashing::{Interchange, InterchangeData, SlashingProtectionStore};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Statuses for a delete batch plus the protection history of the deleted keys
#[derive(Debug, Clone)]
pub struct DeleteOutcome {
    pub statuses: Vec<DeletionStatus>,
    pub slashing_protection: Interchange,
}

#[derive(Clone)]
pub struct DeletionCoordinator {
    key_store: Arc<KeyStore>,
    slashing: Arc<SlashingProtectionStore>,
    locks: Arc<PubkeyLocks>,
}

impl DeletionCoordinator {
    pub fn new(
        key_store: Arc<KeyStore>,
        slashing: Arc<SlashingProtectionStore>,
        locks: Arc<PubkeyLocks>,
    ) -> Self {
        Self {
            key_store,
            slashing,
            locks,
        }
    }

    /// Delete a batch of keys. Never fails as a whole.
    pub fn delete_keystores(&self, pubkeys: &[String]) -> DeleteOutcome {
        let mut statuses = Vec::with_capacity(pubkeys.len());
        let mut exported = Vec::new();

        for raw in pubkeys {
            let pubkey = match PublicKey::from_hex(raw) {
                Ok(pk) => pk,
                Err(e) => {
                    warn!("Cannot delete {:?}: {}", raw, e);
                    statuses.push(DeletionStatus::Error(e.to_string()));
                    continue;
                }
            };

            let status = self.revoke(&pubkey);
            if status.is_exported() {
                exported.push(pubkey);
            }
            statuses.push(status);
        }

        // All revocations above are durable at this point
        let slashing_protection = self.collate(&exported);

        let deleted = statuses
            .iter()
            .filter(|s| **s == DeletionStatus::Deleted)
            .count();
        info!(
            "Deleted {}/{} keys, exported {} protection records",
            deleted,
            statuses.len(),
            slashing_protection.data.len()
        );

        DeleteOutcome {
            statuses,
            slashing_protection,
        }
    }

    /// Export for every listed key, in first-seen order. A deleted key whose
    /// record could not be written appears with an empty history.
    fn collate(&self, pubkeys: &[PublicKey]) -> Interchange {
        let mut interchange = Interchange::new(self.slashing.genesis_validators_root());
        let mut seen = HashSet::new();

        for pubkey in pubkeys.iter().filter(|pk| seen.insert(**pk)) {
            let data = self
                .slashing
                .export(std::slice::from_ref(pubkey))
                .data
                .pop()
                .unwrap_or_else(|| InterchangeData {
                    pubkey: *pubkey,
                    signed_blocks: Vec::new(),
                    signed_attestations: Vec::new(),
                });
            interchange.data.push(data);
        }

        interchange
    }

    fn revoke(&self, pubkey: &PublicKey) -> DeletionStatus {
        let _guard = self.locks.lock(pubkey);

        match self.key_store.remove(pubkey) {
            Ok(_) => {
                if !self.slashing.has_record(pubkey) {
                    // Deleted keys always appear in the export
                    if let Err(e) = self.slashing.register(pubkey) {
                        error!("Deleted {} but could not record its history: {}", pubkey, e);
                    }
                }
                DeletionStatus::Deleted
            }
            Err(KeyManagerError::KeyNotFound(_)) => {
                if self.slashing.has_record(pubkey) {
                    debug!("Key {} is not active", pubkey);
                    DeletionStatus::NotActive
                } else {
                    debug!("Key {} is unknown", pubkey);
                    DeletionStatus::NotFound
                }
            }
            Err(e) => {
                warn!("Failed to delete {}: {}", pubkey, e);
                DeletionStatus::Error(e.to_string())
            }
        }
    }
}
